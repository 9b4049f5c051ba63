// CLI integration tests: one process per command against a temp database.
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_dblite");
    Command::new(exe)
}

fn parse_json(value: &str) -> Value {
    serde_json::from_str(value).expect("valid json")
}

fn json_lines(output: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(output)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_json)
        .collect()
}

struct Fixture {
    _temp: tempfile::TempDir,
    schema: PathBuf,
    location: String,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let schema = temp.path().join("product.json");
        std::fs::write(
            &schema,
            r#"{"kind": "product", "fields": [
                {"name": "name", "type": "text"},
                {"name": "price", "type": "integer"},
                {"name": "catalog_url", "type": "text unique"},
                {"name": "description", "serializer": "compressed_str"}
            ]}"#,
        )
        .expect("write schema");
        let location = format!("sqlite://{}:product", temp.path().join("shop.sqlite").display());
        Self {
            _temp: temp,
            schema,
            location,
        }
    }

    fn run(&self, args: &[&str]) -> Output {
        run_with_schema(&self.schema, &self.location, args)
    }
}

fn run_with_schema(schema: &Path, location: &str, args: &[&str]) -> Output {
    cmd()
        .arg("--schema")
        .arg(schema)
        .arg(location)
        .args(args)
        .output()
        .expect("spawn dblite")
}

#[test]
fn init_put_get_count_delete_flow() {
    let fixture = Fixture::new();

    let init = fixture.run(&["init"]);
    assert!(init.status.success());
    let init_json = &json_lines(&init.stdout)[0];
    assert_eq!(init_json["kind"], "product");
    assert_eq!(init_json["fields"][0], "_id");
    assert_eq!(init_json["columns"].as_array().unwrap().len(), 5);

    let put = fixture.run(&[
        "put",
        r#"[{"name": "Laptop", "price": 100, "description": "thin"}, {"name": "Desktop", "price": 80}]"#,
    ]);
    assert!(put.status.success());
    assert_eq!(json_lines(&put.stdout)[0]["ids"], serde_json::json!([1, 2]));

    let get = fixture.run(&["get", "--where", r#"{"name": "/%top%/"}"#]);
    assert!(get.status.success());
    let rows = json_lines(&get.stdout);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], "Laptop");
    assert_eq!(rows[0]["description"], "thin");
    assert!(rows[1]["description"].is_null());

    let limited = fixture.run(&["get", "--limit", "1"]);
    assert_eq!(json_lines(&limited.stdout).len(), 1);

    let one = fixture.run(&["get-one", "--where", r#"{"price": 80}"#]);
    assert_eq!(json_lines(&one.stdout)[0]["name"], "Desktop");

    let missing = fixture.run(&["get-one", "--where", r#"{"name": "Nettop"}"#]);
    assert!(json_lines(&missing.stdout)[0].is_null());

    let count = fixture.run(&["count"]);
    assert_eq!(json_lines(&count.stdout)[0]["count"], 2);

    let delete = fixture.run(&["delete", "--where", r#"{"name": "Laptop"}"#]);
    assert!(delete.status.success());
    assert_eq!(json_lines(&delete.stdout)[0]["deleted"], 1);

    let delete_all = fixture.run(&["delete", "--all"]);
    assert_eq!(json_lines(&delete_all.stdout)[0]["deleted"], 1);
    let count = fixture.run(&["count"]);
    assert_eq!(json_lines(&count.stdout)[0]["count"], 0);
}

#[test]
fn sql_command_reads_and_writes() {
    let fixture = Fixture::new();
    let insert = fixture.run(&[
        "sql",
        "INSERT INTO product (name, price) VALUES (?, ?)",
        "--param",
        r#""Laptop""#,
        "--param",
        "100",
    ]);
    assert!(insert.status.success());
    assert_eq!(json_lines(&insert.stdout)[0]["ok"], true);

    let select = fixture.run(&["sql", "SELECT name, price FROM product"]);
    assert!(select.status.success());
    let rows = json_lines(&select.stdout);
    assert_eq!(rows, vec![serde_json::json!({"name": "Laptop", "price": 100})]);
}

#[test]
fn duplicate_put_exit_code() {
    let fixture = Fixture::new();
    let first = fixture.run(&["put", r#"{"catalog_url": "http://catalog/1"}"#]);
    assert!(first.status.success());

    let second = fixture.run(&["put", r#"{"catalog_url": "http://catalog/1"}"#]);
    assert_eq!(second.status.code(), Some(7));
    let err = parse_json(String::from_utf8_lossy(&second.stderr).trim());
    assert_eq!(err["error"]["kind"], "DuplicateItem");
    assert_eq!(err["error"]["fields"][0], "catalog_url");
}

#[test]
fn query_and_usage_exit_codes() {
    let fixture = Fixture::new();

    let unknown_field = fixture.run(&["get", "--where", r#"{"color": "red"}"#]);
    assert_eq!(unknown_field.status.code(), Some(5));
    let err = parse_json(String::from_utf8_lossy(&unknown_field.stderr).trim());
    assert_eq!(err["error"]["kind"], "Query");

    let empty_delete = fixture.run(&["delete"]);
    assert_eq!(empty_delete.status.code(), Some(2));

    let bad_json = fixture.run(&["put", "{not json"]);
    assert_eq!(bad_json.status.code(), Some(2));

    let unknown_command = fixture.run(&["frobnicate"]);
    assert_eq!(unknown_command.status.code(), Some(2));
    let err = parse_json(String::from_utf8_lossy(&unknown_command.stderr).trim());
    assert_eq!(err["error"]["kind"], "Usage");
}

#[test]
fn config_and_schema_exit_codes() {
    let fixture = Fixture::new();

    let bad_location = run_with_schema(&fixture.schema, "postgres://db:product", &["count"]);
    assert_eq!(bad_location.status.code(), Some(3));

    let schema_dir = fixture.schema.parent().expect("schema dir");
    let empty_schema = schema_dir.join("empty.json");
    std::fs::write(&empty_schema, r#"{"kind": "product", "fields": []}"#).expect("write");
    let no_fields = run_with_schema(&empty_schema, &fixture.location, &["init"]);
    assert_eq!(no_fields.status.code(), Some(4));

    let missing_schema = run_with_schema(&schema_dir.join("absent.json"), &fixture.location, &["init"]);
    assert_eq!(missing_schema.status.code(), Some(9));
}
