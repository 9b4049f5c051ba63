//! Purpose: `dblite` CLI entry point over the schema-mapped storage library.
//! Role: Binary crate root; parses args, runs one storage command, emits JSON on stdout.
//! Invariants: Records are printed as one JSON object per line.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Mutating commands commit before the process exits.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value as JsonValue, json};
use tracing_subscriber::EnvFilter;

use dblite::api::{
    Delete, Error, ErrorKind, Location, Query, Schema, Storage, StorageOptions, Value, to_exit_code,
};

#[derive(Parser, Debug)]
#[command(
    name = "dblite",
    version,
    about = "Store and query schema-mapped records in SQLite",
    after_help = r#"EXAMPLES
  $ dblite --schema product.json sqlite://shop.sqlite:product init
  $ dblite --schema product.json sqlite://shop.sqlite:product put '{"name": "Laptop", "price": 100}'
  $ dblite --schema product.json sqlite://shop.sqlite:product get --where '{"name": "/%top%/"}'
  $ dblite --schema product.json sqlite://shop.sqlite:product delete --all

QUERIES
  {"name": "Laptop"}                       equality
  {"name": "/%top%/"}                      LIKE pattern
  {"name": "r/[Lap|Desk]top/"}             regular expression (search)
  {"$and": {"name": "x", "price": 1}}      all must hold"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        help = "JSON record-kind declaration: {\"kind\": ..., \"fields\": [...]}",
        value_hint = ValueHint::FilePath
    )]
    schema: PathBuf,
    #[arg(long, help = "Storage options as JSON, e.g. '{\"fetch_size\": 500}'")]
    options: Option<String>,
    #[arg(help = "Store location: sqlite://<path>:<table>")]
    location: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create the table if needed and print its fields")]
    Init,
    #[command(about = "Insert or update records (a JSON object or an array of objects)")]
    Put { json: String },
    #[command(about = "Print matching records, one JSON object per line")]
    Get {
        #[arg(long = "where", help = "Query expression as JSON")]
        filter: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    #[command(about = "Print the first matching record, or null")]
    GetOne {
        #[arg(long = "where", help = "Query expression as JSON")]
        filter: Option<String>,
    },
    #[command(about = "Delete matching records (or every record with --all)")]
    Delete {
        #[arg(long = "where", help = "Query expression as JSON", conflicts_with = "all")]
        filter: Option<String>,
        #[arg(long)]
        all: bool,
    },
    #[command(about = "Print the number of stored records")]
    Count,
    #[command(about = "Run raw SQL against the store")]
    Sql {
        text: String,
        #[arg(long = "param", help = "Positional parameter as a JSON scalar (repeatable)")]
        params: Vec<String>,
    },
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                return Ok(());
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `dblite --help`."));
            }
        },
    };

    let schema = load_schema(&cli.schema)?;
    let location = Location::parse(&cli.location)?;
    let options = match &cli.options {
        Some(raw) => StorageOptions::from_json(&parse_json_arg("--options", raw)?)?,
        None => StorageOptions::default(),
    };
    let storage = Storage::open(schema, location, options)?;
    execute(storage, cli.command)
}

/// Runs one command, then closes the store. A command failure is reported in
/// preference to a close failure.
fn execute(mut storage: Storage, command: Command) -> Result<(), Error> {
    let result = dispatch(&storage, command);
    let closed = storage.close();
    result.and(closed)
}

fn dispatch(storage: &Storage, command: Command) -> Result<(), Error> {
    match command {
        Command::Init => {
            emit_json(json!({
                "location": storage.location().to_string(),
                "kind": storage.schema().kind(),
                "fields": storage.fieldnames(),
                "columns": storage.table_columns()?,
            }));
        }
        Command::Put { json } => {
            let ids = storage.put_json(&parse_json_arg("put", &json)?)?;
            storage.commit()?;
            emit_json(json!({ "ids": ids }));
        }
        Command::Get { filter, limit } => {
            let query = parse_query(filter.as_deref())?;
            for record in storage.get(&query, limit)? {
                emit_json(record?.to_json());
            }
        }
        Command::GetOne { filter } => {
            let query = parse_query(filter.as_deref())?;
            let record = storage.get_one(&query)?;
            emit_json(record.map_or(JsonValue::Null, |record| record.to_json()));
        }
        Command::Delete { filter, all } => {
            let deleted = if all {
                storage.delete(Delete::All)?
            } else {
                let query = parse_query(filter.as_deref())?;
                storage.delete(Delete::Matching(&query))?
            };
            storage.commit()?;
            emit_json(json!({ "deleted": deleted }));
        }
        Command::Count => {
            emit_json(json!({ "count": storage.len()? }));
        }
        Command::Sql { text, params } => {
            let params = params
                .iter()
                .map(|raw| {
                    let value = parse_json_arg("--param", raw)?;
                    Value::from_json(&value).ok_or_else(|| {
                        Error::new(ErrorKind::Usage)
                            .with_message(format!("--param must be a JSON scalar, got {raw}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            match storage.sql(&text, &params)? {
                Some(mut query) => {
                    for record in query.rows()? {
                        emit_json(record?.to_json());
                    }
                    storage.commit()?;
                }
                None => {
                    storage.commit()?;
                    emit_json(json!({ "ok": true }));
                }
            }
        }
    }
    Ok(())
}

fn load_schema(path: &Path) -> Result<Schema, Error> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read schema file")
            .with_path(path)
            .with_source(err)
    })?;
    let decl: JsonValue = serde_json::from_str(&text).map_err(|err| {
        Error::new(ErrorKind::Schema)
            .with_message("schema file is not valid JSON")
            .with_path(path)
            .with_source(err)
    })?;
    Schema::derive(&decl).map_err(|err| err.with_path(path))
}

fn parse_query(filter: Option<&str>) -> Result<Query, Error> {
    match filter {
        Some(raw) => Query::parse(&parse_json_arg("--where", raw)?),
        None => Ok(Query::all()),
    }
}

fn parse_json_arg(name: &str, raw: &str) -> Result<JsonValue, Error> {
    serde_json::from_str(raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("{name} expects JSON"))
            .with_hint(format!("Could not parse `{raw}`"))
            .with_source(err)
    })
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn emit_json(value: JsonValue) {
    let json = serde_json::to_string(&value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Config => "invalid configuration".to_string(),
        ErrorKind::Schema => "invalid schema".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Query => "invalid query".to_string(),
        ErrorKind::Serialization => "serialization failed".to_string(),
        ErrorKind::DuplicateItem => "duplicate item".to_string(),
        ErrorKind::Sql => "sql error".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> JsonValue {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if !err.fields().is_empty() {
        inner.insert("fields".to_string(), json!(err.fields()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), JsonValue::Object(inner));
    JsonValue::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if !err.fields().is_empty() {
        lines.push(format!("fields: {}", err.fields().join(", ")));
    }
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{Command, error_json, execute, parse_query};
    use dblite::api::{Error, ErrorKind, Field, Location, Schema, Storage, StorageOptions};

    #[test]
    fn error_json_carries_kind_fields_and_hint() {
        let err = Error::new(ErrorKind::DuplicateItem)
            .with_message("uniqueness constraint violated")
            .with_field("catalog_url")
            .with_hint("pick another url");
        let value = error_json(&err);
        let inner = value.get("error").expect("error object");
        assert_eq!(inner["kind"], "DuplicateItem");
        assert_eq!(inner["fields"][0], "catalog_url");
        assert_eq!(inner["hint"], "pick another url");
    }

    #[test]
    fn missing_filter_means_all_rows() {
        assert!(parse_query(None).unwrap().is_empty());
        assert_eq!(
            parse_query(Some("not json")).unwrap_err().kind(),
            ErrorKind::Usage
        );
    }

    #[test]
    fn command_error_is_kept_when_close_also_fails() {
        let schema = Schema::builder("product")
            .field(Field::text("name"))
            .build()
            .unwrap();
        let mut storage =
            Storage::open(schema, Location::in_memory("product"), StorageOptions::new()).unwrap();
        storage.close().unwrap();

        let err = execute(
            storage,
            Command::Get {
                filter: Some(r#"{"color": "red"}"#.to_string()),
                limit: None,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);
    }
}
