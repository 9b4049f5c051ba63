//! Purpose: Thin glue over rusqlite: open connections, register REGEXP, classify engine errors.
//! Exports: `open_connection`, `register_regexp`, `ensure_table`, `table_columns`, `classify`.
//! Role: The only module that interprets SQLite result codes and catalog tables.
//! Invariants: Uniqueness violations always classify as `DuplicateItem`, never `Sql`.
//! Invariants: Existing tables are validated, never altered.
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use rusqlite::ffi;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::options::Location;
use crate::core::schema::Schema;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) fn open_connection(location: &Location) -> Result<Connection, Error> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = if location.is_memory() {
        Connection::open_in_memory_with_flags(flags)
    } else {
        Connection::open_with_flags(location.path(), flags)
    };
    conn.map_err(|err| {
        Error::new(ErrorKind::Config)
            .with_message("cannot open database file")
            .with_path(location.path())
            .with_source(err)
    })
}

/// Installs `regexp(pattern, value)` so `value REGEXP pattern` works in SQL.
/// Search semantics: the pattern may match anywhere in the value.
pub(crate) fn register_regexp(conn: &Connection) -> Result<(), Error> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: Arc<Regex> = ctx.get_or_create_aux(0, |raw| -> Result<Regex, BoxError> {
                Ok(Regex::new(raw.as_str()?)?)
            })?;
            let matched = match ctx.get_raw(1) {
                ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                    .map(|text| pattern.is_match(text))
                    .unwrap_or(false),
                ValueRef::Integer(i) => pattern.is_match(&i.to_string()),
                ValueRef::Real(f) => pattern.is_match(&f.to_string()),
                ValueRef::Null | ValueRef::Blob(_) => false,
            };
            Ok(matched)
        },
    )
    .map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("cannot register REGEXP function")
            .with_source(err)
    })
}

/// Creates the table when absent; otherwise checks every schema column exists.
/// Extra columns in an existing table are tolerated.
pub(crate) fn ensure_table(
    conn: &Connection,
    schema: &Schema,
    table: &str,
    path: &Path,
) -> Result<(), Error> {
    let metadata_error = |err: rusqlite::Error| {
        Error::new(ErrorKind::Config)
            .with_message("cannot read database")
            .with_path(path)
            .with_source(err)
    };

    // PRAGMA table_info resolves names case-insensitively, as SQLite does.
    let existing = table_columns(conn, table).map_err(metadata_error)?;
    if existing.is_empty() {
        let sql = schema.create_table_sql(table);
        debug!(table, sql = %sql, "creating table");
        return conn.execute_batch(&sql).map_err(|err| {
            Error::new(ErrorKind::Schema)
                .with_message(format!("cannot create table `{table}`"))
                .with_path(path)
                .with_source(err)
        });
    }

    let columns: HashSet<String> = existing
        .iter()
        .map(|name| name.to_ascii_lowercase())
        .collect();
    let missing: Vec<&str> = schema
        .fieldnames()
        .into_iter()
        .filter(|name| !columns.contains(&name.to_ascii_lowercase()))
        .collect();
    if !missing.is_empty() {
        return Err(Error::new(ErrorKind::Schema)
            .with_message(format!("table `{table}` lacks declared columns"))
            .with_fields(missing)
            .with_path(path)
            .with_hint("Schema migrations are not supported; use a new table or database"));
    }
    Ok(())
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    names.collect()
}

/// Maps an engine failure onto the taxonomy: uniqueness violations become
/// `DuplicateItem` carrying the constrained columns, everything else `Sql`.
pub(crate) fn classify(err: rusqlite::Error) -> Error {
    if let Some(fields) = unique_violation_fields(&err) {
        return Error::new(ErrorKind::DuplicateItem)
            .with_message("uniqueness constraint violated")
            .with_fields(fields)
            .with_source(err);
    }
    Error::new(ErrorKind::Sql)
        .with_message(err.to_string())
        .with_source(err)
}

fn unique_violation_fields(err: &rusqlite::Error) -> Option<Vec<String>> {
    let rusqlite::Error::SqliteFailure(failure, message) = err else {
        return None;
    };
    if failure.code != ErrorCode::ConstraintViolation {
        return None;
    }
    if failure.extended_code != ffi::SQLITE_CONSTRAINT_UNIQUE
        && failure.extended_code != ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    {
        return None;
    }
    // "UNIQUE constraint failed: product.catalog_url, product.name"
    let fields = message
        .as_deref()
        .and_then(|message| message.split_once(": "))
        .map(|(_, columns)| {
            columns
                .split(", ")
                .map(|column| column.rsplit_once('.').map_or(column, |(_, name)| name))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(fields)
}
