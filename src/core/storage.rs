//! Purpose: `Storage` handle: put/get/delete/commit/raw SQL over one schema-mapped table.
//! Exports: `Storage`, `Records`, `SqlQuery`, `SqlRows`, `Delete`.
//! Role: Façade tying schema, serializers, query compiler, and the SQLite connection together.
//! Invariants: Input shape, serialization, and query errors surface before any connection I/O.
//! Invariants: Writes stay in an open transaction until `commit` (manual or autocommit).
//! Invariants: After `close`, every operation fails with `ErrorKind::Usage`.
//! Invariants: A handle is single-threaded (`!Sync`); callers serialize access externally.
use std::cell::Cell;
use std::collections::VecDeque;

use rusqlite::{Connection, Statement, params_from_iter};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::core::engine;
use crate::core::error::{Error, ErrorKind};
use crate::core::options::{Location, StorageOptions};
use crate::core::query::{self, CompiledWhere, Query};
use crate::core::record::Record;
use crate::core::schema::{ID_FIELD, Schema};
use crate::core::value::Value;

/// What a `delete` call removes. Removing every row requires `All`.
#[derive(Clone, Copy, Debug)]
pub enum Delete<'a> {
    Matching(&'a Query),
    Record(&'a Record),
    All,
}

#[derive(Debug)]
pub struct Storage {
    conn: Option<Connection>,
    schema: Schema,
    location: Location,
    options: StorageOptions,
    pending: Cell<usize>,
}

impl Storage {
    pub fn open(schema: Schema, location: Location, options: StorageOptions) -> Result<Self, Error> {
        location.validate()?;
        options.validate()?;

        let conn = engine::open_connection(&location)?;
        engine::register_regexp(&conn)?;
        engine::ensure_table(&conn, &schema, location.table(), location.path())?;

        info!(
            location = %location,
            kind = schema.kind(),
            fields = schema.fields().len(),
            "storage opened"
        );
        Ok(Self {
            conn: Some(conn),
            schema,
            location,
            options,
            pending: Cell::new(0),
        })
    }

    /// Opens a store for a JSON record-kind declaration (see `Schema::derive`).
    pub fn open_declared(
        decl: &JsonValue,
        location: Location,
        options: StorageOptions,
    ) -> Result<Self, Error> {
        let schema = Schema::derive(decl)?;
        Self::open(schema, location, options)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn fieldnames(&self) -> Vec<&str> {
        self.schema.fieldnames()
    }

    /// Writes since the last commit or rollback.
    pub fn pending_writes(&self) -> usize {
        self.pending.get()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Columns of the backing table as the engine reports them.
    pub fn table_columns(&self) -> Result<Vec<String>, Error> {
        let conn = self.conn()?;
        engine::table_columns(conn, self.location.table()).map_err(engine::classify)
    }

    /// Inserts `record` when it has no `_id` (storing the assigned id back into
    /// it), otherwise updates the row with that identity.
    pub fn put(&self, record: &mut Record) -> Result<i64, Error> {
        record.check_fields(&self.schema)?;
        let (columns, values) = self.serialize_record(record)?;
        let conn = self.conn()?;
        let id = self.write_record(conn, record, &columns, values)?;
        self.note_writes(1)?;
        Ok(id)
    }

    /// Puts records in order. A failing item aborts the rest; earlier items
    /// stay applied in the open transaction.
    pub fn put_many(&self, records: &mut [Record]) -> Result<Vec<i64>, Error> {
        let prepared = records
            .iter()
            .map(|record| {
                record.check_fields(&self.schema)?;
                self.serialize_record(record)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let conn = self.conn()?;
        let mut ids = Vec::with_capacity(records.len());
        for (record, (columns, values)) in records.iter_mut().zip(prepared) {
            ids.push(self.write_record(conn, record, &columns, values)?);
            self.note_writes(1)?;
        }
        Ok(ids)
    }

    /// Puts a JSON object or an array of JSON objects.
    pub fn put_json(&self, value: &JsonValue) -> Result<Vec<i64>, Error> {
        match value {
            JsonValue::Object(_) => {
                let mut record = Record::from_json(&self.schema, value)?;
                Ok(vec![self.put(&mut record)?])
            }
            JsonValue::Array(items) => {
                let mut records = items
                    .iter()
                    .map(|item| {
                        if !item.is_object() {
                            return Err(Error::new(ErrorKind::Usage)
                                .with_message("batch items must be JSON objects")
                                .with_hint(r#"Example: [{"name": "a"}, {"name": "b"}]"#));
                        }
                        Record::from_json(&self.schema, item)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.put_many(&mut records)
            }
            other => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("cannot put {other}; expected a record object"))),
        }
    }

    /// Lazily yields records matching `query` in `_id` order, at most `limit`.
    pub fn get(&self, query: &Query, limit: Option<usize>) -> Result<Records<'_>, Error> {
        let compiled = query::compile(query, &self.schema)?;
        self.conn()?;
        Ok(Records {
            storage: self,
            compiled,
            remaining: limit,
            last_id: None,
            page: VecDeque::new(),
            exhausted: false,
        })
    }

    pub fn get_one(&self, query: &Query) -> Result<Option<Record>, Error> {
        self.get(query, Some(1))?.next().transpose()
    }

    /// Deletes rows and returns how many were removed.
    pub fn delete(&self, target: Delete<'_>) -> Result<usize, Error> {
        let compiled = match target {
            Delete::All => CompiledWhere::default(),
            Delete::Matching(query) => {
                if query.is_empty() {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("refusing to delete with an empty query")
                        .with_hint("Use Delete::All to remove every row"));
                }
                query::compile(query, &self.schema)?
            }
            Delete::Record(record) => {
                let Some(id) = record.id() else {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("record has no `_id`; it was never stored")
                        .with_field(ID_FIELD));
                };
                CompiledWhere {
                    clause: Some(format!("\"{ID_FIELD}\" = ?")),
                    params: vec![Value::Integer(id)],
                }
            }
        };

        let conn = self.conn()?;
        let sql = format!(
            "DELETE FROM \"{}\"{}",
            self.location.table(),
            compiled.where_sql()
        );
        begin_write(conn)?;
        let deleted = execute(conn, &sql, &compiled.params)?;
        self.note_writes(1)?;
        Ok(deleted)
    }

    pub fn commit(&self) -> Result<(), Error> {
        let conn = self.conn()?;
        if !conn.is_autocommit() {
            debug!(pending = self.pending.get(), "commit");
            conn.execute_batch("COMMIT").map_err(engine::classify)?;
        }
        self.pending.set(0);
        Ok(())
    }

    /// Discards writes since the last commit.
    pub fn rollback(&self) -> Result<(), Error> {
        let conn = self.conn()?;
        if !conn.is_autocommit() {
            debug!(pending = self.pending.get(), "rollback");
            conn.execute_batch("ROLLBACK").map_err(engine::classify)?;
        }
        self.pending.set(0);
        Ok(())
    }

    /// Runs caller-supplied SQL. Statements producing columns come back as a
    /// prepared `SqlQuery` whose rows stream lazily; others run immediately
    /// and return `None`.
    pub fn sql(&self, text: &str, params: &[Value]) -> Result<Option<SqlQuery<'_>>, Error> {
        let conn = self.conn()?;
        debug!(sql = %text, params = params.len(), "raw sql");
        let mut stmt = conn.prepare(text).map_err(engine::classify)?;
        let writes = !stmt.readonly();
        if writes {
            begin_write(conn)?;
        }

        if stmt.column_count() == 0 {
            stmt.execute(params_from_iter(params.iter()))
                .map_err(engine::classify)?;
            drop(stmt);
            if writes {
                self.note_writes(1)?;
            }
            return Ok(None);
        }

        Ok(Some(SqlQuery {
            storage: self,
            stmt,
            params: params.to_vec(),
            writes,
        }))
    }

    /// Row count visible to this session, uncommitted writes included.
    pub fn len(&self) -> Result<usize, Error> {
        let conn = self.conn()?;
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", self.location.table());
        let count: i64 = conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(engine::classify)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Releases the connection. Uncommitted writes are discarded.
    pub fn close(&mut self) -> Result<(), Error> {
        let conn = self.conn.take().ok_or_else(closed_error)?;
        if !conn.is_autocommit() {
            warn!(
                location = %self.location,
                pending = self.pending.get(),
                "closing with uncommitted writes; they are discarded"
            );
        }
        self.pending.set(0);
        conn.close().map_err(|(_, err)| {
            Error::new(ErrorKind::Io)
                .with_message("failed to close database")
                .with_path(self.location.path())
                .with_source(err)
        })?;
        info!(location = %self.location, "storage closed");
        Ok(())
    }

    fn conn(&self) -> Result<&Connection, Error> {
        self.conn.as_ref().ok_or_else(closed_error)
    }

    fn serialize_record(&self, record: &Record) -> Result<(Vec<&str>, Vec<Value>), Error> {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for field in self.schema.fields() {
            if let Some(value) = record.get(field.name()) {
                let stored = field.serializer().serialize(value).map_err(|err| {
                    let message = err.message().unwrap_or("serialization failed").to_string();
                    Error::new(ErrorKind::Serialization)
                        .with_message(message)
                        .with_field(field.name())
                        .with_source(err)
                })?;
                columns.push(field.name());
                values.push(stored);
            }
        }
        Ok((columns, values))
    }

    fn write_record(
        &self,
        conn: &Connection,
        record: &mut Record,
        columns: &[&str],
        mut values: Vec<Value>,
    ) -> Result<i64, Error> {
        let table = self.location.table();
        begin_write(conn)?;

        let Some(id) = record.id() else {
            let sql = if columns.is_empty() {
                format!("INSERT INTO \"{table}\" DEFAULT VALUES")
            } else {
                insert_sql(table, columns)
            };
            execute(conn, &sql, &values)?;
            let id = conn.last_insert_rowid();
            record.set_id(id);
            return Ok(id);
        };

        if columns.is_empty() {
            let sql = format!("INSERT OR IGNORE INTO \"{table}\" (\"{ID_FIELD}\") VALUES (?)");
            execute(conn, &sql, &[Value::Integer(id)])?;
            return Ok(id);
        }

        let assignments: Vec<String> = columns.iter().map(|c| format!("\"{c}\" = ?")).collect();
        let sql = format!(
            "UPDATE \"{table}\" SET {} WHERE \"{ID_FIELD}\" = ?",
            assignments.join(", ")
        );
        values.push(Value::Integer(id));
        if execute(conn, &sql, &values)? == 0 {
            // The row is gone; store it again under the same identity.
            let mut with_id = vec![ID_FIELD];
            with_id.extend_from_slice(columns);
            values.rotate_right(1);
            execute(conn, &insert_sql(table, &with_id), &values)?;
        }
        Ok(id)
    }

    fn note_writes(&self, writes: usize) -> Result<(), Error> {
        let pending = self.pending.get() + writes;
        self.pending.set(pending);
        if let Some(threshold) = self.options.autocommit.threshold() {
            if pending >= threshold {
                self.commit()?;
            }
        }
        Ok(())
    }

    fn page(
        &self,
        compiled: &CompiledWhere,
        after: Option<i64>,
        size: usize,
    ) -> Result<Vec<Vec<Value>>, Error> {
        let conn = self.conn()?;
        let mut conditions = Vec::new();
        let mut params = compiled.params.clone();
        if let Some(clause) = &compiled.clause {
            conditions.push(format!("({clause})"));
        }
        if let Some(last) = after {
            conditions.push(format!("\"{ID_FIELD}\" > ?"));
            params.push(Value::Integer(last));
        }
        params.push(Value::Integer(i64::try_from(size).unwrap_or(i64::MAX)));

        let columns: Vec<String> = self
            .schema
            .fieldnames()
            .iter()
            .map(|name| format!("\"{name}\""))
            .collect();
        let filter = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM \"{}\"{filter} ORDER BY \"{ID_FIELD}\" LIMIT ?",
            columns.join(", "),
            self.location.table()
        );
        debug!(sql = %sql, params = params.len(), "fetch page");

        let width = columns.len();
        let mut stmt = conn.prepare_cached(&sql).map_err(engine::classify)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| read_values(row, width))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(engine::classify)?;
        Ok(rows)
    }

    fn decode_row(&self, raw: Vec<Value>) -> Result<Record, Error> {
        let mut record = Record::new();
        for (name, stored) in self.schema.fieldnames().into_iter().zip(raw) {
            let value = decode_column(&self.schema, name, stored)?;
            record.set(name, value);
        }
        Ok(record)
    }
}

/// Forward-only cursor over `get` results, fetched in `_id`-ordered pages.
pub struct Records<'a> {
    storage: &'a Storage,
    compiled: CompiledWhere,
    remaining: Option<usize>,
    last_id: Option<i64>,
    page: VecDeque<Vec<Value>>,
    exhausted: bool,
}

impl Records<'_> {
    fn fill(&mut self) -> Result<(), Error> {
        let size = match self.remaining {
            Some(remaining) => remaining.min(self.storage.options.fetch_size),
            None => self.storage.options.fetch_size,
        };
        let rows = self.storage.page(&self.compiled, self.last_id, size)?;
        if rows.len() < size {
            self.exhausted = true;
        }
        if let Some(last) = rows.last().and_then(|row| row.first()).and_then(Value::as_i64) {
            self.last_id = Some(last);
        }
        self.page.extend(rows);
        Ok(())
    }
}

impl Iterator for Records<'_> {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        if self.page.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        let raw = self.page.pop_front()?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(self.storage.decode_row(raw))
    }
}

/// A prepared raw SQL read. Each `rows` call executes it again.
#[derive(Debug)]
pub struct SqlQuery<'a> {
    storage: &'a Storage,
    stmt: Statement<'a>,
    params: Vec<Value>,
    writes: bool,
}

impl SqlQuery<'_> {
    pub fn columns(&self) -> Vec<&str> {
        self.stmt.column_names()
    }

    pub fn rows(&mut self) -> Result<SqlRows<'_>, Error> {
        let names: Vec<String> = self
            .stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let rows = self
            .stmt
            .query(params_from_iter(self.params.iter()))
            .map_err(engine::classify)?;
        Ok(SqlRows {
            storage: self.storage,
            names,
            rows,
            writes: self.writes,
            done: false,
        })
    }
}

/// Forward-only rows of a raw SQL read; only the selected columns are
/// populated. Rows are stepped from the engine as the iterator advances.
pub struct SqlRows<'s> {
    storage: &'s Storage,
    names: Vec<String>,
    rows: rusqlite::Rows<'s>,
    writes: bool,
    done: bool,
}

impl SqlRows<'_> {
    pub fn columns(&self) -> &[String] {
        &self.names
    }
}

impl Iterator for SqlRows<'_> {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = match self.rows.next() {
            Ok(Some(row)) => read_values(row, self.names.len()).map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };
        let raw = match step {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.done = true;
                // The statement is reset once exhausted, so a commit can run.
                if self.writes {
                    if let Err(err) = self.storage.note_writes(1) {
                        return Some(Err(err));
                    }
                }
                return None;
            }
            Err(err) => {
                self.done = true;
                return Some(Err(engine::classify(err)));
            }
        };

        let mut record = Record::new();
        for (name, stored) in self.names.iter().zip(raw) {
            match decode_column(&self.storage.schema, name, stored) {
                Ok(value) => {
                    record.set(name.clone(), value);
                }
                Err(err) => return Some(Err(err)),
            }
        }
        Some(Ok(record))
    }
}

fn decode_column(schema: &Schema, name: &str, stored: Value) -> Result<Value, Error> {
    let Some(field) = schema.field(name) else {
        return Ok(stored);
    };
    field.serializer().deserialize(stored).map_err(|err| {
        let message = err.message().unwrap_or("deserialization failed").to_string();
        Error::new(ErrorKind::Serialization)
            .with_message(message)
            .with_field(name)
            .with_source(err)
    })
}

fn read_values(row: &rusqlite::Row<'_>, width: usize) -> rusqlite::Result<Vec<Value>> {
    (0..width).map(|idx| row.get::<_, Value>(idx)).collect()
}

fn insert_sql(table: &str, columns: &[&str]) -> String {
    let names: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO \"{table}\" ({}) VALUES ({placeholders})",
        names.join(", ")
    )
}

fn begin_write(conn: &Connection) -> Result<(), Error> {
    if conn.is_autocommit() {
        conn.execute_batch("BEGIN").map_err(engine::classify)?;
    }
    Ok(())
}

fn execute(conn: &Connection, sql: &str, params: &[Value]) -> Result<usize, Error> {
    debug!(sql = %sql, params = params.len(), "execute");
    let mut stmt = conn.prepare_cached(sql).map_err(engine::classify)?;
    stmt.execute(params_from_iter(params.iter()))
        .map_err(engine::classify)
}

fn closed_error() -> Error {
    Error::new(ErrorKind::Usage)
        .with_message("storage is closed")
        .with_hint("Open a new Storage handle")
}
