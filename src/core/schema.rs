//! Purpose: Declare record kinds as ordered field descriptors and derive table DDL from them.
//! Exports: `Schema`, `SchemaBuilder`, `Field`, `StorageType`, `ID_FIELD`, `is_identifier`.
//! Role: Validated once at construction; storage and query layers only read it.
//! Invariants: A schema has at least one declared field and unique, identifier-safe names.
//! Invariants: The `_id` identity column is implicit and never carries a custom serializer.
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::core::error::{Error, ErrorKind};
use crate::core::serializer::{self, Serializer};

pub const ID_FIELD: &str = "_id";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageType {
    Text,
    Integer,
    Real,
    Numeric,
    Blob,
}

impl StorageType {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Numeric => "NUMERIC",
            Self::Blob => "BLOB",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "integer" | "int" => Some(Self::Integer),
            "real" | "float" => Some(Self::Real),
            "numeric" => Some(Self::Numeric),
            "blob" => Some(Self::Blob),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Field {
    name: String,
    storage_type: StorageType,
    unique: bool,
    serializer: Arc<dyn Serializer>,
}

impl Field {
    pub fn new(name: impl Into<String>, storage_type: StorageType) -> Self {
        Self {
            name: name.into(),
            storage_type,
            unique: false,
            serializer: serializer::identity(),
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, StorageType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, StorageType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, StorageType::Real)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, StorageType::Blob)
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_serializer(mut self, serializer: impl Serializer + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    pub fn with_shared_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn serializer(&self) -> &dyn Serializer {
        self.serializer.as_ref()
    }

    fn column_sql(&self) -> String {
        let mut sql = format!("\"{}\" {}", self.name, self.storage_type.sql());
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        sql
    }
}

#[derive(Clone)]
pub struct Schema {
    kind: String,
    fields: Vec<Field>,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("kind", &self.kind)
            .field("fields", &self.fieldnames())
            .finish()
    }
}

impl Schema {
    pub fn builder(kind: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    /// Builds a schema from a JSON record-kind declaration:
    ///
    /// ```json
    /// {"kind": "product", "fields": [
    ///     {"name": "name", "type": "text"},
    ///     {"name": "catalog_url", "type": "text unique"},
    ///     {"name": "description", "serializer": "compressed_str"}
    /// ]}
    /// ```
    pub fn derive(decl: &JsonValue) -> Result<Self, Error> {
        if decl.is_null() {
            return Err(Error::new(ErrorKind::Schema).with_message("missing record kind"));
        }
        let Some(obj) = decl.as_object() else {
            return Err(not_a_record_kind("declaration is not an object"));
        };
        let Some(fields) = obj.get("fields").and_then(JsonValue::as_array) else {
            return Err(not_a_record_kind("declaration has no `fields` array"));
        };
        let kind = match obj.get("kind") {
            None => "record",
            Some(kind) => kind
                .as_str()
                .ok_or_else(|| not_a_record_kind("`kind` must be a string"))?,
        };

        let mut builder = Self::builder(kind);
        for field in fields {
            builder = builder.field(field_from_json(field)?);
        }
        builder.build()
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// True for declared fields and the implicit identity column.
    pub fn has_column(&self, name: &str) -> bool {
        name == ID_FIELD || self.field(name).is_some()
    }

    /// Identity column first, then declared fields in declaration order.
    pub fn fieldnames(&self) -> Vec<&str> {
        std::iter::once(ID_FIELD)
            .chain(self.fields.iter().map(|field| field.name.as_str()))
            .collect()
    }

    pub fn column_list(&self) -> Vec<(&str, StorageType, bool)> {
        self.fields
            .iter()
            .map(|field| (field.name.as_str(), field.storage_type, field.unique))
            .collect()
    }

    pub fn create_table_sql(&self, table: &str) -> String {
        let mut columns = vec![format!("\"{ID_FIELD}\" INTEGER PRIMARY KEY AUTOINCREMENT")];
        columns.extend(self.fields.iter().map(Field::column_sql));
        format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" ({})",
            columns.join(", ")
        )
    }
}

pub struct SchemaBuilder {
    kind: String,
    fields: Vec<Field>,
}

impl SchemaBuilder {
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn build(self) -> Result<Schema, Error> {
        if self.kind.trim().is_empty() {
            return Err(Error::new(ErrorKind::Schema).with_message("record kind name is empty"));
        }

        // A caller may spell out the identity column; it is implicit either way.
        let fields: Vec<Field> = self
            .fields
            .into_iter()
            .filter(|field| !field.name.eq_ignore_ascii_case(ID_FIELD))
            .collect();
        if fields.is_empty() {
            return Err(Error::new(ErrorKind::Schema)
                .with_message(format!("record kind `{}` declares no fields", self.kind)));
        }

        // SQLite column names compare case-insensitively.
        let mut seen = HashSet::new();
        for field in &fields {
            if !is_identifier(&field.name) || field.name.to_ascii_lowercase().starts_with("sqlite_")
            {
                return Err(Error::new(ErrorKind::Schema)
                    .with_message(format!("invalid field name `{}`", field.name))
                    .with_field(field.name.clone())
                    .with_hint("Field names must match [A-Za-z_][A-Za-z0-9_]*"));
            }
            if !seen.insert(field.name.to_ascii_lowercase()) {
                return Err(Error::new(ErrorKind::Schema)
                    .with_message(format!("field `{}` declared twice", field.name))
                    .with_field(field.name.clone()));
            }
        }

        Ok(Schema {
            kind: self.kind,
            fields,
        })
    }
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn not_a_record_kind(detail: &str) -> Error {
    Error::new(ErrorKind::Schema)
        .with_message(format!("not a record kind: {detail}"))
        .with_hint(r#"Expected {"kind": "...", "fields": [{"name": "...", "type": "text"}]}"#)
}

fn field_from_json(decl: &JsonValue) -> Result<Field, Error> {
    let name = decl
        .get("name")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| Error::new(ErrorKind::Schema).with_message("field declaration needs a `name`"))?;

    let type_decl = match decl.get("type") {
        None => "text",
        Some(value) => value.as_str().ok_or_else(|| {
            Error::new(ErrorKind::Schema)
                .with_message("field `type` must be a string")
                .with_field(name)
        })?,
    };
    let mut words = type_decl.split_whitespace();
    let storage_type = words
        .next()
        .map(|word| {
            StorageType::parse(word).ok_or_else(|| {
                Error::new(ErrorKind::Schema)
                    .with_message(format!("unknown storage type `{word}`"))
                    .with_field(name)
            })
        })
        .transpose()?
        .unwrap_or(StorageType::Text);

    let mut field = Field::new(name, storage_type);
    for word in words {
        if word.eq_ignore_ascii_case("unique") {
            field = field.unique();
        } else {
            return Err(Error::new(ErrorKind::Schema)
                .with_message(format!("unknown column constraint `{word}`"))
                .with_field(name));
        }
    }

    if let Some(serializer) = decl.get("serializer") {
        let serializer_name = serializer.as_str().ok_or_else(|| {
            Error::new(ErrorKind::Schema)
                .with_message("field `serializer` must be a string")
                .with_field(name)
        })?;
        field = field.with_shared_serializer(serializer::by_name(serializer_name)?);
    }
    Ok(field)
}
