// Record instances: field name to value mappings handed to and from storage.
use std::collections::BTreeMap;
use std::collections::btree_map;

use serde_json::{Map, Value as JsonValue};

use crate::core::error::{Error, ErrorKind};
use crate::core::schema::{ID_FIELD, Schema};
use crate::core::value::Value;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// Builds a record from a JSON object. Keys must be columns of `schema`.
    pub fn from_json(schema: &Schema, value: &JsonValue) -> Result<Self, Error> {
        let Some(obj) = value.as_object() else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("record must be a JSON object")
                .with_hint(r#"Example: {"name": "Laptop", "price": 100}"#));
        };
        let mut record = Self::new();
        for (key, raw) in obj {
            let value = Value::from_json(raw).ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("field `{key}` holds a nested JSON value"))
                    .with_field(key.clone())
            })?;
            record.set(key.clone(), value);
        }
        record.check_fields(schema)?;
        Ok(record)
    }

    pub fn to_json(&self) -> JsonValue {
        let map: Map<String, JsonValue> = self
            .values
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        JsonValue::Object(map)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(field.into(), value.into())
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.values.remove(field)
    }

    /// Assigned identity, if the record has been persisted.
    pub fn id(&self) -> Option<i64> {
        self.values.get(ID_FIELD).and_then(Value::as_i64)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.values.iter()
    }

    pub(crate) fn set_id(&mut self, id: i64) {
        self.values.insert(ID_FIELD.to_string(), Value::Integer(id));
    }

    /// Rejects keys outside the schema and a non-integer identity.
    pub(crate) fn check_fields(&self, schema: &Schema) -> Result<(), Error> {
        if let Some(key) = self.values.keys().find(|key| !schema.has_column(key)) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "field `{key}` is not declared by record kind `{}`",
                    schema.kind()
                ))
                .with_field(key.clone()));
        }
        match self.values.get(ID_FIELD) {
            None | Some(Value::Null) | Some(Value::Integer(_)) => Ok(()),
            Some(other) => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("`_id` must be an integer, got {}", other.type_name()))
                .with_field(ID_FIELD)),
        }
    }
}

impl<'a> IntoIterator for &'a Record {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
