//! Purpose: Compile dictionary-shaped query expressions into parameterized SQL WHERE clauses.
//! Exports: `Query`, `Condition`, `CompiledWhere`, `compile`.
//! Role: Parses the caller-facing JSON form into a small AST, then emits SQL text plus params.
//! Invariants: Values never reach SQL text; every literal and pattern is a bound parameter.
//! Invariants: Every key other than `$and` must name a schema column (unknown keys are errors).
//! Invariants: `$and` nests exactly one level; an empty query matches every row.
use serde_json::Value as JsonValue;

use crate::core::error::{Error, ErrorKind};
use crate::core::schema::Schema;
use crate::core::value::Value;

const AND_KEY: &str = "$and";

#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Equals { field: String, value: Value },
    /// SQL `LIKE`; the pattern carries its own `%`/`_` wildcards.
    Like { field: String, pattern: String },
    /// Regular-expression search anywhere in the stored value.
    Regex { field: String, pattern: String },
    And(Vec<Condition>),
}

impl Condition {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Like {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Regex {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    /// Classifies a field/value pair: `/…/` is LIKE, `r/…/` is REGEXP, anything else equality.
    fn from_pair(field: &str, value: &JsonValue) -> Result<Self, Error> {
        if let Some(text) = value.as_str() {
            if text.len() >= 3 && text.starts_with("r/") && text.ends_with('/') {
                return Ok(Self::regex(field, &text[2..text.len() - 1]));
            }
            if text.len() >= 2 && text.starts_with('/') && text.ends_with('/') {
                return Ok(Self::like(field, &text[1..text.len() - 1]));
            }
        }
        let literal = match value {
            JsonValue::Array(_) | JsonValue::Object(_) => None,
            other => Value::from_json(other),
        };
        literal.map(|literal| Self::eq(field, literal)).ok_or_else(|| {
            Error::new(ErrorKind::Query)
                .with_message(format!("field `{field}` must match a scalar value"))
                .with_field(field)
        })
    }
}

/// Conjunction of top-level conditions; empty means "every row".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    conditions: Vec<Condition>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().with(Condition::eq(field, value))
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::all().with(Condition::like(field, pattern))
    }

    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::all().with(Condition::regex(field, pattern))
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Self::all().with(Condition::And(conditions))
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Parses `{"field": value, "$and": {...}}`. `null` is the empty query.
    pub fn parse(expr: &JsonValue) -> Result<Self, Error> {
        match expr {
            JsonValue::Null => Ok(Self::all()),
            JsonValue::Object(obj) => {
                let mut query = Self::all();
                for (key, value) in obj {
                    query.conditions.push(parse_entry(key, value, 0)?);
                }
                Ok(query)
            }
            other => Err(Error::new(ErrorKind::Query)
                .with_message(format!("query expression must be an object, got {other}"))
                .with_hint(r#"Example: {"name": "Laptop"} or {"$and": {"name": "/%top/", "price": 100}}"#)),
        }
    }
}

fn parse_entry(key: &str, value: &JsonValue, depth: usize) -> Result<Condition, Error> {
    if key == AND_KEY {
        if depth > 0 {
            return Err(nested_and());
        }
        let Some(obj) = value.as_object() else {
            return Err(Error::new(ErrorKind::Query).with_message("`$and` expects an object of conditions"));
        };
        let conditions = obj
            .iter()
            .map(|(key, value)| parse_entry(key, value, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Condition::And(conditions));
    }
    if key.starts_with('$') {
        return Err(Error::new(ErrorKind::Query)
            .with_message(format!("unknown operator `{key}`"))
            .with_hint("Supported operator: $and"));
    }
    Condition::from_pair(key, value)
}

fn nested_and() -> Error {
    Error::new(ErrorKind::Query).with_message("`$and` cannot be nested")
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompiledWhere {
    pub clause: Option<String>,
    pub params: Vec<Value>,
}

impl CompiledWhere {
    /// ` WHERE <clause>` or the empty string.
    pub fn where_sql(&self) -> String {
        match &self.clause {
            Some(clause) => format!(" WHERE {clause}"),
            None => String::new(),
        }
    }
}

pub fn compile(query: &Query, schema: &Schema) -> Result<CompiledWhere, Error> {
    let mut params = Vec::new();
    let mut parts = Vec::with_capacity(query.conditions.len());
    for condition in &query.conditions {
        parts.push(compile_condition(condition, schema, 0, &mut params)?);
    }
    let clause = if parts.is_empty() {
        None
    } else {
        Some(parts.join(" AND "))
    };
    Ok(CompiledWhere { clause, params })
}

fn compile_condition(
    condition: &Condition,
    schema: &Schema,
    depth: usize,
    params: &mut Vec<Value>,
) -> Result<String, Error> {
    match condition {
        Condition::Equals { field, value } => {
            check_field(field, schema)?;
            if value.is_null() {
                return Ok(format!("\"{field}\" IS NULL"));
            }
            let stored = match schema.field(field) {
                Some(descriptor) => descriptor.serializer().serialize(value)?,
                None => value.clone(),
            };
            params.push(stored);
            Ok(format!("\"{field}\" = ?"))
        }
        Condition::Like { field, pattern } => {
            check_field(field, schema)?;
            params.push(Value::Text(pattern.clone()));
            Ok(format!("\"{field}\" LIKE ?"))
        }
        Condition::Regex { field, pattern } => {
            check_field(field, schema)?;
            regex::Regex::new(pattern).map_err(|err| {
                Error::new(ErrorKind::Query)
                    .with_message(format!("invalid regular expression for `{field}`"))
                    .with_field(field.clone())
                    .with_source(err)
            })?;
            params.push(Value::Text(pattern.clone()));
            Ok(format!("\"{field}\" REGEXP ?"))
        }
        Condition::And(conditions) => {
            if depth > 0 {
                return Err(nested_and());
            }
            if conditions.is_empty() {
                return Err(Error::new(ErrorKind::Query).with_message("`$and` needs at least one condition"));
            }
            let parts = conditions
                .iter()
                .map(|condition| compile_condition(condition, schema, depth + 1, params))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("({})", parts.join(" AND ")))
        }
    }
}

fn check_field(field: &str, schema: &Schema) -> Result<(), Error> {
    if schema.has_column(field) {
        return Ok(());
    }
    Err(Error::new(ErrorKind::Query)
        .with_message(format!(
            "unknown field `{field}` for record kind `{}`",
            schema.kind()
        ))
        .with_field(field)
        .with_hint(format!("Known fields: {}", schema.fieldnames().join(", "))))
}
