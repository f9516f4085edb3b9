//! Schema-described generic record
//!
//! A [`Record`] is an opaque field-name → value mapping, always carrying its
//! table's primary-key field. Values come from a small closed set of kinds
//! (number, text, bool, structured) declared by the Table Registry; records
//! are validated against the registry rather than treated as free-form
//! dynamic objects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::registry::{FieldKind, TableDef};

/// One row of a logical table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Map<String, Value>);

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a record from a JSON value; the value must be an object.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidInput(format!(
                "record must be a JSON object, got: {other}"
            ))),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// The record's primary-key value under `table`'s key field, normalized
    /// to a string (the wire carries both string and numeric keys).
    #[must_use]
    pub fn primary_key_of(&self, table: &TableDef) -> Option<String> {
        match self.0.get(table.primary_key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Replace the primary-key value under `table`'s key field.
    pub fn set_primary_key(&mut self, table: &TableDef, value: &str) {
        self.0
            .insert(table.primary_key.to_string(), Value::String(value.into()));
    }

    /// Validate every field against the table definition.
    ///
    /// Unknown fields and kind mismatches are validation errors, surfaced
    /// immediately to the caller and never retried. `null` is accepted for
    /// any declared field.
    pub fn validate(&self, table: &TableDef) -> Result<()> {
        for (name, value) in &self.0 {
            let Some(def) = table.field(name) else {
                return Err(Error::InvalidInput(format!(
                    "table {} has no field {name}",
                    table.name
                )));
            };
            if value.is_null() {
                continue;
            }
            let ok = match def.kind {
                FieldKind::Number => value.is_number(),
                FieldKind::Text => value.is_string(),
                FieldKind::Bool => value.is_boolean(),
                FieldKind::Structured => value.is_object() || value.is_array(),
            };
            if !ok {
                return Err(Error::InvalidInput(format!(
                    "field {}.{name} expects {:?}, got: {value}",
                    table.name, def.kind
                )));
            }
        }
        Ok(())
    }

    /// Encode for the wire: structured fields become JSON text.
    #[must_use]
    pub fn to_wire(&self, table: &TableDef) -> Self {
        let mut out = Map::with_capacity(self.0.len());
        for (name, value) in &self.0 {
            let encoded = if table.is_structured(name) && !value.is_null() && !value.is_string() {
                Value::String(value.to_string())
            } else {
                value.clone()
            };
            out.insert(name.clone(), encoded);
        }
        Self(out)
    }

    /// Decode a record arriving from the wire: structured fields are parsed
    /// back from text and declared-numeric fields are coerced to numbers
    /// regardless of their JSON representation.
    ///
    /// Already-decoded values pass through unchanged, so the same path
    /// handles both text-encoded mutation payloads and hydration responses
    /// whose structured fields the server has already parsed.
    pub fn from_wire(raw: Map<String, Value>, table: &TableDef) -> Result<Self> {
        let mut out = Map::with_capacity(raw.len());
        for (name, value) in raw {
            let decoded = decode_field(table, &name, value)?;
            out.insert(name, decoded);
        }
        Ok(Self(out))
    }
}

fn decode_field(table: &TableDef, name: &str, value: Value) -> Result<Value> {
    if value.is_null() {
        return Ok(value);
    }
    if table.is_structured(name) {
        return match value {
            Value::String(text) => serde_json::from_str(&text).map_err(|e| {
                Error::InvalidInput(format!(
                    "field {}.{name} carries unparseable structured text: {e}",
                    table.name
                ))
            }),
            other => Ok(other),
        };
    }
    if table.is_numeric(name) {
        return coerce_number(table, name, value);
    }
    Ok(value)
}

fn coerce_number(table: &TableDef, name: &str, value: Value) -> Result<Value> {
    match value {
        Value::Number(_) => Ok(value),
        Value::String(text) => {
            let trimmed = text.trim();
            // Integer text stays an integer; only fractional text goes
            // through f64.
            if let Ok(integer) = trimmed.parse::<i64>() {
                return Ok(Value::from(integer));
            }
            let parsed: f64 = trimmed.parse().map_err(|_| {
                Error::InvalidInput(format!(
                    "field {}.{name} is declared numeric but holds: {text:?}",
                    table.name
                ))
            })?;
            serde_json::Number::from_f64(parsed)
                .map(Value::Number)
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "field {}.{name} is not a finite number: {text:?}",
                        table.name
                    ))
                })
        }
        other => Err(Error::InvalidInput(format!(
            "field {}.{name} is declared numeric, got: {other}",
            table.name
        ))),
    }
}
