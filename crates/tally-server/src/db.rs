//! SQLite-backed authoritative store
//!
//! One table per registry entry, with the primary-key column declared
//! `PRIMARY KEY` so collisions surface as constraint violations. Schema
//! creation is additive: existing tables gain missing columns, nothing is
//! ever dropped.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde_json::{Map, Value};
use tally_core::{FieldKind, Record, Registry, TableDef};

use crate::error::AppError;

/// The server's view of the replicated business data.
pub struct Authority {
    conn: Connection,
    registry: Registry,
}

impl Authority {
    pub fn open(path: &Path, registry: Registry) -> Result<Self, AppError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn, registry })
    }

    #[cfg(test)]
    pub fn open_in_memory(registry: Registry) -> Result<Self, AppError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Create every registry table plus the presence table, adding any
    /// columns an older database is missing. Idempotent.
    ///
    /// Table and column names come from the static registry, never from
    /// the request, so building SQL by formatting is sound here.
    pub fn init_schema(&self) -> Result<(), AppError> {
        for table in self.registry.tables() {
            self.conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY)",
                    table.name, table.primary_key
                ),
                [],
            )?;
            for field in table.fields {
                if field.name == table.primary_key {
                    continue;
                }
                let ddl = format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    table.name,
                    field.name,
                    column_type(field.kind)
                );
                if let Err(error) = self.conn.execute(&ddl, []) {
                    if !is_duplicate_column(&error) {
                        return Err(error.into());
                    }
                }
            }
        }
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                userId TEXT PRIMARY KEY,
                deviceId TEXT NOT NULL,
                lastHeartbeatAt INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub fn insert(&self, table: &TableDef, record: &Record) -> Result<(), AppError> {
        let key = require_key(table, record)?;
        let (columns, values) = columns_and_values(table, record);
        if columns.is_empty() {
            return Err(AppError::bad_request("record carries no known fields"));
        }
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.name,
            columns.join(", "),
            placeholders.join(", ")
        );
        match self.conn.execute(&sql, params_from_iter(values)) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(AppError::DuplicateId(key))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Update by primary key; a key never seen before falls back to an
    /// insert, so replays of renumbered mutations stay idempotent.
    pub fn update(&self, table: &TableDef, record: &Record) -> Result<(), AppError> {
        let key = require_key(table, record)?;
        let (columns, mut values) = columns_and_values_without_key(table, record);
        if columns.is_empty() {
            return Ok(());
        }
        let sets: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            table.name,
            sets.join(", "),
            table.primary_key,
            columns.len() + 1
        );
        values.push(rusqlite::types::Value::Text(key));
        let affected = self.conn.execute(&sql, params_from_iter(values))?;
        if affected == 0 {
            self.insert(table, record)?;
        }
        Ok(())
    }

    pub fn delete(&self, table: &TableDef, record: &Record) -> Result<(), AppError> {
        let key = require_key(table, record)?;
        let sql = format!("DELETE FROM {} WHERE {} = ?1", table.name, table.primary_key);
        self.conn.execute(&sql, [key])?;
        Ok(())
    }

    /// A consistent snapshot of every replicated table, with structured
    /// columns parsed back into JSON values.
    pub fn fetch_all(&self) -> Result<BTreeMap<String, Vec<Record>>, AppError> {
        let mut out = BTreeMap::new();
        for table in self.registry.tables() {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT * FROM {}", table.name))?;
            let names: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
            let mut rows = stmt.query([])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                let mut map = Map::new();
                for (i, name) in names.iter().enumerate() {
                    if let Some(value) = from_sql(table, name, row.get_ref(i)?)? {
                        map.insert(name.clone(), value);
                    }
                }
                records.push(Record(map));
            }
            out.insert(table.name.to_string(), records);
        }
        Ok(out)
    }

    pub fn find_user(&self, username: &str) -> Result<Option<Record>, AppError> {
        let Some(users) = self.registry.get("users") else {
            return Ok(None);
        };
        let mut stmt = self.conn.prepare("SELECT * FROM users WHERE username = ?1")?;
        let names: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
        let mut rows = stmt.query([username])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let mut map = Map::new();
        for (i, name) in names.iter().enumerate() {
            if let Some(value) = from_sql(users, name, row.get_ref(i)?)? {
                map.insert(name.clone(), value);
            }
        }
        Ok(Some(Record(map)))
    }
}

const fn column_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Number => "REAL",
        FieldKind::Bool => "INTEGER",
        FieldKind::Text | FieldKind::Structured => "TEXT",
    }
}

fn is_duplicate_column(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(_, Some(message))
            if message.contains("duplicate column name")
    )
}

fn require_key(table: &TableDef, record: &Record) -> Result<String, AppError> {
    record.primary_key_of(table).ok_or_else(|| {
        AppError::bad_request(format!(
            "table {} requires a {} value",
            table.name, table.primary_key
        ))
    })
}

fn columns_and_values(
    table: &TableDef,
    record: &Record,
) -> (Vec<&'static str>, Vec<rusqlite::types::Value>) {
    let mut columns = Vec::new();
    let mut values = Vec::new();
    for field in table.fields {
        if let Some(value) = record.get(field.name) {
            columns.push(field.name);
            values.push(to_sql(value));
        }
    }
    (columns, values)
}

fn columns_and_values_without_key(
    table: &TableDef,
    record: &Record,
) -> (Vec<&'static str>, Vec<rusqlite::types::Value>) {
    let (columns, values) = columns_and_values(table, record);
    columns
        .into_iter()
        .zip(values)
        .filter(|(c, _)| *c != table.primary_key)
        .unzip()
}

fn to_sql(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
        Value::Number(n) => n.as_i64().map_or_else(
            || rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0)),
            rusqlite::types::Value::Integer,
        ),
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        structured => rusqlite::types::Value::Text(structured.to_string()),
    }
}

fn from_sql(table: &TableDef, name: &str, value: ValueRef<'_>) -> Result<Option<Value>, AppError> {
    let kind = table.field(name).map(|f| f.kind);
    let decoded = match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => match kind {
            Some(FieldKind::Bool) => Some(Value::Bool(i != 0)),
            _ => Some(Value::from(i)),
        },
        ValueRef::Real(f) => Some(Value::from(f)),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            if kind == Some(FieldKind::Structured) {
                let parsed: Value = serde_json::from_str(&text).map_err(|e| {
                    AppError::Database(format!(
                        "column {}.{name} holds unparseable structured text: {e}",
                        table.name
                    ))
                })?;
                Some(parsed)
            } else {
                Some(Value::String(text))
            }
        }
        ValueRef::Blob(_) => None,
    };
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn authority() -> Authority {
        let db = Authority::open_in_memory(Registry::retail()).unwrap();
        db.init_schema().unwrap();
        db
    }

    fn record(value: Value) -> Record {
        Record::from_json(value).unwrap()
    }

    #[test]
    fn init_schema_is_idempotent() {
        let db = authority();
        db.init_schema().unwrap();
        db.init_schema().unwrap();
    }

    #[test]
    fn duplicate_insert_reports_the_colliding_key() {
        let db = authority();
        let products = db.registry().get("products").unwrap();
        let rec = record(json!({ "id": "p1", "name": "Espresso", "price": 3.5 }));

        db.insert(products, &rec).unwrap();
        let err = db.insert(products, &rec).unwrap_err();
        assert!(matches!(err, AppError::DuplicateId(key) if key == "p1"));
    }

    #[test]
    fn structured_fields_roundtrip_through_sqlite() {
        let db = authority();
        let products = db.registry().get("products").unwrap();
        let rec = record(json!({
            "id": "p1",
            "active": true,
            "variants": [{ "size": "S" }, { "size": "L" }],
        }));

        db.insert(products, &rec).unwrap();
        let all = db.fetch_all().unwrap();
        let fetched = &all["products"][0];
        assert_eq!(fetched.get("active"), Some(&json!(true)));
        assert_eq!(
            fetched.get("variants"),
            Some(&json!([{ "size": "S" }, { "size": "L" }]))
        );
    }

    #[test]
    fn update_of_unknown_key_falls_back_to_insert() {
        let db = authority();
        let products = db.registry().get("products").unwrap();
        let rec = record(json!({ "id": "p9", "name": "Flat White" }));

        db.update(products, &rec).unwrap();
        let all = db.fetch_all().unwrap();
        assert_eq!(all["products"].len(), 1);
        assert_eq!(all["products"][0].get("name"), Some(&json!("Flat White")));
    }

    #[test]
    fn update_leaves_absent_columns_untouched() {
        let db = authority();
        let products = db.registry().get("products").unwrap();
        db.insert(
            products,
            &record(json!({ "id": "p1", "name": "Espresso", "price": 3.5 })),
        )
        .unwrap();

        db.update(products, &record(json!({ "id": "p1", "price": 4.0 })))
            .unwrap();
        let all = db.fetch_all().unwrap();
        assert_eq!(all["products"][0].get("name"), Some(&json!("Espresso")));
        assert_eq!(all["products"][0].get("price"), Some(&json!(4.0)));
    }

    #[test]
    fn delete_uses_the_table_specific_primary_key() {
        let db = authority();
        let roles = db.registry().get("roles").unwrap();
        db.insert(roles, &record(json!({ "role": "cashier", "label": "Cashier" })))
            .unwrap();

        db.delete(roles, &record(json!({ "role": "cashier" })))
            .unwrap();
        assert!(db.fetch_all().unwrap()["roles"].is_empty());

        let err = db.delete(roles, &record(json!({ "label": "x" }))).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn find_user_matches_on_username() {
        let db = authority();
        let users = db.registry().get("users").unwrap();
        db.insert(
            users,
            &record(json!({ "userId": "u1", "username": "ada", "password": "pw" })),
        )
        .unwrap();

        let user = db.find_user("ada").unwrap().unwrap();
        assert_eq!(user.get("userId"), Some(&json!("u1")));
        assert!(db.find_user("nobody").unwrap().is_none());
    }
}
