//! Table Registry - static metadata for every replicated logical table
//!
//! The registry is loaded once at startup and never mutated. It declares,
//! per table, the primary-key field and the kind of every field, which
//! drives record validation, wire text-encoding of structured fields, and
//! numeric coercion.

/// Kind of a record field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Numeric scalar, coerced from string representations on the wire
    Number,
    /// Plain text scalar
    Text,
    /// Boolean scalar
    Bool,
    /// Nested object or array, serialized to text when crossing the wire
    Structured,
}

/// A single field declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldDef {
    FieldDef { name, kind }
}

/// Static metadata for one logical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    /// Primary-key field name; not always `id` (users key on `userId`,
    /// roles on `role`)
    pub primary_key: &'static str,
    pub fields: &'static [FieldDef],
}

impl TableDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_structured(&self, name: &str) -> bool {
        matches!(self.field(name), Some(f) if f.kind == FieldKind::Structured)
    }

    pub fn is_numeric(&self, name: &str) -> bool {
        matches!(self.field(name), Some(f) if f.kind == FieldKind::Number)
    }
}

use FieldKind::{Bool, Number, Structured, Text};

/// The replicated business tables of the retail system.
///
/// The presence table (`sessions`) is deliberately absent: it is
/// server-side state and is neither replicated nor hydrated.
static RETAIL_TABLES: &[TableDef] = &[
    TableDef {
        name: "products",
        primary_key: "id",
        fields: &[
            field("id", Text),
            field("name", Text),
            field("price", Number),
            field("stock", Number),
            field("categoryId", Text),
            field("active", Bool),
            field("variants", Structured),
        ],
    },
    TableDef {
        name: "categories",
        primary_key: "id",
        fields: &[
            field("id", Text),
            field("name", Text),
            field("sortOrder", Number),
        ],
    },
    TableDef {
        name: "orders",
        primary_key: "id",
        fields: &[
            field("id", Text),
            field("items", Structured),
            field("total", Number),
            field("status", Text),
            field("userId", Text),
            field("createdAt", Number),
        ],
    },
    TableDef {
        name: "inventory",
        primary_key: "id",
        fields: &[
            field("id", Text),
            field("productId", Text),
            field("delta", Number),
            field("reason", Text),
            field("recordedAt", Number),
        ],
    },
    TableDef {
        name: "users",
        primary_key: "userId",
        fields: &[
            field("userId", Text),
            field("username", Text),
            field("password", Text),
            field("role", Text),
            field("settings", Structured),
        ],
    },
    TableDef {
        name: "roles",
        primary_key: "role",
        fields: &[
            field("role", Text),
            field("label", Text),
            field("permissions", Structured),
        ],
    },
];

/// Immutable collection of table definitions.
#[derive(Debug, Clone, Copy)]
pub struct Registry {
    tables: &'static [TableDef],
}

impl Registry {
    /// The standard retail table set.
    #[must_use]
    pub const fn retail() -> Self {
        Self {
            tables: RETAIL_TABLES,
        }
    }

    /// Build a registry over a custom static table set (used by tests).
    #[must_use]
    pub const fn from_tables(tables: &'static [TableDef]) -> Self {
        Self { tables }
    }

    pub fn get(&self, name: &str) -> Option<&'static TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &'static TableDef> {
        self.tables.iter()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::retail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_primary_keys() {
        let registry = Registry::retail();
        assert_eq!(registry.get("products").unwrap().primary_key, "id");
        assert_eq!(registry.get("users").unwrap().primary_key, "userId");
        assert_eq!(registry.get("roles").unwrap().primary_key, "role");
        assert!(registry.get("sessions").is_none());
    }

    #[test]
    fn field_kind_classification() {
        let products = Registry::retail().get("products").unwrap();
        assert!(products.is_numeric("price"));
        assert!(products.is_structured("variants"));
        assert!(!products.is_numeric("name"));
        assert!(products.field("unknown").is_none());
    }
}
