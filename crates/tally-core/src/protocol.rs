//! Wire protocol shared by the device core and the remote authority
//!
//! A single JSON RPC endpoint over HTTP POST. Requests carry an `action`
//! discriminator; responses use one envelope shape. A response body that
//! fails to parse as the envelope is treated as a transport-layer failure
//! by the client (guards against a misconfigured server returning an
//! unrelated page).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::Record;

/// Error code attached to a primary-key collision response (HTTP 409).
pub const CODE_DUPLICATE_ID: &str = "DUPLICATE_ID";
/// Error code attached to a device-exclusivity rejection (HTTP 403).
pub const CODE_SESSION_ACTIVE: &str = "SESSION_ACTIVE";

/// Server-side presence table; not part of the replicated registry.
pub const PRESENCE_TABLE: &str = "sessions";

/// RPC action discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Insert,
    Update,
    Delete,
    RemoteLogin,
    FetchHydrationData,
    InitSchema,
}

/// The three mutation kinds a Sync Task can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl From<MutationKind> for Action {
    fn from(kind: MutationKind) -> Self {
        match kind {
            MutationKind::Insert => Self::Insert,
            MutationKind::Update => Self::Update,
            MutationKind::Delete => Self::Delete,
        }
    }
}

/// Request body of the RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl RpcRequest {
    #[must_use]
    pub fn mutation(kind: MutationKind, table: impl Into<String>, data: Record) -> Self {
        Self {
            action: kind.into(),
            table: Some(table.into()),
            data: Some(data),
            username: None,
            password: None,
            device_id: None,
        }
    }

    #[must_use]
    pub fn bare(action: Action) -> Self {
        Self {
            action,
            table: None,
            data: None,
            username: None,
            password: None,
            device_id: None,
        }
    }
}

/// Response envelope of the RPC endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl RpcResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_data(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Self::default()
        }
    }
}
