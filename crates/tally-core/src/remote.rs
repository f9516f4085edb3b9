//! Remote Authority client
//!
//! The central store is reached only through a narrow RPC surface; this
//! module defines that surface as a trait (so the engine can be driven by
//! a scripted fake in tests) plus the HTTP implementation over reqwest.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{
    Action, MutationKind, RpcRequest, RpcResponse, CODE_DUPLICATE_ID, CODE_SESSION_ACTIVE,
    PRESENCE_TABLE,
};
use crate::queue::SyncTask;
use crate::record::Record;
use crate::registry::Registry;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors talking to the remote authority. Every variant is transient from
/// the sync processor's point of view.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Invalid remote configuration: {0}")]
    InvalidConfiguration(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Response was not a valid envelope: {0}")]
    Envelope(String),
    #[error("Remote rejected the request: {0}")]
    Rejected(String),
}

/// Result of pushing one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The remote confirmed `{success: true}`
    Applied,
    /// Primary-key collision (HTTP 409, `DUPLICATE_ID`)
    DuplicateId,
}

/// Result of a remote-authenticated login attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    /// Credentials matched and the device claimed the presence slot
    Accepted(Record),
    /// Another device holds a live session (HTTP 403); surfaced to the
    /// user without retry
    ActiveElsewhere,
    /// Credentials rejected
    Rejected(String),
}

/// The narrow RPC surface of the central store.
pub trait RemoteAuthority {
    fn push(
        &self,
        task: &SyncTask,
    ) -> impl Future<Output = Result<PushOutcome, RemoteError>> + Send;

    fn fetch_all(
        &self,
    ) -> impl Future<Output = Result<BTreeMap<String, Vec<Record>>, RemoteError>> + Send;

    fn login(
        &self,
        username: &str,
        password: &str,
        device_id: &str,
    ) -> impl Future<Output = Result<LoginOutcome, RemoteError>> + Send;

    fn heartbeat(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn logout(&self, user_id: &str) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn init_schema(&self) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// HTTP client for the single RPC endpoint.
#[derive(Clone)]
pub struct HttpRemote {
    endpoint: String,
    registry: Registry,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(endpoint: impl Into<String>, registry: Registry) -> Result<Self, RemoteError> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            endpoint,
            registry,
            client,
        })
    }

    async fn call(
        &self,
        request: &RpcRequest,
    ) -> Result<(reqwest::StatusCode, RpcResponse), RemoteError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        // A body that does not parse as the envelope is a transport-layer
        // failure, not a remote verdict.
        let envelope = response
            .json::<RpcResponse>()
            .await
            .map_err(|e| RemoteError::Envelope(e.to_string()))?;
        Ok((status, envelope))
    }

    fn rejection(status: reqwest::StatusCode, envelope: &RpcResponse) -> RemoteError {
        let message = envelope
            .error
            .clone()
            .unwrap_or_else(|| "no error message".to_string());
        RemoteError::Rejected(format!("{message} ({})", status.as_u16()))
    }
}

impl RemoteAuthority for HttpRemote {
    async fn push(&self, task: &SyncTask) -> Result<PushOutcome, RemoteError> {
        let payload = match self.registry.get(&task.table) {
            Some(def) => task.payload.to_wire(def),
            None => task.payload.clone(),
        };
        let request = RpcRequest::mutation(task.action, task.table.clone(), payload);
        let (status, envelope) = self.call(&request).await?;

        if envelope.success {
            return Ok(PushOutcome::Applied);
        }
        if status == reqwest::StatusCode::CONFLICT
            && envelope.code.as_deref() == Some(CODE_DUPLICATE_ID)
        {
            return Ok(PushOutcome::DuplicateId);
        }
        Err(Self::rejection(status, &envelope))
    }

    async fn fetch_all(&self) -> Result<BTreeMap<String, Vec<Record>>, RemoteError> {
        let request = RpcRequest::bare(Action::FetchHydrationData);
        let (status, envelope) = self.call(&request).await?;
        if !envelope.success {
            return Err(Self::rejection(status, &envelope));
        }
        let Some(Value::Object(tables)) = envelope.data else {
            return Err(RemoteError::Envelope(
                "hydration response did not include a table map".to_string(),
            ));
        };

        let mut out = BTreeMap::new();
        for def in self.registry.tables() {
            let rows = match tables.get(def.name) {
                Some(Value::Array(rows)) => rows.clone(),
                _ => Vec::new(),
            };
            let mut records = Vec::with_capacity(rows.len());
            for row in rows {
                let Value::Object(map) = row else {
                    return Err(RemoteError::Envelope(format!(
                        "hydration row in {} is not an object",
                        def.name
                    )));
                };
                let record = Record::from_wire(map, def)
                    .map_err(|e| RemoteError::Envelope(e.to_string()))?;
                records.push(record);
            }
            out.insert(def.name.to_string(), records);
        }
        Ok(out)
    }

    async fn login(
        &self,
        username: &str,
        password: &str,
        device_id: &str,
    ) -> Result<LoginOutcome, RemoteError> {
        let request = RpcRequest {
            action: Action::RemoteLogin,
            table: None,
            data: None,
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            device_id: Some(device_id.to_string()),
        };
        let (status, envelope) = self.call(&request).await?;

        if status == reqwest::StatusCode::FORBIDDEN
            || envelope.code.as_deref() == Some(CODE_SESSION_ACTIVE)
        {
            return Ok(LoginOutcome::ActiveElsewhere);
        }
        if !envelope.success {
            let message = envelope
                .error
                .unwrap_or_else(|| "login rejected".to_string());
            return Ok(LoginOutcome::Rejected(message));
        }
        let user = envelope.user.ok_or_else(|| {
            RemoteError::Envelope("login response did not include a user record".to_string())
        })?;
        Ok(LoginOutcome::Accepted(user))
    }

    async fn heartbeat(&self, user_id: &str, device_id: &str) -> Result<(), RemoteError> {
        let mut record = Record::new();
        record.insert("userId", Value::String(user_id.to_string()));
        record.insert("deviceId", Value::String(device_id.to_string()));
        record.insert(
            "lastHeartbeatAt",
            Value::from(Utc::now().timestamp_millis()),
        );
        let request = RpcRequest::mutation(MutationKind::Update, PRESENCE_TABLE, record);
        let (status, envelope) = self.call(&request).await?;
        if envelope.success {
            Ok(())
        } else {
            Err(Self::rejection(status, &envelope))
        }
    }

    async fn logout(&self, user_id: &str) -> Result<(), RemoteError> {
        let mut record = Record::new();
        record.insert("userId", Value::String(user_id.to_string()));
        let request = RpcRequest::mutation(MutationKind::Delete, PRESENCE_TABLE, record);
        let (status, envelope) = self.call(&request).await?;
        if envelope.success {
            Ok(())
        } else {
            Err(Self::rejection(status, &envelope))
        }
    }

    async fn init_schema(&self) -> Result<(), RemoteError> {
        let request = RpcRequest::bare(Action::InitSchema);
        let (status, envelope) = self.call(&request).await?;
        if envelope.success {
            Ok(())
        } else {
            Err(Self::rejection(status, &envelope))
        }
    }
}

fn normalize_endpoint(raw: String) -> Result<String, RemoteError> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return Err(RemoteError::InvalidConfiguration(
            "endpoint must not be empty".to_string(),
        ));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(RemoteError::InvalidConfiguration(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("pos.example.com".to_string()).is_err());
        assert_eq!(
            normalize_endpoint("https://pos.example.com/rpc/".to_string()).unwrap(),
            "https://pos.example.com/rpc"
        );
    }
}
