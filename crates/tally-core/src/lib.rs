//! tally-core - Core library for Tally
//!
//! The device-side reconciliation layer of an offline-first retail system:
//! every device keeps a full local copy of the business data, applies
//! writes locally and instantly, and drains a durable mutation queue
//! against one central authoritative store.

pub mod conflict;
pub mod engine;
pub mod error;
pub mod hydrate;
pub mod protocol;
pub mod queue;
pub mod record;
pub mod registry;
pub mod remote;
pub mod service;
pub mod session;
pub mod snapshot;
pub mod store;

pub use engine::{Schedule, SyncEngine, SyncStatus, MAX_ATTEMPTS};
pub use error::{Error, Result};
pub use protocol::{Action, MutationKind, RpcRequest, RpcResponse};
pub use record::Record;
pub use registry::{FieldDef, FieldKind, Registry, TableDef};
pub use remote::{HttpRemote, LoginOutcome, PushOutcome, RemoteAuthority, RemoteError};
