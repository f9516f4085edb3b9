//! Sync Processor - single-flight drain loop over the sync queue
//!
//! The engine owns the local store, the queue, and the remote client. It is
//! single-threaded and cooperative: `drain_once` performs exactly one
//! queue-head delivery and reports how the next drain should be scheduled,
//! so the state machine is directly testable without wall-clock delays.
//! The timer-driven control loop lives in [`crate::service`].

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;

use crate::conflict;
use crate::error::Result;
use crate::hydrate;
use crate::protocol::MutationKind;
use crate::queue::{SyncQueue, SyncTask};
use crate::record::Record;
use crate::registry::Registry;
use crate::remote::{PushOutcome, RemoteAuthority};
use crate::snapshot;
use crate::store::LocalStore;

/// A task is dropped permanently after this many failed deliveries.
pub const MAX_ATTEMPTS: u32 = 15;
/// Delay before draining again after a success with backlog remaining.
pub const REDRIVE_DELAY: Duration = Duration::from_secs(3);
/// Delay before retrying after a transient failure.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);
/// Periodic drain interval, so an offline backlog is retried without
/// waiting for a new mutation.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Ambient connectivity status surfaced to UI layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Connected,
    Syncing,
    Offline,
}

/// How the caller should schedule the next drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Queue is drained; wait for a new mutation or the periodic tick
    Idle,
    /// Drain again after the given delay
    Again(Duration),
}

/// The reconciliation engine for one device.
pub struct SyncEngine<R> {
    registry: Registry,
    store: LocalStore,
    queue: SyncQueue,
    remote: R,
    snapshot_path: Option<PathBuf>,
    /// Single-flight guard; only one drain is ever active
    draining: bool,
    status_tx: watch::Sender<SyncStatus>,
}

impl<R: RemoteAuthority> SyncEngine<R> {
    #[must_use]
    pub fn new(registry: Registry, remote: R) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::Connected);
        Self {
            registry,
            store: LocalStore::new(registry),
            queue: SyncQueue::new(),
            remote,
            snapshot_path: None,
            draining: false,
            status_tx,
        }
    }

    /// Open an engine backed by a durable snapshot file, restoring any
    /// records and pending tasks persisted by a previous run.
    pub fn with_snapshot(registry: Registry, remote: R, path: PathBuf) -> Result<Self> {
        let mut engine = Self::new(registry, remote);
        if let Some(persisted) = snapshot::load(&path)? {
            engine.store = LocalStore::from_collections(registry, persisted.records);
            engine.queue = SyncQueue::from_tasks(persisted.queue);
        }
        engine.snapshot_path = Some(path);
        Ok(engine)
    }

    /// Apply a mutation locally and enqueue it for delivery.
    ///
    /// The local apply is instantaneous and independent of connectivity;
    /// only registry validation can reject it. Inserts without a primary
    /// key get a locally generated one, which the remote may later override
    /// through the conflict path.
    pub fn apply_local(
        &mut self,
        table: &str,
        kind: MutationKind,
        mut record: Record,
    ) -> Result<Record> {
        let def = self
            .registry
            .get(table)
            .ok_or_else(|| crate::error::Error::UnknownTable(table.to_string()))?;

        if kind == MutationKind::Insert && record.primary_key_of(def).is_none() {
            record.set_primary_key(def, &uuid::Uuid::now_v7().to_string());
        }
        record.validate(def)?;
        if record.primary_key_of(def).is_none() {
            return Err(crate::error::Error::InvalidInput(format!(
                "{kind:?} on {table} requires the {} field",
                def.primary_key
            )));
        }

        let applied = self.store.apply(def, kind, record);
        self.queue
            .enqueue(SyncTask::new(kind, table, applied.clone()));
        self.persist()?;
        Ok(applied)
    }

    /// Deliver the queue head to the remote authority, once.
    pub async fn drain_once(&mut self) -> Schedule {
        if self.draining {
            return Schedule::Idle;
        }
        let Some(task) = self.queue.head().cloned() else {
            self.set_status(SyncStatus::Connected);
            return Schedule::Idle;
        };

        self.draining = true;
        self.set_status(SyncStatus::Syncing);
        let result = self.remote.push(&task).await;
        self.draining = false;

        match result {
            Ok(PushOutcome::Applied) => {
                self.queue.remove(&task.task_id);
                self.persist_or_log();
                if self.queue.is_empty() {
                    self.set_status(SyncStatus::Connected);
                    Schedule::Idle
                } else {
                    Schedule::Again(REDRIVE_DELAY)
                }
            }
            Ok(PushOutcome::DuplicateId) => {
                if let Err(error) = conflict::resolve(&mut self.store, &mut self.queue, &task) {
                    // Unresolvable collision (malformed payload); retrying
                    // would collide forever.
                    tracing::error!(
                        task_id = task.task_id,
                        table = task.table,
                        %error,
                        "dropping task with unresolvable primary-key collision"
                    );
                    self.queue.remove(&task.task_id);
                }
                self.persist_or_log();
                Schedule::Again(Duration::ZERO)
            }
            Err(error) => {
                self.set_status(SyncStatus::Offline);
                if task.attempts >= MAX_ATTEMPTS - 1 {
                    self.queue.remove(&task.task_id);
                    tracing::error!(
                        task_id = task.task_id,
                        table = task.table,
                        action = ?task.action,
                        attempts = task.attempts + 1,
                        %error,
                        "dropping sync task after retry ceiling; its data now exists only on this device"
                    );
                } else {
                    self.queue.move_to_tail(&task.task_id);
                    tracing::debug!(
                        task_id = task.task_id,
                        table = task.table,
                        attempts = task.attempts + 1,
                        %error,
                        "transient sync failure, task moved to tail"
                    );
                }
                self.persist_or_log();
                if self.queue.is_empty() {
                    Schedule::Idle
                } else {
                    Schedule::Again(RETRY_DELAY)
                }
            }
        }
    }

    /// Bootstrap the local store from the remote authority (all-or-nothing).
    pub async fn hydrate(&mut self) -> Result<()> {
        hydrate::pull_all(&mut self.store, &self.remote).await?;
        self.persist()?;
        Ok(())
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut LocalStore {
        &mut self.store
    }

    pub const fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub const fn remote(&self) -> &R {
        &self.remote
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        *self.status_tx.borrow()
    }

    /// Watch channel carrying the ambient status indicator.
    #[must_use]
    pub fn status_rx(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    fn set_status(&self, status: SyncStatus) {
        self.status_tx.send_replace(status);
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.snapshot_path {
            snapshot::save(path, &self.store, &self.queue)?;
        }
        Ok(())
    }

    fn persist_or_log(&self) {
        if let Err(error) = self.persist() {
            tracing::error!(%error, "failed to persist device snapshot");
        }
    }
}
