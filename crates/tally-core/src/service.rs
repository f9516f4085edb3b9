//! Sync service - the control loop that owns the engine
//!
//! The engine itself is a plain owned structure; this module wraps it in a
//! single task driven by an mpsc command channel plus the periodic drain
//! tick, so the queue and store are never touched from two places at once.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::engine::{Schedule, SyncEngine, SyncStatus, POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::protocol::MutationKind;
use crate::record::Record;
use crate::remote::RemoteAuthority;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

enum Command {
    Apply {
        table: String,
        kind: MutationKind,
        record: Record,
        reply: oneshot::Sender<Result<Record>>,
    },
    DrainNow,
    Hydrate {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Handle to a running sync service task.
pub struct SyncHandle {
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<SyncStatus>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Apply a mutation locally and schedule a drain.
    pub async fn apply(
        &self,
        table: impl Into<String>,
        kind: MutationKind,
        record: Record,
    ) -> Result<Record> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Apply {
            table: table.into(),
            kind,
            record,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::ServiceUnavailable("sync service stopped".to_string()))?
    }

    /// Trigger a drain without waiting for the periodic tick.
    pub async fn drain_now(&self) -> Result<()> {
        self.send(Command::DrainNow).await
    }

    /// Bootstrap the store from the remote authority.
    pub async fn hydrate(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Hydrate { reply }).await?;
        rx.await
            .map_err(|_| Error::ServiceUnavailable("sync service stopped".to_string()))?
    }

    /// Current ambient status.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Watch channel for status transitions.
    #[must_use]
    pub fn status_rx(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop the service and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown).await;
        let _ = self.task.await;
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::ServiceUnavailable("sync service stopped".to_string()))
    }
}

/// Spawn the control loop for `engine`.
pub fn spawn<R>(engine: SyncEngine<R>) -> SyncHandle
where
    R: RemoteAuthority + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let status = engine.status_rx();
    let task = tokio::spawn(run(engine, rx));
    SyncHandle { tx, status, task }
}

async fn run<R: RemoteAuthority>(mut engine: SyncEngine<R>, mut rx: mpsc::Receiver<Command>) {
    let mut poll = time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Deadline of the next scheduled drain; None while the queue is idle.
    let mut next_drain: Option<Instant> = None;

    loop {
        let drain_at = next_drain.unwrap_or_else(|| Instant::now() + POLL_INTERVAL);

        tokio::select! {
            command = rx.recv() => match command {
                None | Some(Command::Shutdown) => break,
                Some(Command::Apply { table, kind, record, reply }) => {
                    let result = engine.apply_local(&table, kind, record);
                    let _ = reply.send(result);
                    next_drain = Some(Instant::now());
                }
                Some(Command::DrainNow) => {
                    next_drain = Some(Instant::now());
                }
                Some(Command::Hydrate { reply }) => {
                    let _ = reply.send(engine.hydrate().await);
                }
            },
            _ = poll.tick() => {
                next_drain = Some(Instant::now());
            }
            () = time::sleep_until(drain_at), if next_drain.is_some() => {
                next_drain = match engine.drain_once().await {
                    Schedule::Again(delay) => Some(Instant::now() + delay),
                    Schedule::Idle => None,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::queue::SyncTask;
    use crate::registry::Registry;
    use crate::remote::{LoginOutcome, PushOutcome, RemoteError};

    struct StaticRemote {
        fail: bool,
    }

    impl RemoteAuthority for StaticRemote {
        async fn push(&self, _task: &SyncTask) -> std::result::Result<PushOutcome, RemoteError> {
            if self.fail {
                Err(RemoteError::Rejected("unreachable (502)".to_string()))
            } else {
                Ok(PushOutcome::Applied)
            }
        }

        async fn fetch_all(
            &self,
        ) -> std::result::Result<BTreeMap<String, Vec<Record>>, RemoteError> {
            Ok(BTreeMap::new())
        }

        async fn login(
            &self,
            _username: &str,
            _password: &str,
            _device_id: &str,
        ) -> std::result::Result<LoginOutcome, RemoteError> {
            Ok(LoginOutcome::Rejected("not scripted".to_string()))
        }

        async fn heartbeat(
            &self,
            _user_id: &str,
            _device_id: &str,
        ) -> std::result::Result<(), RemoteError> {
            Ok(())
        }

        async fn logout(&self, _user_id: &str) -> std::result::Result<(), RemoteError> {
            Ok(())
        }

        async fn init_schema(&self) -> std::result::Result<(), RemoteError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn applied_mutation_drains_to_connected() {
        let engine = SyncEngine::new(Registry::retail(), StaticRemote { fail: false });
        let handle = spawn(engine);

        let record = Record::from_json(json!({ "id": "p1", "name": "Espresso" })).unwrap();
        let applied = handle
            .apply("products", MutationKind::Insert, record)
            .await
            .unwrap();
        assert_eq!(applied.get("id"), Some(&json!("p1")));

        let mut status = handle.status_rx();
        status
            .wait_for(|s| *s == SyncStatus::Connected)
            .await
            .unwrap();
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_remote_reports_offline() {
        let engine = SyncEngine::new(Registry::retail(), StaticRemote { fail: true });
        let handle = spawn(engine);

        let record = Record::from_json(json!({ "id": "p1" })).unwrap();
        handle
            .apply("products", MutationKind::Insert, record)
            .await
            .unwrap();

        let mut status = handle.status_rx();
        status
            .wait_for(|s| *s == SyncStatus::Offline)
            .await
            .unwrap();
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_apply_surfaces_synchronously() {
        let engine = SyncEngine::new(Registry::retail(), StaticRemote { fail: false });
        let handle = spawn(engine);

        let record = Record::from_json(json!({ "id": "p1", "bogus": 1 })).unwrap();
        let result = handle.apply("products", MutationKind::Insert, record).await;
        assert!(result.is_err());
        handle.shutdown().await;
    }
}
