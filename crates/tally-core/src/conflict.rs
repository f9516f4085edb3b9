//! Conflict Resolver - identifier renumbering after a remote collision
//!
//! Invoked only when the remote authority reports that a task's primary-key
//! value already exists there (two devices generated the same identifier
//! before either synced). The local record gets a fresh identifier, and the
//! queued task is replaced in place with attempts reset so it is retried
//! promptly rather than penalized.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::queue::{SyncQueue, SyncTask};
use crate::store::LocalStore;

/// Renumber the identifier carried by `task`. Returns the new identifier.
///
/// Only the colliding table's local collection is patched; fields in other
/// tables referencing the old identifier by value are not rewritten, which
/// is why the renumbering is logged at warn level.
pub fn resolve(store: &mut LocalStore, queue: &mut SyncQueue, task: &SyncTask) -> Result<String> {
    let registry = *store.registry();
    let table = registry
        .get(&task.table)
        .ok_or_else(|| Error::UnknownTable(task.table.clone()))?;
    let old_id = task.payload.primary_key_of(table).ok_or_else(|| {
        Error::InvalidInput(format!(
            "conflicting task {} carries no primary key for {}",
            task.task_id, task.table
        ))
    })?;

    let new_id = Uuid::now_v7().to_string();

    if !store.rewrite_primary_key(table, &old_id, &new_id) {
        tracing::warn!(
            table = task.table,
            old_id,
            "colliding record is no longer in the local store; patching queue only"
        );
    }

    let mut replacement = task.clone();
    replacement.payload.set_primary_key(table, &new_id);
    replacement.attempts = 0;
    queue.replace_in_place(&task.task_id, replacement);

    tracing::warn!(
        table = task.table,
        old_id,
        new_id,
        "renumbered colliding identifier; references from other tables are not rewritten"
    );
    Ok(new_id)
}
