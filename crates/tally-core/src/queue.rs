//! Sync Queue - durable, ordered list of pending mutations
//!
//! FIFO by default; a task that fails transiently is moved to the tail with
//! its attempt counter bumped, so a persistently failing mutation cycles to
//! the back instead of blocking later, possibly-succeeding mutations.

use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::MutationKind;
use crate::record::Record;

/// One pending mutation destined for the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    pub task_id: String,
    pub action: MutationKind,
    pub table: String,
    pub payload: Record,
    /// Unix ms at enqueue time
    pub enqueued_at: i64,
    /// Failed delivery attempts so far; reset to 0 when the conflict
    /// resolver rewrites the payload
    pub attempts: u32,
}

impl SyncTask {
    #[must_use]
    pub fn new(action: MutationKind, table: impl Into<String>, payload: Record) -> Self {
        Self {
            task_id: Uuid::now_v7().to_string(),
            action,
            table: table.into(),
            payload,
            enqueued_at: Utc::now().timestamp_millis(),
            attempts: 0,
        }
    }
}

/// Ordered sequence of [`SyncTask`]s. Only the head is ever in flight.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueue {
    tasks: VecDeque<SyncTask>,
}

impl SyncQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_tasks(tasks: Vec<SyncTask>) -> Self {
        Self {
            tasks: tasks.into(),
        }
    }

    /// Append a task at the tail.
    pub fn enqueue(&mut self, task: SyncTask) {
        self.tasks.push_back(task);
    }

    /// The current head, without removing it.
    #[must_use]
    pub fn head(&self) -> Option<&SyncTask> {
        self.tasks.front()
    }

    /// Delete a task by id wherever it sits.
    pub fn remove(&mut self, task_id: &str) -> Option<SyncTask> {
        let position = self.tasks.iter().position(|t| t.task_id == task_id)?;
        self.tasks.remove(position)
    }

    /// Substitute a task at its existing position. Returns false when no
    /// task with that id is queued.
    pub fn replace_in_place(&mut self, task_id: &str, new_task: SyncTask) -> bool {
        match self.tasks.iter_mut().find(|t| t.task_id == task_id) {
            Some(slot) => {
                *slot = new_task;
                true
            }
            None => false,
        }
    }

    /// Remove a task from its current position and append a copy at the
    /// tail with `attempts` incremented. Returns the new attempt count.
    ///
    /// This is the round-robin-on-failure scheduling decision: backlogged
    /// tasks behind a failing one still get their turn.
    pub fn move_to_tail(&mut self, task_id: &str) -> Option<u32> {
        let mut task = self.remove(task_id)?;
        task.attempts += 1;
        let attempts = task.attempts;
        self.tasks.push_back(task);
        Some(attempts)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncTask> {
        self.tasks.iter()
    }

    /// Tasks in queue order, for snapshot persistence.
    #[must_use]
    pub fn tasks(&self) -> Vec<SyncTask> {
        self.tasks.iter().cloned().collect()
    }
}
