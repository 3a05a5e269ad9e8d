//! Deferred-call scheduling.
//!
//! - [`DeferredScheduler`]: enqueue a named function call after an optional delay
//! - [`DeferredCall`]: serializable `function` + `args` payload
//! - [`InMemoryScheduler`]: single-process queue for tests and local workers
//!
//! Delivery is at-least-once; a dedup key collapses calls that are still
//! queued, so handlers must be idempotent.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// A function reference plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredCall {
    /// Registered function name, e.g. `catalog.generate`.
    pub function: String,
    /// Arguments, interpreted by the function's handler.
    pub args: serde_json::Value,
}

impl DeferredCall {
    /// Creates a call.
    #[must_use]
    pub fn new(function: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }
}

/// Options for scheduling a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Calls sharing a dedup key collapse while one is still pending.
    pub dedup_key: Option<String>,
    /// Delay before the call becomes runnable.
    pub delay: Duration,
}

impl ScheduleOptions {
    /// Creates default options (no dedup key, no delay).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the dedup key.
    #[must_use]
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Sets the delay.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Result of scheduling a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleResult {
    /// The call was queued.
    Scheduled {
        /// Scheduler-assigned task ID.
        task_id: String,
    },
    /// A pending call with the same dedup key already exists.
    Deduplicated {
        /// The pending task's ID.
        existing_task_id: String,
    },
}

impl ScheduleResult {
    /// Returns true if a new task was queued.
    #[must_use]
    pub const fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }

    /// Returns the task ID that will run the call.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::Scheduled { task_id }
            | Self::Deduplicated {
                existing_task_id: task_id,
            } => task_id,
        }
    }
}

/// Deferred-call scheduler.
#[async_trait]
pub trait DeferredScheduler: Send + Sync {
    /// Schedules `call` according to `options`.
    async fn schedule(&self, call: DeferredCall, options: ScheduleOptions)
    -> Result<ScheduleResult>;
}

/// A queued call.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    /// Task ID.
    pub task_id: String,
    /// The call to run.
    pub call: DeferredCall,
    /// Options the call was scheduled with.
    pub options: ScheduleOptions,
    /// When the call was scheduled.
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ScheduledTask>,
    pending_keys: HashMap<String, String>,
}

/// In-memory scheduler.
///
/// Delays are recorded but not enforced; the consumer decides when to run.
/// Dedup keys are released when the task is taken.
#[derive(Debug, Default)]
pub struct InMemoryScheduler {
    state: RwLock<QueueState>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Internal {
        message: "scheduler lock poisoned".into(),
    }
}

impl InMemoryScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the oldest queued task.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<ScheduledTask>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let task = state.queue.pop_front();
        if let Some(key) = task.as_ref().and_then(|t| t.options.dedup_key.as_ref()) {
            state.pending_keys.remove(key);
        }
        drop(state);
        Ok(task)
    }

    /// Removes and returns every queued task in scheduling order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<ScheduledTask>> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.pending_keys.clear();
        let drained = state.queue.drain(..).collect();
        drop(state);
        Ok(drained)
    }

    /// Returns a snapshot of queued tasks without removing them.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pending(&self) -> Result<Vec<ScheduledTask>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queue.iter().cloned().collect())
    }

    /// Returns the number of queued tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.queue.len())
    }

    /// Returns true when nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl DeferredScheduler for InMemoryScheduler {
    async fn schedule(
        &self,
        call: DeferredCall,
        options: ScheduleOptions,
    ) -> Result<ScheduleResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(existing) = options
            .dedup_key
            .as_ref()
            .and_then(|key| state.pending_keys.get(key))
        {
            return Ok(ScheduleResult::Deduplicated {
                existing_task_id: existing.clone(),
            });
        }

        let task_id = Ulid::new().to_string();
        if let Some(key) = &options.dedup_key {
            state.pending_keys.insert(key.clone(), task_id.clone());
        }
        state.queue.push_back(ScheduledTask {
            task_id: task_id.clone(),
            call,
            options,
            scheduled_at: Utc::now(),
        });
        drop(state);

        Ok(ScheduleResult::Scheduled { task_id })
    }
}
