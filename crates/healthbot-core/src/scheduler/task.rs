//! Named task record.
//!
//! Eligibility is read from atomics without locking. Claiming takes the
//! `pending` mutex, re-validates and flips the status to `Running` inside
//! that section, so two pollers can never claim the same task.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde::Serialize;

/// Deferred unit of work. Runs at most once.
pub type Command = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

const NEVER: u64 = u64::MAX;

/// Lifecycle of a named task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Running,
    Completed,
}

impl TaskStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TaskStatus::Running,
            2 => TaskStatus::Completed,
            _ => TaskStatus::Created,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TaskStatus::Created => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed => 2,
        }
    }
}

pub(crate) struct NamedTask {
    name: String,
    status: AtomicU8,
    has_pending: AtomicBool,
    /// Milliseconds since the scheduler epoch, `NEVER` before the first run.
    last_finish_ms: AtomicU64,
    quiet_ms: AtomicU64,
    pending: Mutex<Option<Command>>,
}

impl NamedTask {
    pub(crate) fn new(name: impl Into<String>, quiet_ms: u64) -> Self {
        Self {
            name: name.into(),
            status: AtomicU8::new(TaskStatus::Created.as_u8()),
            has_pending: AtomicBool::new(false),
            last_finish_ms: AtomicU64::new(NEVER),
            quiet_ms: AtomicU64::new(quiet_ms),
            pending: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn quiet_ms(&self) -> u64 {
        self.quiet_ms.load(Ordering::Acquire)
    }

    /// Replace the pending command. The quiet period only ever shrinks.
    pub(crate) fn request(&self, command: Command, quiet_ms: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = Some(command);
        self.has_pending.store(true, Ordering::Release);
        self.quiet_ms.fetch_min(quiet_ms, Ordering::AcqRel);
    }

    /// Lock-free eligibility check; may be stale.
    pub(crate) fn is_eligible(&self, now_ms: u64) -> bool {
        if self.status() == TaskStatus::Running || !self.has_pending.load(Ordering::Acquire) {
            return false;
        }
        let last = self.last_finish_ms.load(Ordering::Acquire);
        last == NEVER || now_ms.saturating_sub(last) >= self.quiet_ms()
    }

    /// Take the pending command and mark the task running.
    pub(crate) fn try_claim(&self, now_ms: u64) -> Option<Command> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_eligible(now_ms) {
            return None;
        }
        let command = pending.take()?;
        self.has_pending.store(false, Ordering::Release);
        self.status
            .store(TaskStatus::Running.as_u8(), Ordering::Release);
        Some(command)
    }

    pub(crate) fn finish(&self, now_ms: u64) {
        self.last_finish_ms.store(now_ms, Ordering::Release);
        self.status
            .store(TaskStatus::Completed.as_u8(), Ordering::Release);
    }
}
