//! Run history of a single test or suite on one branch.
//!
//! A history is an append-only, chronologically ordered list of
//! `(build_id, RunStatus)` pairs. The matcher reads it backward from the
//! newest entry; the detector uses the derived statistics below to decide
//! whether an identity is flaky.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::schema::BuildId;

/// Outcome of one test or suite in one build.
///
/// `OkOrFailure` is a wildcard used only inside event templates; it never
/// appears in a recorded history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Failure,
    CriticalFailure,
    Missing,
    OkOrFailure,
}

impl RunStatus {
    /// Stable persisted code.
    pub fn code(&self) -> u8 {
        match self {
            RunStatus::Ok => 0,
            RunStatus::Failure => 1,
            RunStatus::CriticalFailure => 3,
            RunStatus::Missing => 4,
            RunStatus::OkOrFailure => 10,
        }
    }

    /// Inverse of [`RunStatus::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RunStatus::Ok),
            1 => Some(RunStatus::Failure),
            3 => Some(RunStatus::CriticalFailure),
            4 => Some(RunStatus::Missing),
            10 => Some(RunStatus::OkOrFailure),
            _ => None,
        }
    }

    /// Failure or critical failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, RunStatus::Failure | RunStatus::CriticalFailure)
    }
}

/// One recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub build_id: BuildId,
    pub status: RunStatus,
}

/// Chronological outcome timeline, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistory {
    entries: Vec<Invocation>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a history from `(build_id, status)` pairs, oldest first.
    pub fn from_entries<I>(entries: I) -> Result<Self, StorageError>
    where
        I: IntoIterator<Item = (BuildId, RunStatus)>,
    {
        let mut history = Self::new();
        for (build_id, status) in entries {
            history.append(build_id, status)?;
        }
        Ok(history)
    }

    /// Append the latest outcome.
    ///
    /// Rejects the template-only wildcard status.
    pub fn append(&mut self, build_id: BuildId, status: RunStatus) -> Result<(), StorageError> {
        if status == RunStatus::OkOrFailure {
            return Err(StorageError::InvalidRecord(format!(
                "build {build_id}: wildcard status cannot be recorded"
            )));
        }
        self.entries.push(Invocation { build_id, status });
        Ok(())
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[Invocation] {
        &self.entries
    }

    /// The newest `n` entries, oldest first.
    pub fn latest(&self, n: usize) -> &[Invocation] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry that is not `Missing`, across the whole history.
    pub fn first_non_missing(&self) -> Option<&Invocation> {
        self.entries.iter().find(|i| i.status != RunStatus::Missing)
    }

    /// Newest entry that is not `Missing`.
    pub fn last_non_missing(&self) -> Option<&Invocation> {
        self.entries
            .iter()
            .rev()
            .find(|i| i.status != RunStatus::Missing)
    }

    /// Number of entries where the identity actually ran.
    pub fn runs_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|i| i.status != RunStatus::Missing)
            .count()
    }

    /// Number of status flips between consecutive non-missing entries.
    pub fn status_changes(&self) -> usize {
        let mut changes = 0;
        let mut prev: Option<RunStatus> = None;
        for inv in self.entries.iter().filter(|i| i.status != RunStatus::Missing) {
            if let Some(p) = prev {
                if p != inv.status {
                    changes += 1;
                }
            }
            prev = Some(inv.status);
        }
        changes
    }

    /// Flaky when the status flipped at least `border` times.
    pub fn is_flaky(&self, border: usize) -> bool {
        self.status_changes() >= border
    }

    /// Status flips per run, as a percentage.
    pub fn flaky_rate(&self) -> f64 {
        let runs = self.runs_count();
        if runs == 0 {
            return 0.0;
        }
        self.status_changes() as f64 * 100.0 / runs as f64
    }
}
