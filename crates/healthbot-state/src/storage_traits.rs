//! Storage trait definitions for the health bot
//!
//! These traits define the repositories the decision core talks to:
//! - `RunHistorySource`: per-identity outcome timelines
//! - `BuildRepository`: build snapshots (revisions, changes)
//! - `DefectRepository`: clustered defects with atomic per-key update
//! - `IssueRepository`: detected issues and notification bookkeeping
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::history::{RunHistory, RunStatus};
use crate::schema::{BuildId, BuildRef, BuildSnapshot, Defect, DefectId, Issue, IssueKey, SubscriberStat};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// RunHistorySource: Outcome Timelines
// ---------------------------------------------------------------------------

/// A test or suite whose outcomes are tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryIdentity {
    /// Full test name, or the suite name for suite-level histories.
    pub name: String,
    /// Owning suite; `None` when this identity is itself a suite.
    pub suite_name: Option<String>,
}

impl HistoryIdentity {
    pub fn suite(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            suite_name: None,
        }
    }

    pub fn test(suite_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            suite_name: Some(suite_name.into()),
        }
    }

    pub fn is_suite(&self) -> bool {
        self.suite_name.is_none()
    }

    /// Suite this identity belongs to (itself for suites).
    pub fn suite_name(&self) -> &str {
        self.suite_name.as_deref().unwrap_or(&self.name)
    }
}

/// Source of run histories, keyed by `(server, identity, branch)`.
///
/// Guarantees:
/// - `history` returns entries oldest first.
/// - `append` only ever adds at the newest end.
#[async_trait]
pub trait RunHistorySource: Send + Sync {
    /// All identities with a recorded history on a branch.
    async fn identities(&self, server_id: &str, branch: &str)
        -> StorageResult<Vec<HistoryIdentity>>;

    /// History for one identity; `None` when nothing is recorded.
    async fn history(
        &self,
        server_id: &str,
        identity: &HistoryIdentity,
        branch: &str,
    ) -> StorageResult<Option<RunHistory>>;

    /// Record the newest outcome for an identity.
    async fn append(
        &self,
        server_id: &str,
        identity: &HistoryIdentity,
        branch: &str,
        build_id: BuildId,
        status: RunStatus,
    ) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// BuildRepository: Build Snapshots
// ---------------------------------------------------------------------------

/// Read-mostly store of build snapshots.
#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// Resolve a build. `None` when the build is unknown or was purged.
    async fn get_build(&self, server_id: &str, build_id: BuildId)
        -> StorageResult<Option<BuildSnapshot>>;

    /// Insert or replace a snapshot.
    async fn put_build(&self, build: BuildSnapshot) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// DefectRepository: Clustered Defects
// ---------------------------------------------------------------------------

/// Defect store.
///
/// Guarantees:
/// - `next_id` never returns the same id twice for one repository.
/// - `update` is an atomic read-modify-write on a single defect; the
///   closure's result decides whether the modified record is written.
/// - `remove_old_defects` never removes an open or broken defect.
#[async_trait]
pub trait DefectRepository: Send + Sync {
    /// Allocate the next defect id.
    async fn next_id(&self) -> StorageResult<DefectId>;

    async fn load(&self, id: DefectId) -> StorageResult<Option<Defect>>;

    /// Insert or replace a defect by id.
    async fn save(&self, defect: Defect) -> StorageResult<()>;

    /// Atomically modify a defect. Returns whether the change was saved.
    /// Fails with `StorageError::DefectNotFound` if the id is absent.
    async fn update(
        &self,
        id: DefectId,
        f: &(dyn for<'a> Fn(&'a mut Defect) -> bool + Send + Sync),
    ) -> StorageResult<bool>;

    /// Delete a defect regardless of its state. Returns whether it existed.
    async fn remove(&self, id: DefectId) -> StorageResult<bool>;

    /// Open defects only.
    async fn load_all_defects(&self) -> StorageResult<Vec<Defect>>;

    /// Open and resolved defects.
    async fn load_all(&self) -> StorageResult<Vec<Defect>>;

    /// Remove at most `budget` resolved, consistent defects resolved before
    /// `threshold`. Returns the number removed.
    async fn remove_old_defects(
        &self,
        threshold: DateTime<Utc>,
        budget: usize,
    ) -> StorageResult<usize>;
}

// ---------------------------------------------------------------------------
// IssueRepository: Detected Issues
// ---------------------------------------------------------------------------

/// Issue store with notification bookkeeping.
#[async_trait]
pub trait IssueRepository: Send + Sync {
    /// Insert or replace an issue by key.
    async fn save_issue(&self, issue: Issue) -> StorageResult<()>;

    async fn get_issue(&self, key: &IssueKey) -> StorageResult<Option<Issue>>;

    async fn contains_issue_key(&self, key: &IssueKey) -> StorageResult<bool>;

    async fn all_issues(&self) -> StorageResult<Vec<Issue>>;

    /// Remove at most `budget` issues detected before `threshold`, skipping
    /// any whose build is in `protected_builds`. Returns the number removed.
    async fn remove_old_issues(
        &self,
        threshold: DateTime<Utc>,
        budget: usize,
        protected_builds: &HashSet<BuildRef>,
    ) -> StorageResult<usize>;

    /// Notification handshake for one `(issue, address)` pair.
    ///
    /// With `error == None`: marks the address notified and returns `true`
    /// if it was not notified before. Returns `false` once the retry counter
    /// reached `max_retries` for an address that failed earlier.
    ///
    /// With `error == Some(reason)`: records the failure, un-marks the
    /// address while the retry counter is below `max_retries`, increments
    /// the counter, and returns `true`.
    ///
    /// An unknown key returns `false`.
    async fn get_is_new_and_set_notified(
        &self,
        key: &IssueKey,
        address: &str,
        error: Option<&str>,
        max_retries: u32,
    ) -> StorageResult<bool>;

    /// Store subscriber counters on an issue. No-op for an unknown key.
    async fn save_subscribers_stat(&self, key: &IssueKey, stat: SubscriberStat)
        -> StorageResult<()>;
}
