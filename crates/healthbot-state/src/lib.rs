//! Healthbot-State: persisted records for the CI health bot
//!
//! This crate owns the data the decision core reads and writes: run
//! histories, build snapshots, detected issues and clustered defects. The
//! actual key-value substrate is abstracted behind async repository traits so
//! the core never depends on a concrete backend.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: record shape, per-key atomicity and retention guards.
//!
//! ## Key Components
//!
//! - `RunHistory`: chronological outcome timeline of one test or suite
//! - `BuildSnapshot`: read-only view of a build's revisions and changes
//! - `Issue` / `Defect`: detection events and their deduplicated clusters
//! - `storage_traits`: repository contracts, with in-memory `fakes`

mod error;
pub mod fakes;
pub mod history;
pub mod schema;
pub mod storage_traits;

pub use error::StorageError;
pub use history::{Invocation, RunHistory, RunStatus};
pub use schema::{
    BlameCandidate, BuildId, BuildRef, BuildSnapshot, Change, ChangeRef, CommitHash,
    Consistency, Defect, DefectBuild, DefectId, DefectIssue, Issue, IssueKey, IssueType,
    Revision, SubscriberStat,
};
pub use storage_traits::{
    BuildRepository, DefectRepository, HistoryIdentity, IssueRepository, RunHistorySource,
    StorageResult,
};
