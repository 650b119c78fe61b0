//! Record schema for builds, issues and defects.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// CI build id, unique within one server.
pub type BuildId = u64;

/// Synthetic defect id, allocated from a monotonic sequence.
pub type DefectId = u64;

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

/// Raw commit hash bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitHash(Vec<u8>);

impl CommitHash {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        CommitHash(bytes.into())
    }

    /// Parse a hex-encoded hash (case-insensitive).
    pub fn from_hex(s: &str) -> Result<Self, StorageError> {
        hex::decode(s)
            .map(CommitHash)
            .map_err(|e| StorageError::InvalidRecord(format!("bad commit hash {s:?}: {e}")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short form (first 8 hex chars).
    pub fn short(&self) -> String {
        let full = hex::encode(&self.0);
        full[..8.min(full.len())].to_string()
    }
}

impl std::fmt::Display for CommitHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// `(server, build)` pair identifying a build across the fleet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildRef {
    pub server_id: String,
    pub build_id: BuildId,
}

impl BuildRef {
    pub fn new(server_id: impl Into<String>, build_id: BuildId) -> Self {
        Self {
            server_id: server_id.into(),
            build_id,
        }
    }
}

impl std::fmt::Display for BuildRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.server_id, self.build_id)
    }
}

/// A VCS root's commit pointer recorded against a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub commit: CommitHash,
    pub vcs_root: String,
}

/// A source commit attributed to a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: u64,
    pub commit: CommitHash,
    pub author: String,
    pub web_url: Option<String>,
}

/// Read-only view of one CI build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSnapshot {
    pub server_id: String,
    pub build_id: BuildId,
    pub branch: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub revisions: Vec<Revision>,
    /// Empty when changes could not be resolved.
    pub changes: Vec<Change>,
    pub tags: BTreeSet<String>,
}

impl BuildSnapshot {
    pub fn new(server_id: impl Into<String>, build_id: BuildId) -> Self {
        Self {
            server_id: server_id.into(),
            build_id,
            branch: None,
            start_at: None,
            revisions: Vec::new(),
            changes: Vec::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn build_ref(&self) -> BuildRef {
        BuildRef::new(self.server_id.clone(), self.build_id)
    }

    /// Commit hashes of the build's changes, falling back to the commit
    /// hashes of its revisions when no change is known.
    pub fn fingerprint(&self) -> BTreeSet<CommitHash> {
        if !self.changes.is_empty() {
            return self.changes.iter().map(|c| c.commit.clone()).collect();
        }
        self.revisions.iter().map(|r| r.commit.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

/// Recognised failure patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IssueType {
    NewFailure,
    NewContributedTestFailure,
    NewFailureForFlakyTest,
    NewCriticalFailure,
    NewTrustedSuiteFailure,
    NewTestWithHighFlakyRate,
    AlwaysFailure,
}

impl IssueType {
    pub const ALL: [IssueType; 7] = [
        IssueType::NewFailure,
        IssueType::NewContributedTestFailure,
        IssueType::NewFailureForFlakyTest,
        IssueType::NewCriticalFailure,
        IssueType::NewTrustedSuiteFailure,
        IssueType::NewTestWithHighFlakyRate,
        IssueType::AlwaysFailure,
    ];

    /// Stable persisted code.
    pub fn code(&self) -> &'static str {
        match self {
            IssueType::NewFailure => "newFailure",
            IssueType::NewContributedTestFailure => "newContributedTestFailure",
            IssueType::NewFailureForFlakyTest => "newFailureForFlakyTest",
            IssueType::NewCriticalFailure => "newCriticalFailure",
            IssueType::NewTrustedSuiteFailure => "newTrustedSuiteFailure",
            IssueType::NewTestWithHighFlakyRate => "newTestWithHighFlakyRate",
            IssueType::AlwaysFailure => "newAlwaysFailure",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            IssueType::NewFailure => "New test failure",
            IssueType::NewContributedTestFailure => "Recently contributed test failed",
            IssueType::NewFailureForFlakyTest => "New stable failure of a flaky test",
            IssueType::NewCriticalFailure => "New Critical Failure",
            IssueType::NewTrustedSuiteFailure => "New Trusted Suite failure",
            IssueType::NewTestWithHighFlakyRate => "Test with high flaky rate",
            IssueType::AlwaysFailure => "Always failed test",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, StorageError> {
        Self::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or_else(|| StorageError::InvalidRecord(format!("unknown issue type code: {code}")))
    }

    pub fn from_display_name(name: &str) -> Result<Self, StorageError> {
        Self::ALL
            .into_iter()
            .find(|t| t.display_name() == name)
            .ok_or_else(|| StorageError::InvalidRecord(format!("unknown issue type: {name}")))
    }
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Natural key of an issue: one detection per (server, build, name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IssueKey {
    pub server_id: String,
    pub build_id: BuildId,
    pub test_or_suite_name: String,
}

impl IssueKey {
    pub fn new(server_id: impl Into<String>, build_id: BuildId, name: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            build_id,
            test_or_suite_name: name.into(),
        }
    }

    pub fn build_ref(&self) -> BuildRef {
        BuildRef::new(self.server_id.clone(), self.build_id)
    }
}

impl std::fmt::Display for IssueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{}:{}",
            self.server_id, self.build_id, self.test_or_suite_name
        )
    }
}

/// Author and link of a change implicated in an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRef {
    pub author: String,
    pub web_url: Option<String>,
}

/// Subscriber counters recorded while planning notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberStat {
    pub server_allowed: u32,
    pub subscribed: u32,
    pub tags_filter_passed: u32,
}

/// A detected occurrence of a failure pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_key: IssueKey,
    pub issue_type: IssueType,
    pub tracked_branch: Option<String>,
    pub display_name: Option<String>,
    pub web_url: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub build_start_at: Option<DateTime<Utc>>,
    pub flaky_rate: f64,
    pub changes: Vec<ChangeRef>,
    pub addresses_notified: BTreeSet<String>,
    /// Address -> last failure reason.
    pub notification_failed: BTreeMap<String, String>,
    pub notification_retry: u32,
    pub subscriber_stat: SubscriberStat,
    pub build_tags: BTreeSet<String>,
}

impl Issue {
    pub fn new(issue_key: IssueKey, issue_type: IssueType, detected_at: DateTime<Utc>) -> Self {
        Self {
            issue_key,
            issue_type,
            tracked_branch: None,
            display_name: None,
            web_url: None,
            detected_at,
            build_start_at: None,
            flaky_rate: 0.0,
            changes: Vec::new(),
            addresses_notified: BTreeSet::new(),
            notification_failed: BTreeMap::new(),
            notification_retry: 0,
            subscriber_stat: SubscriberStat::default(),
            build_tags: BTreeSet::new(),
        }
    }

    pub fn add_change(&mut self, author: impl Into<String>, web_url: Option<String>) {
        self.changes.push(ChangeRef {
            author: author.into(),
            web_url,
        });
    }

    /// Display name, falling back to the test or suite name.
    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or(&self.issue_key.test_or_suite_name)
    }

    /// One-line plain text rendering used in notification bodies.
    pub fn to_plain_text(&self, include_changes: bool) -> String {
        let mut out = self.issue_type.display_name().to_string();
        if let Some(branch) = &self.tracked_branch {
            out.push_str(" in ");
            out.push_str(branch);
        }
        out.push(' ');
        out.push_str(self.display_name());
        if let Some(url) = &self.web_url {
            out.push(' ');
            out.push_str(url);
        }
        if include_changes {
            if self.changes.is_empty() {
                out.push_str("\n No changes in the build");
            } else {
                out.push_str("\n Changes may lead to failure were done by");
                for change in &self.changes {
                    out.push_str("\n\t - ");
                    out.push_str(&change.author);
                    if let Some(url) = &change.web_url {
                        out.push(' ');
                        out.push_str(url);
                    }
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Defects
// ---------------------------------------------------------------------------

/// Issue reference stored inside a defect's build entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectIssue {
    pub issue_type: IssueType,
    pub test_name: String,
    pub flaky_rate: f64,
}

/// Denormalized, non-owning copy of a member build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectBuild {
    pub build_id: BuildId,
    pub branch: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub fingerprint: BTreeSet<CommitHash>,
    pub issues: Vec<DefectIssue>,
}

impl DefectBuild {
    pub fn from_snapshot(build: &BuildSnapshot) -> Self {
        Self {
            build_id: build.build_id,
            branch: build.branch.clone(),
            start_at: build.start_at,
            fingerprint: build.fingerprint(),
            issues: Vec::new(),
        }
    }

    pub fn has_issue(&self, issue_type: IssueType, test_name: &str) -> bool {
        self.issues
            .iter()
            .any(|i| i.issue_type == issue_type && i.test_name == test_name)
    }
}

/// Person suspected of introducing the defect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameCandidate {
    pub vcs_username: String,
    pub full_display_name: Option<String>,
}

/// Whether every member build of a defect can still be resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    #[default]
    Consistent,
    /// References a build that can no longer be validated; kept for
    /// manual resolution and excluded from age-based removal.
    Broken,
}

/// Deduplicated cluster of builds believed to share one root cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defect {
    pub id: DefectId,
    pub server_id: String,
    pub tracked_branch: Option<String>,
    pub builds_involved: BTreeMap<BuildId, DefectBuild>,
    pub blame_candidates: Vec<BlameCandidate>,
    pub created_at: DateTime<Utc>,
    /// `None` while the defect is open.
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub superseded_by: Option<DefectId>,
    pub consistency: Consistency,
}

impl Defect {
    pub fn new(id: DefectId, server_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            server_id: server_id.into(),
            tracked_branch: None,
            builds_involved: BTreeMap::new(),
            blame_candidates: Vec::new(),
            created_at,
            resolved_at: None,
            resolved_by: None,
            superseded_by: None,
            consistency: Consistency::Consistent,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn has_build(&self, build_id: BuildId) -> bool {
        self.builds_involved.contains_key(&build_id)
    }

    pub fn shares_fingerprint(&self, fingerprint: &BTreeSet<CommitHash>) -> bool {
        self.builds_involved
            .values()
            .any(|b| !b.fingerprint.is_disjoint(fingerprint))
    }

    /// Insert the build unless already a member. Returns `true` when added.
    pub fn add_build(&mut self, build: DefectBuild) -> bool {
        if self.has_build(build.build_id) {
            return false;
        }
        self.builds_involved.insert(build.build_id, build);
        true
    }

    /// Attach an issue to a member build. Returns `true` when something changed.
    pub fn attach_issue(&mut self, build_id: BuildId, issue: DefectIssue) -> bool {
        match self.builds_involved.get_mut(&build_id) {
            Some(build) if !build.has_issue(issue.issue_type, &issue.test_name) => {
                build.issues.push(issue);
                true
            }
            _ => false,
        }
    }

    pub fn member_refs(&self) -> impl Iterator<Item = BuildRef> + '_ {
        self.builds_involved
            .keys()
            .map(move |id| BuildRef::new(self.server_id.clone(), *id))
    }

    pub fn set_tracked_branch_if_empty(&mut self, branch: Option<&str>) {
        if self.tracked_branch.is_none() {
            self.tracked_branch = branch.map(str::to_string);
        }
    }

    /// Mark resolved. Fails when the defect is not open.
    pub fn resolve(&mut self, by: Option<String>, at: DateTime<Utc>) -> Result<(), StorageError> {
        if !self.is_open() {
            return Err(StorageError::InvalidRecord(format!(
                "defect {} is already resolved",
                self.id
            )));
        }
        self.resolved_at = Some(at);
        self.resolved_by = by;
        Ok(())
    }
}
