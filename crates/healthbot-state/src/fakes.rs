//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryRunHistorySource`, `MemoryBuildRepository`,
//! `MemoryDefectStore` and `MemoryIssueStore` that satisfy the trait
//! contracts without any external dependencies.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::StorageError;
use crate::history::{RunHistory, RunStatus};
use crate::schema::*;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryRunHistorySource
// ---------------------------------------------------------------------------

/// In-memory histories keyed by `(server, branch)`, identities kept in
/// insertion order.
#[derive(Debug, Default)]
pub struct MemoryRunHistorySource {
    branches: Mutex<HashMap<(String, String), Vec<(HistoryIdentity, RunHistory)>>>,
}

impl MemoryRunHistorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole history of one identity.
    pub fn insert_history(
        &self,
        server_id: &str,
        branch: &str,
        identity: HistoryIdentity,
        history: RunHistory,
    ) {
        let mut branches = self.branches.lock().unwrap();
        let entries = branches
            .entry((server_id.to_string(), branch.to_string()))
            .or_default();
        match entries.iter_mut().find(|(id, _)| *id == identity) {
            Some((_, h)) => *h = history,
            None => entries.push((identity, history)),
        }
    }
}

#[async_trait]
impl RunHistorySource for MemoryRunHistorySource {
    async fn identities(
        &self,
        server_id: &str,
        branch: &str,
    ) -> StorageResult<Vec<HistoryIdentity>> {
        let branches = self.branches.lock().unwrap();
        Ok(branches
            .get(&(server_id.to_string(), branch.to_string()))
            .map(|entries| entries.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default())
    }

    async fn history(
        &self,
        server_id: &str,
        identity: &HistoryIdentity,
        branch: &str,
    ) -> StorageResult<Option<RunHistory>> {
        let branches = self.branches.lock().unwrap();
        Ok(branches
            .get(&(server_id.to_string(), branch.to_string()))
            .and_then(|entries| entries.iter().find(|(id, _)| id == identity))
            .map(|(_, h)| h.clone()))
    }

    async fn append(
        &self,
        server_id: &str,
        identity: &HistoryIdentity,
        branch: &str,
        build_id: BuildId,
        status: RunStatus,
    ) -> StorageResult<()> {
        let mut branches = self.branches.lock().unwrap();
        let entries = branches
            .entry((server_id.to_string(), branch.to_string()))
            .or_default();
        match entries.iter_mut().find(|(id, _)| id == identity) {
            Some((_, h)) => h.append(build_id, status),
            None => {
                let mut history = RunHistory::new();
                history.append(build_id, status)?;
                entries.push((identity.clone(), history));
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBuildRepository
// ---------------------------------------------------------------------------

/// In-memory build snapshots backed by a `HashMap<BuildRef, BuildSnapshot>`.
#[derive(Debug, Default)]
pub struct MemoryBuildRepository {
    builds: Mutex<HashMap<BuildRef, BuildSnapshot>>,
}

impl MemoryBuildRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget a build, as if it was purged upstream.
    pub fn remove_build(&self, server_id: &str, build_id: BuildId) {
        let mut builds = self.builds.lock().unwrap();
        builds.remove(&BuildRef::new(server_id, build_id));
    }
}

#[async_trait]
impl BuildRepository for MemoryBuildRepository {
    async fn get_build(
        &self,
        server_id: &str,
        build_id: BuildId,
    ) -> StorageResult<Option<BuildSnapshot>> {
        let builds = self.builds.lock().unwrap();
        Ok(builds.get(&BuildRef::new(server_id, build_id)).cloned())
    }

    async fn put_build(&self, build: BuildSnapshot) -> StorageResult<()> {
        let mut builds = self.builds.lock().unwrap();
        builds.insert(build.build_ref(), build);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryDefectStore
// ---------------------------------------------------------------------------

/// In-memory defect store backed by a `BTreeMap<DefectId, Defect>`.
///
/// The id sequence lives in the store instance.
#[derive(Debug, Default)]
pub struct MemoryDefectStore {
    defects: Mutex<BTreeMap<DefectId, Defect>>,
    sequence: AtomicU64,
}

impl MemoryDefectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefectRepository for MemoryDefectStore {
    async fn next_id(&self) -> StorageResult<DefectId> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn load(&self, id: DefectId) -> StorageResult<Option<Defect>> {
        let defects = self.defects.lock().unwrap();
        Ok(defects.get(&id).cloned())
    }

    async fn save(&self, defect: Defect) -> StorageResult<()> {
        let mut defects = self.defects.lock().unwrap();
        defects.insert(defect.id, defect);
        Ok(())
    }

    async fn update(
        &self,
        id: DefectId,
        f: &(dyn for<'a> Fn(&'a mut Defect) -> bool + Send + Sync),
    ) -> StorageResult<bool> {
        let mut defects = self.defects.lock().unwrap();
        let current = defects
            .get(&id)
            .ok_or(StorageError::DefectNotFound { id })?;
        let mut working = current.clone();
        if !f(&mut working) {
            return Ok(false);
        }
        defects.insert(id, working);
        Ok(true)
    }

    async fn remove(&self, id: DefectId) -> StorageResult<bool> {
        let mut defects = self.defects.lock().unwrap();
        Ok(defects.remove(&id).is_some())
    }

    async fn load_all_defects(&self) -> StorageResult<Vec<Defect>> {
        let defects = self.defects.lock().unwrap();
        Ok(defects.values().filter(|d| d.is_open()).cloned().collect())
    }

    async fn load_all(&self) -> StorageResult<Vec<Defect>> {
        let defects = self.defects.lock().unwrap();
        Ok(defects.values().cloned().collect())
    }

    async fn remove_old_defects(
        &self,
        threshold: DateTime<Utc>,
        budget: usize,
    ) -> StorageResult<usize> {
        let mut defects = self.defects.lock().unwrap();
        let victims: Vec<DefectId> = defects
            .values()
            .filter(|d| d.consistency == Consistency::Consistent)
            .filter(|d| d.resolved_at.map(|at| at < threshold).unwrap_or(false))
            .map(|d| d.id)
            .take(budget)
            .collect();
        for id in &victims {
            defects.remove(id);
        }
        debug!(removed = victims.len(), %threshold, "old defects removed");
        Ok(victims.len())
    }
}

// ---------------------------------------------------------------------------
// MemoryIssueStore
// ---------------------------------------------------------------------------

/// In-memory issue store backed by a `BTreeMap<IssueKey, Issue>`.
#[derive(Debug, Default)]
pub struct MemoryIssueStore {
    issues: Mutex<BTreeMap<IssueKey, Issue>>,
}

impl MemoryIssueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IssueRepository for MemoryIssueStore {
    async fn save_issue(&self, issue: Issue) -> StorageResult<()> {
        let mut issues = self.issues.lock().unwrap();
        issues.insert(issue.issue_key.clone(), issue);
        Ok(())
    }

    async fn get_issue(&self, key: &IssueKey) -> StorageResult<Option<Issue>> {
        let issues = self.issues.lock().unwrap();
        Ok(issues.get(key).cloned())
    }

    async fn contains_issue_key(&self, key: &IssueKey) -> StorageResult<bool> {
        let issues = self.issues.lock().unwrap();
        Ok(issues.contains_key(key))
    }

    async fn all_issues(&self) -> StorageResult<Vec<Issue>> {
        let issues = self.issues.lock().unwrap();
        Ok(issues.values().cloned().collect())
    }

    async fn remove_old_issues(
        &self,
        threshold: DateTime<Utc>,
        budget: usize,
        protected_builds: &HashSet<BuildRef>,
    ) -> StorageResult<usize> {
        let mut issues = self.issues.lock().unwrap();
        let victims: Vec<IssueKey> = issues
            .values()
            .filter(|i| i.detected_at < threshold)
            .filter(|i| !protected_builds.contains(&i.issue_key.build_ref()))
            .map(|i| i.issue_key.clone())
            .take(budget)
            .collect();
        for key in &victims {
            issues.remove(key);
        }
        debug!(removed = victims.len(), %threshold, "old issues removed");
        Ok(victims.len())
    }

    async fn get_is_new_and_set_notified(
        &self,
        key: &IssueKey,
        address: &str,
        error: Option<&str>,
        max_retries: u32,
    ) -> StorageResult<bool> {
        let mut issues = self.issues.lock().unwrap();
        let Some(issue) = issues.get_mut(key) else {
            return Ok(false);
        };

        match error {
            None => {
                if issue.notification_retry >= max_retries
                    && issue.notification_failed.contains_key(address)
                {
                    return Ok(false);
                }
                let added = issue.addresses_notified.insert(address.to_string());
                if added {
                    issue.notification_failed.remove(address);
                }
                Ok(added)
            }
            Some(reason) => {
                if issue.notification_retry < max_retries {
                    issue.addresses_notified.remove(address);
                }
                issue.notification_retry += 1;
                issue
                    .notification_failed
                    .insert(address.to_string(), reason.to_string());
                Ok(true)
            }
        }
    }

    async fn save_subscribers_stat(
        &self,
        key: &IssueKey,
        stat: SubscriberStat,
    ) -> StorageResult<()> {
        let mut issues = self.issues.lock().unwrap();
        if let Some(issue) = issues.get_mut(key) {
            issue.subscriber_stat = stat;
        }
        Ok(())
    }
}
