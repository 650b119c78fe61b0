//! Issue detection: run every template over each tracked history and
//! register new issues.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use healthbot_state::storage_traits::HistoryIdentity;
use healthbot_state::{
    BuildId, BuildRepository, Issue, IssueKey, IssueRepository, IssueType, RunHistory,
    RunHistorySource,
};
use tracing::{debug, warn};

use crate::config::DetectionConfig;
use crate::error::Result;
use crate::matcher::detect;
use crate::obs;
use crate::template::{registry, TemplateKind};

/// Turns run histories into persisted issues.
pub struct IssueDetector {
    histories: Arc<dyn RunHistorySource>,
    builds: Arc<dyn BuildRepository>,
    issues: Arc<dyn IssueRepository>,
    config: DetectionConfig,
    trusted_suites: HashSet<String>,
}

impl IssueDetector {
    pub fn new(
        histories: Arc<dyn RunHistorySource>,
        builds: Arc<dyn BuildRepository>,
        issues: Arc<dyn IssueRepository>,
        config: DetectionConfig,
    ) -> Self {
        let trusted_suites = config.trusted_suites.iter().cloned().collect();
        Self {
            histories,
            builds,
            issues,
            config,
            trusted_suites,
        }
    }

    /// Issue types detected in `history`, with the build each one points at.
    ///
    /// Pure: nothing is read from or written to storage.
    pub fn classify(
        &self,
        identity: &HistoryIdentity,
        history: &RunHistory,
    ) -> Vec<(IssueType, BuildId)> {
        let flaky = history.is_flaky(self.config.flaky_status_change_border);
        let mut found = Vec::new();

        for (kind, template) in registry() {
            let Some(build_id) = detect(history, template) else {
                continue;
            };
            let issue_type = match kind {
                TemplateKind::NewFailure if flaky => {
                    debug!(name = %identity.name, "skipping new failure of a flaky history");
                    continue;
                }
                TemplateKind::NewFailure if self.trusted_suites.contains(identity.suite_name()) => {
                    IssueType::NewTrustedSuiteFailure
                }
                // Without flakiness this transition is already a plain new failure.
                TemplateKind::NewFailureForFlakyTest if !flaky => continue,
                other => other.issue_type(),
            };
            found.push((issue_type, build_id));
        }

        if history.flaky_rate() >= self.config.high_flaky_rate_percent {
            if let Some(last) = history.last_non_missing() {
                if last.status.is_failure() {
                    found.push((IssueType::NewTestWithHighFlakyRate, last.build_id));
                }
            }
        }

        found
    }

    /// Register issues found in one identity's history.
    ///
    /// Returns the keys of newly stored issues. Keys that already exist are
    /// left untouched.
    pub async fn check_identity(
        &self,
        server_id: &str,
        tracked_branch: &str,
        identity: &HistoryIdentity,
        history: &RunHistory,
    ) -> Result<Vec<IssueKey>> {
        let mut registered = Vec::new();

        for (issue_type, build_id) in self.classify(identity, history) {
            let key = IssueKey::new(server_id, build_id, identity.name.clone());
            if registered.contains(&key) || self.issues.contains_issue_key(&key).await? {
                continue;
            }

            let mut issue = Issue::new(key.clone(), issue_type, Utc::now());
            issue.tracked_branch = Some(tracked_branch.to_string());
            issue.flaky_rate = history.flaky_rate();

            match self.builds.get_build(server_id, build_id).await? {
                Some(build) => {
                    issue.build_start_at = build.start_at;
                    issue.build_tags = build.tags.clone();
                    for change in &build.changes {
                        issue.add_change(change.author.clone(), change.web_url.clone());
                    }
                }
                None => debug!(issue = %key, "build snapshot not available"),
            }

            self.issues.save_issue(issue).await?;
            obs::emit_issue_registered(&key, issue_type);
            registered.push(key);
        }

        Ok(registered)
    }

    /// Check every identity recorded on a branch. Failures are logged per
    /// identity and do not stop the sweep. Returns the number of new issues.
    pub async fn check_branch(&self, server_id: &str, branch: &str) -> Result<usize> {
        let identities = self.histories.identities(server_id, branch).await?;
        let mut new_issues = 0;

        for identity in identities {
            let history = match self.histories.history(server_id, &identity, branch).await {
                Ok(Some(history)) => history,
                Ok(None) => continue,
                Err(e) => {
                    warn!(server = %server_id, name = %identity.name, error = %e, "history unavailable");
                    continue;
                }
            };

            match self
                .check_identity(server_id, branch, &identity, &history)
                .await
            {
                Ok(keys) => new_issues += keys.len(),
                Err(e) => {
                    warn!(server = %server_id, name = %identity.name, error = %e, "issue check failed")
                }
            }
        }

        debug!(server = %server_id, branch = %branch, new_issues, "branch checked");
        Ok(new_issues)
    }
}
