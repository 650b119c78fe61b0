//! Defect clustering: fold recently detected issues into defects that share
//! a source-change fingerprint.
//!
//! A pass is idempotent. Re-running it without new issues leaves every
//! defect byte-for-byte unchanged, because each step only writes when the
//! attached build, issue, branch or blame list actually changed.

use std::sync::Arc;

use chrono::{Duration, Utc};
use healthbot_state::{
    BlameCandidate, BuildRepository, BuildSnapshot, Defect, DefectBuild, DefectId, DefectIssue,
    DefectRepository, Issue, IssueRepository,
};
use serde::Serialize;
use tracing::debug;

use crate::config::ClusteringConfig;
use crate::error::{HealthError, Result};
use crate::obs;

/// Counters of one clustering pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClusteringReport {
    pub issues_checked: usize,
    pub defects_created: usize,
    pub defects_updated: usize,
    pub defects_superseded: usize,
    /// Issues whose build snapshot could not be resolved.
    pub skipped_unresolved: usize,
}

impl std::fmt::Display for ClusteringReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} defects created, {} updated, {} superseded for {} issues checked",
            self.defects_created, self.defects_updated, self.defects_superseded, self.issues_checked
        )
    }
}

/// Groups issues into defects.
pub struct DefectClusterer {
    issues: Arc<dyn IssueRepository>,
    builds: Arc<dyn BuildRepository>,
    defects: Arc<dyn DefectRepository>,
    config: ClusteringConfig,
}

impl DefectClusterer {
    pub fn new(
        issues: Arc<dyn IssueRepository>,
        builds: Arc<dyn BuildRepository>,
        defects: Arc<dyn DefectRepository>,
        config: ClusteringConfig,
    ) -> Self {
        Self {
            issues,
            builds,
            defects,
            config,
        }
    }

    /// Attach every issue detected within the lookback window to a defect.
    pub async fn cluster_new_issues(&self) -> Result<ClusteringReport> {
        let since = Utc::now() - Duration::days(self.config.issue_lookback_days);
        let mut report = ClusteringReport::default();

        let issues = self.issues.all_issues().await?;
        for issue in issues.iter().filter(|i| i.detected_at >= since) {
            report.issues_checked += 1;

            let key = &issue.issue_key;
            let Some(build) = self.builds.get_build(&key.server_id, key.build_id).await? else {
                debug!(issue = %key, "skipping issue, build not resolvable");
                report.skipped_unresolved += 1;
                continue;
            };

            self.cluster_issue(issue, &build, &mut report).await?;
        }

        Ok(report)
    }

    async fn cluster_issue(
        &self,
        issue: &Issue,
        build: &BuildSnapshot,
        report: &mut ClusteringReport,
    ) -> Result<()> {
        let defect_issue = DefectIssue {
            issue_type: issue.issue_type,
            test_name: issue.issue_key.test_or_suite_name.clone(),
            flaky_rate: issue.flaky_rate,
        };
        let branch = issue.tracked_branch.as_deref();
        let apply = |d: &mut Defect| apply_issue(d, build, &defect_issue, branch);

        let all: Vec<Defect> = self
            .defects
            .load_all()
            .await?
            .into_iter()
            .filter(|d| d.server_id == build.server_id)
            .collect();

        // A defect that already holds this build, open or resolved. Live
        // defects win over superseded ones.
        if let Some(holder) = all
            .iter()
            .filter(|d| d.has_build(build.build_id))
            .min_by_key(|d| (d.superseded_by.is_some(), !d.is_open(), d.id))
        {
            if self.defects.update(holder.id, &apply).await? {
                report.defects_updated += 1;
                obs::emit_defect_updated(holder.id, build.build_id);
            }
            return Ok(());
        }

        let fingerprint = build.fingerprint();
        let mut matches: Vec<DefectId> = all
            .iter()
            .filter(|d| d.is_open() && d.shares_fingerprint(&fingerprint))
            .map(|d| d.id)
            .collect();
        matches.sort_unstable();

        if let Some((&target, others)) = matches.split_first() {
            if !others.is_empty() {
                self.merge_into(target, others, report).await?;
            }
            if self.defects.update(target, &apply).await? {
                report.defects_updated += 1;
                obs::emit_defect_updated(target, build.build_id);
            }
            return Ok(());
        }

        let id = self.defects.next_id().await?;
        let mut defect = Defect::new(id, build.server_id.clone(), Utc::now());
        apply(&mut defect);
        self.defects.save(defect).await?;
        report.defects_created += 1;
        obs::emit_defect_created(id, &build.server_id, build.build_id);
        Ok(())
    }

    /// Move the builds of `others` into `target` and mark them superseded.
    async fn merge_into(
        &self,
        target: DefectId,
        others: &[DefectId],
        report: &mut ClusteringReport,
    ) -> Result<()> {
        let now = Utc::now();
        for &other_id in others {
            let Some(other) = self.defects.load(other_id).await? else {
                continue;
            };
            if !other.is_open() {
                continue;
            }

            self.defects
                .update(target, &|d| {
                    let mut changed = false;
                    for build in other.builds_involved.values() {
                        changed |= d.add_build(build.clone());
                    }
                    if d.blame_candidates.is_empty() && !other.blame_candidates.is_empty() {
                        d.blame_candidates = other.blame_candidates.clone();
                        changed = true;
                    }
                    changed
                })
                .await?;

            self.defects
                .update(other_id, &|d| {
                    if !d.is_open() {
                        return false;
                    }
                    d.resolved_at = Some(now);
                    d.superseded_by = Some(target);
                    true
                })
                .await?;
            report.defects_superseded += 1;
        }
        obs::emit_defect_merged(target, others);
        Ok(())
    }

    /// Resolve an open defect on behalf of `user`.
    pub async fn resolve_defect(&self, id: DefectId, user: &str) -> Result<()> {
        let defect = self
            .defects
            .load(id)
            .await?
            .ok_or(HealthError::DefectNotFound(id))?;
        if !defect.is_open() {
            return Err(HealthError::DefectAlreadyResolved(id));
        }

        let now = Utc::now();
        let resolved = self
            .defects
            .update(id, &|d| d.resolve(Some(user.to_string()), now).is_ok())
            .await?;
        if !resolved {
            return Err(HealthError::DefectAlreadyResolved(id));
        }
        debug!(defect_id = id, user = %user, "defect resolved");
        Ok(())
    }
}

/// Add `build` and `issue` to a defect. Returns whether anything changed.
fn apply_issue(
    defect: &mut Defect,
    build: &BuildSnapshot,
    issue: &DefectIssue,
    tracked_branch: Option<&str>,
) -> bool {
    let mut changed = defect.add_build(DefectBuild::from_snapshot(build));
    changed |= defect.attach_issue(build.build_id, issue.clone());

    if defect.tracked_branch.is_none() && tracked_branch.is_some() {
        defect.set_tracked_branch_if_empty(tracked_branch);
        changed = true;
    }

    if defect.blame_candidates.is_empty() {
        let candidates = blame_candidates(build);
        if !candidates.is_empty() {
            defect.blame_candidates = candidates;
            changed = true;
        }
    }
    changed
}

/// One candidate per distinct change author.
///
/// Authors written as `Full Name <email>` get their display name split out.
pub fn blame_candidates(build: &BuildSnapshot) -> Vec<BlameCandidate> {
    let mut out: Vec<BlameCandidate> = Vec::new();
    for change in &build.changes {
        if out.iter().any(|c| c.vcs_username == change.author) {
            continue;
        }
        let full_display_name = match (change.author.find('<'), change.author.find('>')) {
            (Some(start), Some(end)) if start < end => {
                let name = change.author[..start].trim();
                (!name.is_empty()).then(|| name.to_string())
            }
            _ => None,
        };
        out.push(BlameCandidate {
            vcs_username: change.author.clone(),
            full_display_name,
        });
    }
    out
}
