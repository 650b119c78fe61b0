//! Age-based garbage collection of defects and issues.
//!
//! Guards:
//! - open defects are never removed
//! - defects flagged `Broken` are never removed by age; an operator
//!   discards them through [`Cleaner::discard_broken`]
//! - issues whose build belongs to an open defect are never removed

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use healthbot_state::{
    BuildRef, BuildRepository, Consistency, Defect, DefectId, DefectRepository, IssueRepository,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CleanerConfig;
use crate::error::{HealthError, Result};
use crate::obs;

/// Outcome of one cleaner run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub broken_flagged: usize,
    pub broken_restored: usize,
    pub defects_removed: usize,
    pub issues_removed: usize,
}

pub struct Cleaner {
    issues: Arc<dyn IssueRepository>,
    builds: Arc<dyn BuildRepository>,
    defects: Arc<dyn DefectRepository>,
    config: CleanerConfig,
}

impl Cleaner {
    pub fn new(
        issues: Arc<dyn IssueRepository>,
        builds: Arc<dyn BuildRepository>,
        defects: Arc<dyn DefectRepository>,
        config: CleanerConfig,
    ) -> Self {
        Self {
            issues,
            builds,
            defects,
            config,
        }
    }

    /// Run one pass: consistency check, then bounded removal of old defects
    /// and old issues.
    pub async fn clean(&self) -> Result<CleanReport> {
        if !self.config.enabled {
            info!("periodic clean disabled");
            return Ok(CleanReport::default());
        }

        let threshold = Utc::now() - Duration::days(self.config.safe_days);
        let budget = self.config.items_to_delete;
        info!(%threshold, budget, "removing records older than threshold");

        let (broken_flagged, broken_restored) = self.check_consistency().await?;
        let defects_removed = self.defects.remove_old_defects(threshold, budget).await?;

        let protected = self.protected_builds().await?;
        let issues_removed = self
            .issues
            .remove_old_issues(threshold, budget, &protected)
            .await?;

        obs::emit_gc_finished(broken_flagged, broken_restored, defects_removed, issues_removed);
        Ok(CleanReport {
            broken_flagged,
            broken_restored,
            defects_removed,
            issues_removed,
        })
    }

    /// Re-validate every defect against the build repository.
    ///
    /// Defects referencing an unresolvable build are flagged `Broken`;
    /// broken defects whose builds all resolve again go back to
    /// `Consistent`. Returns `(newly_broken, restored)`.
    pub async fn check_consistency(&self) -> Result<(usize, usize)> {
        let (mut flagged, mut restored) = (0, 0);
        for defect in self.defects.load_all().await? {
            let mut missing = None;
            for member in defect.member_refs() {
                if self
                    .builds
                    .get_build(&member.server_id, member.build_id)
                    .await?
                    .is_none()
                {
                    missing = Some(member);
                    break;
                }
            }

            let wanted = match &missing {
                Some(_) => Consistency::Broken,
                None => Consistency::Consistent,
            };
            if defect.consistency == wanted {
                continue;
            }
            let changed = self
                .defects
                .update(defect.id, &|d| {
                    if d.consistency == wanted {
                        return false;
                    }
                    d.consistency = wanted;
                    true
                })
                .await?;
            if !changed {
                continue;
            }
            match missing {
                Some(member) => {
                    warn!(defect_id = defect.id, build = %member, "defect references unresolvable build");
                    flagged += 1;
                }
                None => {
                    info!(defect_id = defect.id, "broken defect is consistent again");
                    restored += 1;
                }
            }
        }
        debug!(flagged, restored, "consistency check finished");
        Ok((flagged, restored))
    }

    /// Defects currently flagged `Broken`, awaiting manual resolution.
    pub async fn broken_defects(&self) -> Result<Vec<Defect>> {
        Ok(self
            .defects
            .load_all()
            .await?
            .into_iter()
            .filter(|d| d.consistency == Consistency::Broken)
            .collect())
    }

    /// Drop a broken defect on behalf of `user`. Only broken defects can be
    /// discarded this way.
    pub async fn discard_broken(&self, id: DefectId, user: &str) -> Result<()> {
        let defect = self
            .defects
            .load(id)
            .await?
            .ok_or(HealthError::DefectNotFound(id))?;
        if defect.consistency != Consistency::Broken {
            return Err(HealthError::DefectNotBroken(id));
        }
        self.defects.remove(id).await?;
        info!(defect_id = id, user = %user, "broken defect discarded");
        Ok(())
    }

    /// Builds held by open defects.
    async fn protected_builds(&self) -> Result<HashSet<BuildRef>> {
        Ok(self
            .defects
            .load_all_defects()
            .await?
            .iter()
            .flat_map(|d| d.member_refs().collect::<Vec<_>>())
            .collect())
    }
}
