//! Cleaner guards: open defects, broken defects and protected issues survive.

use std::sync::Arc;

use chrono::{Duration, Utc};
use healthbot_core::{Cleaner, CleanerConfig, HealthError};
use healthbot_state::fakes::{MemoryBuildRepository, MemoryDefectStore, MemoryIssueStore};
use healthbot_state::{
    BuildId, BuildRepository, BuildSnapshot, Consistency, Defect, DefectBuild, DefectId,
    DefectRepository, Issue, IssueKey, IssueRepository, IssueType,
};

const OLD_DAYS: i64 = 400;

struct Fixture {
    issues: Arc<MemoryIssueStore>,
    builds: Arc<MemoryBuildRepository>,
    defects: Arc<MemoryDefectStore>,
    cleaner: Cleaner,
}

fn fixture(items_to_delete: usize) -> Fixture {
    let issues = Arc::new(MemoryIssueStore::new());
    let builds = Arc::new(MemoryBuildRepository::new());
    let defects = Arc::new(MemoryDefectStore::new());
    let cleaner = Cleaner::new(
        issues.clone(),
        builds.clone(),
        defects.clone(),
        CleanerConfig {
            items_to_delete,
            ..CleanerConfig::default()
        },
    );
    Fixture {
        issues,
        builds,
        defects,
        cleaner,
    }
}

impl Fixture {
    async fn defect(&self, id: DefectId, build: BuildId, resolved: bool) {
        let old = Utc::now() - Duration::days(OLD_DAYS);
        let snapshot = BuildSnapshot::new("apache", build);
        self.builds.put_build(snapshot.clone()).await.unwrap();

        let mut d = Defect::new(id, "apache", old);
        d.add_build(DefectBuild::from_snapshot(&snapshot));
        if resolved {
            d.resolve(Some("alice".into()), old).unwrap();
        }
        self.defects.save(d).await.unwrap();
    }

    async fn old_issue(&self, build: BuildId) {
        self.issues
            .save_issue(Issue::new(
                IssueKey::new("apache", build, "t1"),
                IssueType::NewFailure,
                Utc::now() - Duration::days(OLD_DAYS),
            ))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_open_defect_and_its_issues_survive() {
    let f = fixture(100);
    f.defect(1, 10, false).await;
    f.defect(2, 20, true).await;
    f.old_issue(10).await;
    f.old_issue(20).await;
    f.old_issue(30).await;

    let report = f.cleaner.clean().await.unwrap();

    assert_eq!(report.defects_removed, 1);
    assert_eq!(report.issues_removed, 2);
    assert!(f.defects.load(1).await.unwrap().is_some());
    assert!(f.defects.load(2).await.unwrap().is_none());

    let left: Vec<BuildId> = f
        .issues
        .all_issues()
        .await
        .unwrap()
        .iter()
        .map(|i| i.issue_key.build_id)
        .collect();
    assert_eq!(left, vec![10]);
}

#[tokio::test]
async fn test_broken_defect_is_flagged_and_kept() {
    let f = fixture(100);
    f.defect(1, 10, true).await;
    f.builds.remove_build("apache", 10);

    let report = f.cleaner.clean().await.unwrap();

    assert_eq!(report.broken_flagged, 1);
    assert_eq!(report.defects_removed, 0);
    let kept = f.defects.load(1).await.unwrap().unwrap();
    assert_eq!(kept.consistency, Consistency::Broken);

    // already flagged defects are not counted again
    let report = f.cleaner.clean().await.unwrap();
    assert_eq!(report.broken_flagged, 0);
}

#[tokio::test]
async fn test_broken_defect_recovers_when_build_returns() {
    let f = fixture(100);
    f.defect(1, 10, false).await;
    f.builds.remove_build("apache", 10);
    assert_eq!(f.cleaner.clean().await.unwrap().broken_flagged, 1);

    f.builds
        .put_build(BuildSnapshot::new("apache", 10))
        .await
        .unwrap();
    let report = f.cleaner.clean().await.unwrap();

    assert_eq!(report.broken_restored, 1);
    let defect = f.defects.load(1).await.unwrap().unwrap();
    assert_eq!(defect.consistency, Consistency::Consistent);
    assert!(f.cleaner.broken_defects().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_broken_defect_can_be_discarded() {
    let f = fixture(100);
    f.defect(1, 10, true).await;
    f.defect(2, 20, false).await;
    f.builds.remove_build("apache", 10);
    f.cleaner.clean().await.unwrap();

    let broken: Vec<DefectId> = f
        .cleaner
        .broken_defects()
        .await
        .unwrap()
        .iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(broken, vec![1]);

    let err = f.cleaner.discard_broken(2, "alice").await.unwrap_err();
    assert!(matches!(err, HealthError::DefectNotBroken(2)));
    let err = f.cleaner.discard_broken(9, "alice").await.unwrap_err();
    assert!(matches!(err, HealthError::DefectNotFound(9)));

    f.cleaner.discard_broken(1, "alice").await.unwrap();
    assert!(f.defects.load(1).await.unwrap().is_none());
    assert!(f.defects.load(2).await.unwrap().is_some());
}

#[tokio::test]
async fn test_recent_records_are_kept() {
    let f = fixture(100);
    let mut d = Defect::new(1, "apache", Utc::now());
    d.resolve(None, Utc::now()).unwrap();
    f.defects.save(d).await.unwrap();
    f.issues
        .save_issue(Issue::new(
            IssueKey::new("apache", 5, "t1"),
            IssueType::NewFailure,
            Utc::now(),
        ))
        .await
        .unwrap();

    let report = f.cleaner.clean().await.unwrap();

    assert_eq!(report.defects_removed, 0);
    assert_eq!(report.issues_removed, 0);
}

#[tokio::test]
async fn test_deletion_budget_bounds_each_run() {
    let f = fixture(2);
    for id in 1..=5 {
        f.defect(id, id * 10, true).await;
        f.old_issue(id * 10).await;
    }

    let report = f.cleaner.clean().await.unwrap();
    assert_eq!(report.defects_removed, 2);
    assert_eq!(report.issues_removed, 2);

    let report = f.cleaner.clean().await.unwrap();
    assert_eq!(report.defects_removed, 2);
    assert_eq!(f.defects.load_all().await.unwrap().len(), 1);
}
