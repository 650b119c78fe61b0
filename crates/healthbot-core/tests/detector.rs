//! Detection sweeps over in-memory histories.

use std::sync::Arc;

use healthbot_core::{DetectionConfig, IssueDetector};
use healthbot_state::fakes::{MemoryBuildRepository, MemoryIssueStore, MemoryRunHistorySource};
use healthbot_state::RunStatus::{self, Failure as F, Ok as O};
use healthbot_state::{
    BuildId, BuildRepository, BuildSnapshot, Change, CommitHash, HistoryIdentity, IssueKey,
    IssueRepository, IssueType, RunHistory,
};

fn history(statuses: &[RunStatus]) -> RunHistory {
    RunHistory::from_entries(
        statuses
            .iter()
            .enumerate()
            .map(|(i, s)| (100 + i as BuildId, *s)),
    )
    .unwrap()
}

struct Fixture {
    histories: Arc<MemoryRunHistorySource>,
    builds: Arc<MemoryBuildRepository>,
    issues: Arc<MemoryIssueStore>,
    detector: IssueDetector,
}

fn fixture() -> Fixture {
    let histories = Arc::new(MemoryRunHistorySource::new());
    let builds = Arc::new(MemoryBuildRepository::new());
    let issues = Arc::new(MemoryIssueStore::new());
    let detector = IssueDetector::new(
        histories.clone(),
        builds.clone(),
        issues.clone(),
        DetectionConfig::default(),
    );
    Fixture {
        histories,
        builds,
        issues,
        detector,
    }
}

#[tokio::test]
async fn test_branch_sweep_registers_issue_with_changes() {
    let f = fixture();
    let new_failure = [O, O, O, O, O, F, F, F, F];
    f.histories.insert_history(
        "apache",
        "master",
        HistoryIdentity::test("Cache 1", "testPut"),
        history(&new_failure),
    );
    f.histories.insert_history(
        "apache",
        "master",
        HistoryIdentity::test("Cache 1", "testGet"),
        history(&[O; 9]),
    );

    let mut build = BuildSnapshot::new("apache", 105);
    build.changes.push(Change {
        id: 1,
        commit: CommitHash::new(vec![1; 20]),
        author: "alice".into(),
        web_url: Some("https://ci/change/1".into()),
    });
    f.builds.put_build(build).await.unwrap();

    assert_eq!(f.detector.check_branch("apache", "master").await.unwrap(), 1);

    let issue = f
        .issues
        .get_issue(&IssueKey::new("apache", 105, "testPut"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(issue.issue_type, IssueType::NewFailure);
    assert_eq!(issue.tracked_branch.as_deref(), Some("master"));
    assert_eq!(issue.changes.len(), 1);
    assert_eq!(issue.changes[0].author, "alice");

    // second sweep finds nothing new
    assert_eq!(f.detector.check_branch("apache", "master").await.unwrap(), 0);
    assert_eq!(f.issues.all_issues().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_existing_issue_is_left_untouched() {
    let f = fixture();
    let identity = HistoryIdentity::test("Cache 1", "testPut");
    let h = history(&[O, O, O, O, O, F, F, F, F]);

    let first = f
        .detector
        .check_identity("apache", "master", &identity, &h)
        .await
        .unwrap();
    assert_eq!(first, vec![IssueKey::new("apache", 105, "testPut")]);

    let again = f
        .detector
        .check_identity("apache", "release", &identity, &h)
        .await
        .unwrap();
    assert!(again.is_empty());

    let stored = f.issues.get_issue(&first[0]).await.unwrap().unwrap();
    assert_eq!(stored.tracked_branch.as_deref(), Some("master"));
    assert!(stored.changes.is_empty());
}

#[tokio::test]
async fn test_unknown_branch_yields_nothing() {
    let f = fixture();
    assert_eq!(f.detector.check_branch("apache", "nope").await.unwrap(), 0);
}
