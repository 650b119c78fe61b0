use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use healthbot_core::{HealthError, NotificationTransport, NotificationsConfig, Notifier, Subscriber};
use healthbot_state::fakes::MemoryIssueStore;
use healthbot_state::{BuildId, Issue, IssueKey, IssueRepository, IssueType};

#[derive(Default)]
struct RecordingTransport {
    fail: bool,
    sent: Mutex<Vec<(String, String, String)>>,
}

impl RecordingTransport {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn attempts(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn send(&self, address: &str, subject: &str, body: &str) -> healthbot_core::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((address.to_string(), subject.to_string(), body.to_string()));
        if self.fail {
            return Err(HealthError::Notification {
                address: address.to_string(),
                reason: "smtp down".to_string(),
            });
        }
        Ok(())
    }
}

fn subscriber(address: &str, servers: &[&str], branches: &[&str]) -> Subscriber {
    Subscriber {
        address: address.to_string(),
        servers: servers.iter().map(|s| s.to_string()).collect(),
        branches: branches.iter().map(|s| s.to_string()).collect(),
        tags: Vec::new(),
    }
}

fn notifier(
    issues: &Arc<MemoryIssueStore>,
    transport: &Arc<RecordingTransport>,
    subscribers: Vec<Subscriber>,
) -> Notifier {
    Notifier::new(
        issues.clone(),
        transport.clone(),
        NotificationsConfig {
            subscribers,
            ..NotificationsConfig::default()
        },
    )
}

async fn save(issues: &MemoryIssueStore, server: &str, build: BuildId, test: &str) {
    let mut issue = Issue::new(
        IssueKey::new(server, build, test),
        IssueType::NewFailure,
        Utc::now(),
    );
    issue.tracked_branch = Some("master".into());
    issues.save_issue(issue).await.unwrap();
}

#[tokio::test]
async fn test_one_message_per_address() {
    let issues = Arc::new(MemoryIssueStore::new());
    let transport = Arc::new(RecordingTransport::default());
    save(&issues, "apache", 10, "t1").await;
    save(&issues, "apache", 10, "t2").await;
    save(&issues, "apache", 11, "t3").await;

    let n = notifier(
        &issues,
        &transport,
        vec![subscriber("a@dev", &[], &[]), subscriber("b@dev", &[], &[])],
    );
    let report = n.send_new_notifications().await.unwrap();

    assert_eq!(report.issues_checked, 3);
    assert_eq!(report.messages_sent, 2);
    let sent = transport.attempts();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, "a@dev");
    assert_eq!(
        sent[0].1,
        "[healthbot]: 3 new failures in builds [10, 11] need to be handled"
    );
    assert!(sent[0].2.contains("Build 10\n"));
    assert!(sent[0].2.contains("Build 11\n"));

    // nothing new on the next pass
    let report = n.send_new_notifications().await.unwrap();
    assert_eq!(report.messages_sent, 0);
    assert_eq!(transport.attempts().len(), 2);
}

#[tokio::test]
async fn test_server_and_branch_filters() {
    let issues = Arc::new(MemoryIssueStore::new());
    let transport = Arc::new(RecordingTransport::default());
    save(&issues, "apache", 10, "t1").await;
    save(&issues, "private", 20, "t1").await;

    let n = notifier(
        &issues,
        &transport,
        vec![
            subscriber("apache@dev", &["apache"], &[]),
            subscriber("release@dev", &[], &["release"]),
        ],
    );
    n.send_new_notifications().await.unwrap();

    let sent = transport.attempts();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "apache@dev");
    assert!(sent[0].1.starts_with("[healthbot]: 1 new failures"));

    let apache = issues
        .get_issue(&IssueKey::new("apache", 10, "t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(apache.subscriber_stat.server_allowed, 2);
    assert_eq!(apache.subscriber_stat.subscribed, 1);
    assert!(apache.addresses_notified.contains("apache@dev"));

    let private = issues
        .get_issue(&IssueKey::new("private", 20, "t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(private.subscriber_stat.server_allowed, 1);
    assert_eq!(private.subscriber_stat.subscribed, 0);
    assert!(private.addresses_notified.is_empty());
}

#[tokio::test]
async fn test_failed_delivery_is_retried_up_to_cap() {
    let issues = Arc::new(MemoryIssueStore::new());
    let transport = Arc::new(RecordingTransport::failing());
    save(&issues, "apache", 10, "t1").await;

    let n = notifier(&issues, &transport, vec![subscriber("a@dev", &[], &[])]);
    for _ in 0..4 {
        n.send_new_notifications().await.unwrap();
    }

    // default cap is two retries
    assert_eq!(transport.attempts().len(), 2);
    let issue = issues
        .get_issue(&IssueKey::new("apache", 10, "t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(issue.notification_retry, 2);
    assert!(issue.notification_failed.contains_key("a@dev"));
    assert!(!issue.addresses_notified.contains("a@dev"));
}

#[tokio::test]
async fn test_old_issues_are_not_notified() {
    let issues = Arc::new(MemoryIssueStore::new());
    let transport = Arc::new(RecordingTransport::default());
    issues
        .save_issue(Issue::new(
            IssueKey::new("apache", 10, "t1"),
            IssueType::NewFailure,
            Utc::now() - Duration::days(1),
        ))
        .await
        .unwrap();

    let n = notifier(&issues, &transport, vec![subscriber("a@dev", &[], &[])]);
    let report = n.send_new_notifications().await.unwrap();

    assert_eq!(report.issues_checked, 0);
    assert!(transport.attempts().is_empty());
}

#[tokio::test]
async fn test_tag_filter_uses_build_tags() {
    let issues = Arc::new(MemoryIssueStore::new());
    let transport = Arc::new(RecordingTransport::default());
    let mut tagged = Issue::new(
        IssueKey::new("apache", 10, "t1"),
        IssueType::NewFailure,
        Utc::now(),
    );
    tagged.build_tags.insert("nightly".into());
    issues.save_issue(tagged).await.unwrap();

    let mut release = subscriber("release@dev", &[], &[]);
    release.tags = vec!["release".into()];
    let mut nightly = subscriber("nightly@dev", &[], &[]);
    nightly.tags = vec!["nightly".into()];

    let n = notifier(&issues, &transport, vec![release, nightly]);
    n.send_new_notifications().await.unwrap();

    let sent = transport.attempts();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "nightly@dev");

    let stored = issues
        .get_issue(&IssueKey::new("apache", 10, "t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.subscriber_stat.subscribed, 2);
    assert_eq!(stored.subscriber_stat.tags_filter_passed, 1);
}
