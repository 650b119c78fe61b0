//! Notification planning: pick recent issues, match them to subscribers and
//! send one message per address.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use healthbot_state::{BuildId, Issue, IssueRepository, SubscriberStat};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::NotificationsConfig;
use crate::error::Result;
use crate::obs;

/// Outbound delivery channel (mail, chat, ...).
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()>;
}

/// Transport that only writes messages to the log.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        info!(address = %address, subject = %subject, body = %body, "notification");
        Ok(())
    }
}

/// Issues queued for one address, grouped by build.
#[derive(Debug, Clone, Default)]
pub struct Notification {
    pub address: String,
    pub by_build: BTreeMap<BuildId, Vec<Issue>>,
}

impl Notification {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            by_build: BTreeMap::new(),
        }
    }

    pub fn add_issue(&mut self, issue: Issue) {
        self.by_build
            .entry(issue.issue_key.build_id)
            .or_default()
            .push(issue);
    }

    pub fn count_issues(&self) -> usize {
        self.by_build.values().map(Vec::len).sum()
    }

    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        self.by_build.values().flatten()
    }

    pub fn subject(&self) -> String {
        let builds: Vec<String> = self.by_build.keys().map(|b| b.to_string()).collect();
        format!(
            "[healthbot]: {} new failures in builds [{}] need to be handled",
            self.count_issues(),
            builds.join(", ")
        )
    }

    pub fn body(&self) -> String {
        let mut out = String::new();
        for (build_id, issues) in &self.by_build {
            out.push_str(&format!("Build {build_id}\n"));
            for (idx, issue) in issues.iter().enumerate() {
                let last = idx + 1 == issues.len();
                out.push_str(&issue.to_plain_text(last));
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

/// Counters of one notification pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotificationReport {
    pub issues_checked: usize,
    pub messages_sent: usize,
    pub messages_failed: usize,
}

pub struct Notifier {
    issues: Arc<dyn IssueRepository>,
    transport: Arc<dyn NotificationTransport>,
    config: NotificationsConfig,
}

impl Notifier {
    pub fn new(
        issues: Arc<dyn IssueRepository>,
        transport: Arc<dyn NotificationTransport>,
        config: NotificationsConfig,
    ) -> Self {
        Self {
            issues,
            transport,
            config,
        }
    }

    /// Build notifications for recent issues and hand them to the transport.
    pub async fn send_new_notifications(&self) -> Result<NotificationReport> {
        let cutoff = Utc::now() - Duration::minutes(self.config.recent_window_mins);
        let max_retries = self.config.max_retries;
        let mut report = NotificationReport::default();
        let mut pending: BTreeMap<String, Notification> = BTreeMap::new();

        let issues = self.issues.all_issues().await?;
        for issue in issues.into_iter().filter(|i| i.detected_at >= cutoff) {
            report.issues_checked += 1;
            let key = issue.issue_key.clone();
            let mut stat = SubscriberStat::default();

            for subscriber in &self.config.subscribers {
                if !subscriber.follows_server(&key.server_id) {
                    continue;
                }
                stat.server_allowed += 1;
                if !subscriber.follows_branch(issue.tracked_branch.as_deref()) {
                    continue;
                }
                stat.subscribed += 1;
                if !subscriber.follows_tags(&issue.build_tags) {
                    continue;
                }
                stat.tags_filter_passed += 1;

                let is_new = self
                    .issues
                    .get_is_new_and_set_notified(&key, &subscriber.address, None, max_retries)
                    .await?;
                if is_new {
                    debug!(address = %subscriber.address, issue = %key, "queued for notification");
                    pending
                        .entry(subscriber.address.clone())
                        .or_insert_with(|| Notification::new(subscriber.address.clone()))
                        .add_issue(issue.clone());
                }
            }

            self.issues.save_subscribers_stat(&key, stat).await?;
        }

        for (address, notification) in pending {
            let subject = notification.subject();
            match self
                .transport
                .send(&address, &subject, &notification.body())
                .await
            {
                Ok(()) => {
                    report.messages_sent += 1;
                    obs::emit_notification_sent(&address, notification.count_issues());
                }
                Err(e) => {
                    report.messages_failed += 1;
                    obs::emit_notification_failed(&address, &e);
                    let reason = e.to_string();
                    for issue in notification.issues() {
                        self.issues
                            .get_is_new_and_set_notified(
                                &issue.issue_key,
                                &address,
                                Some(&reason),
                                max_retries,
                            )
                            .await?;
                    }
                }
            }
        }

        Ok(report)
    }
}
