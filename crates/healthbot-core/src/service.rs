//! Service wiring: repositories, decision components and the scheduler.

use std::sync::Arc;
use std::time::Duration;

use healthbot_state::fakes::{
    MemoryBuildRepository, MemoryDefectStore, MemoryIssueStore, MemoryRunHistorySource,
};
use healthbot_state::{BuildRepository, DefectRepository, IssueRepository, RunHistorySource};
use tracing::info;

use crate::cleaner::Cleaner;
use crate::clustering::DefectClusterer;
use crate::config::HealthbotConfig;
use crate::detector::IssueDetector;
use crate::notify::{NotificationTransport, Notifier};
use crate::scheduler::Scheduler;

pub const ISSUES_TO_DEFECTS: &str = "issuesToDefects";
pub const SEND_NOTIFICATIONS: &str = "sendNotifications";
pub const CLEANER: &str = "cleaner";

/// Task name of the detection sweep for one tracked branch.
pub fn detect_task_name(server: &str, branch: &str) -> String {
    format!("detect:{server}:{branch}")
}

/// Repository handles shared by all components.
#[derive(Clone)]
pub struct Stores {
    pub histories: Arc<dyn RunHistorySource>,
    pub builds: Arc<dyn BuildRepository>,
    pub defects: Arc<dyn DefectRepository>,
    pub issues: Arc<dyn IssueRepository>,
}

impl Stores {
    /// Process-local stores.
    pub fn in_memory() -> Self {
        Self {
            histories: Arc::new(MemoryRunHistorySource::new()),
            builds: Arc::new(MemoryBuildRepository::new()),
            defects: Arc::new(MemoryDefectStore::new()),
            issues: Arc::new(MemoryIssueStore::new()),
        }
    }
}

pub struct HealthService {
    config: HealthbotConfig,
    stores: Stores,
    scheduler: Scheduler,
    detector: Arc<IssueDetector>,
    clusterer: Arc<DefectClusterer>,
    cleaner: Arc<Cleaner>,
    notifier: Arc<Notifier>,
}

impl HealthService {
    pub fn new(
        config: HealthbotConfig,
        stores: Stores,
        transport: Arc<dyn NotificationTransport>,
    ) -> Self {
        let detector = Arc::new(IssueDetector::new(
            Arc::clone(&stores.histories),
            Arc::clone(&stores.builds),
            Arc::clone(&stores.issues),
            config.detection.clone(),
        ));
        let clusterer = Arc::new(DefectClusterer::new(
            Arc::clone(&stores.issues),
            Arc::clone(&stores.builds),
            Arc::clone(&stores.defects),
            config.clustering.clone(),
        ));
        let cleaner = Arc::new(Cleaner::new(
            Arc::clone(&stores.issues),
            Arc::clone(&stores.builds),
            Arc::clone(&stores.defects),
            config.cleaner.clone(),
        ));
        let notifier = Arc::new(Notifier::new(
            Arc::clone(&stores.issues),
            transport,
            config.notifications.clone(),
        ));
        let scheduler = Scheduler::new(config.scheduler.clone());

        Self {
            config,
            stores,
            scheduler,
            detector,
            clusterer,
            cleaner,
            notifier,
        }
    }

    pub fn config(&self) -> &HealthbotConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn detector(&self) -> &IssueDetector {
        &self.detector
    }

    pub fn clusterer(&self) -> &DefectClusterer {
        &self.clusterer
    }

    pub fn cleaner(&self) -> &Cleaner {
        &self.cleaner
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Request one detection sweep for a tracked branch.
    pub fn schedule_detection(&self, server: &str, branch: &str) {
        let detector = Arc::clone(&self.detector);
        let (srv, br) = (server.to_string(), branch.to_string());
        self.scheduler.schedule_named(
            &detect_task_name(server, branch),
            move || async move {
                let found = detector.check_branch(&srv, &br).await?;
                info!(server = %srv, branch = %br, new_issues = found, "detection finished");
                Ok(())
            },
            Duration::from_secs(self.config.detection.detect_quiet_secs),
        );
    }

    pub fn schedule_clustering(&self) {
        let clusterer = Arc::clone(&self.clusterer);
        self.scheduler.schedule_named(
            ISSUES_TO_DEFECTS,
            move || async move {
                let report = clusterer.cluster_new_issues().await?;
                info!(%report, "issues converted to defects");
                Ok(())
            },
            Duration::from_secs(self.config.clustering.quiet_period_secs),
        );
    }

    pub fn schedule_notifications(&self) {
        let notifier = Arc::clone(&self.notifier);
        self.scheduler.schedule_named(
            SEND_NOTIFICATIONS,
            move || async move {
                let report = notifier.send_new_notifications().await?;
                info!(
                    issues_checked = report.issues_checked,
                    sent = report.messages_sent,
                    failed = report.messages_failed,
                    "notifications processed"
                );
                Ok(())
            },
            Duration::from_secs(self.config.notifications.quiet_period_secs),
        );
    }

    pub fn schedule_cleaner(&self) {
        let cleaner = Arc::clone(&self.cleaner);
        self.scheduler.schedule_named(
            CLEANER,
            move || async move {
                cleaner.clean().await?;
                Ok(())
            },
            Duration::from_secs(self.config.cleaner.quiet_period_secs),
        );
    }

    /// Request every periodic task. Safe to call repeatedly; requests for
    /// the same name coalesce.
    pub fn schedule_periodic(&self) {
        for tracked in &self.config.detection.tracked {
            self.schedule_detection(&tracked.server, &tracked.branch);
        }
        self.schedule_clustering();
        self.schedule_notifications();
        if self.config.cleaner.enabled {
            self.schedule_cleaner();
        }
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SchedulerConfig, TrackedBranch};
    use crate::notify::LogTransport;

    #[tokio::test]
    async fn test_schedule_periodic_registers_names() {
        let mut config = HealthbotConfig {
            scheduler: SchedulerConfig {
                pollers: 0,
                ..SchedulerConfig::default()
            },
            ..HealthbotConfig::default()
        };
        config.detection.tracked.push(TrackedBranch {
            server: "apache".into(),
            branch: "master".into(),
        });

        let service = HealthService::new(config, Stores::in_memory(), Arc::new(LogTransport));
        service.schedule_periodic();

        assert_eq!(
            service.scheduler().task_names(),
            vec![
                CLEANER.to_string(),
                "detect:apache:master".to_string(),
                ISSUES_TO_DEFECTS.to_string(),
                SEND_NOTIFICATIONS.to_string(),
            ]
        );
        assert_eq!(service.scheduler().check_named_tasks("test").await, 4);
    }
}
