//! Healthbot Core Library
//!
//! Decision core of the CI health bot: recognises failure patterns in run
//! histories, clusters the resulting issues into defects that share a source
//! change, and drives the background work through a debounced scheduler.

pub mod cleaner;
pub mod clustering;
pub mod config;
pub mod detector;
pub mod error;
pub mod matcher;
pub mod notify;
pub mod obs;
pub mod scheduler;
pub mod service;
pub mod telemetry;
pub mod template;

pub use cleaner::{CleanReport, Cleaner};
pub use clustering::{ClusteringReport, DefectClusterer};
pub use config::{
    CleanerConfig, ClusteringConfig, DetectionConfig, HealthbotConfig, NotificationsConfig,
    SchedulerConfig, Subscriber, TrackedBranch,
};
pub use detector::IssueDetector;
pub use error::{HealthError, Result};
pub use matcher::{detect, detect_all};
pub use notify::{LogTransport, Notification, NotificationReport, NotificationTransport, Notifier};
pub use scheduler::{Scheduler, TaskStatus};
pub use service::{HealthService, Stores};
pub use template::{registry, EventTemplate, TemplateKind};

pub use healthbot_state::{
    BuildSnapshot, Defect, DefectId, Issue, IssueKey, IssueType, RunHistory, RunStatus,
};
