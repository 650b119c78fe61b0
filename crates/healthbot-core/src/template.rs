//! Event templates and the built-in template registry.
//!
//! A template describes a health transition as two outcome sequences: the
//! `before_event` part that must immediately precede the transition and the
//! `event_and_after` part that starts at it. Both are oldest first.

use std::sync::OnceLock;

use healthbot_state::{IssueType, RunStatus};
use serde::Serialize;

use crate::error::{HealthError, Result};

/// Immutable outcome pattern matched against a run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventTemplate {
    before_event: Vec<RunStatus>,
    event_and_after: Vec<RunStatus>,
    include_missing: bool,
    should_be_first_non_missing: bool,
}

impl EventTemplate {
    /// Validate and build a template.
    ///
    /// `event_and_after` must be non-empty, and `Missing` may only appear in
    /// a template that also sets `include_missing`.
    pub fn new(
        before_event: Vec<RunStatus>,
        event_and_after: Vec<RunStatus>,
        include_missing: bool,
        should_be_first_non_missing: bool,
    ) -> Result<Self> {
        if event_and_after.is_empty() {
            return Err(HealthError::InvalidTemplate(
                "event_and_after must contain the transition".into(),
            ));
        }
        let uses_missing = before_event
            .iter()
            .chain(event_and_after.iter())
            .any(|s| *s == RunStatus::Missing);
        if uses_missing && !include_missing {
            return Err(HealthError::InvalidTemplate(
                "MISSING in a template requires include_missing".into(),
            ));
        }
        Ok(Self {
            before_event,
            event_and_after,
            include_missing,
            should_be_first_non_missing,
        })
    }

    fn fixed(before: &[RunStatus], after: &[RunStatus]) -> Self {
        Self {
            before_event: before.to_vec(),
            event_and_after: after.to_vec(),
            include_missing: false,
            should_be_first_non_missing: false,
        }
    }

    pub fn before_event(&self) -> &[RunStatus] {
        &self.before_event
    }

    pub fn event_and_after(&self) -> &[RunStatus] {
        &self.event_and_after
    }

    pub fn include_missing(&self) -> bool {
        self.include_missing
    }

    pub fn should_be_first_non_missing(&self) -> bool {
        self.should_be_first_non_missing
    }

    pub fn total_events(&self) -> usize {
        self.before_event.len() + self.event_and_after.len()
    }

    /// Index of the transition inside a window of `total_events()` entries.
    pub fn transition_offset(&self) -> usize {
        self.before_event.len()
    }

    /// Full pattern, oldest first.
    pub fn pattern(&self) -> impl Iterator<Item = RunStatus> + '_ {
        self.before_event
            .iter()
            .chain(self.event_and_after.iter())
            .copied()
    }
}

/// Names of the built-in templates, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TemplateKind {
    NewFailure,
    NewCriticalFailure,
    NewContributedTestFailure,
    NewFailureForFlakyTest,
    AlwaysFailure,
}

impl TemplateKind {
    pub const ORDER: [TemplateKind; 5] = [
        TemplateKind::NewFailure,
        TemplateKind::NewCriticalFailure,
        TemplateKind::NewContributedTestFailure,
        TemplateKind::NewFailureForFlakyTest,
        TemplateKind::AlwaysFailure,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TemplateKind::NewFailure => "newFailure",
            TemplateKind::NewCriticalFailure => "newCriticalFailure",
            TemplateKind::NewContributedTestFailure => "newContributedTestFailure",
            TemplateKind::NewFailureForFlakyTest => "newFailureForFlakyTest",
            TemplateKind::AlwaysFailure => "alwaysFailure",
        }
    }

    /// Issue type reported when this template matches.
    pub fn issue_type(&self) -> IssueType {
        match self {
            TemplateKind::NewFailure => IssueType::NewFailure,
            TemplateKind::NewCriticalFailure => IssueType::NewCriticalFailure,
            TemplateKind::NewContributedTestFailure => IssueType::NewContributedTestFailure,
            TemplateKind::NewFailureForFlakyTest => IssueType::NewFailureForFlakyTest,
            TemplateKind::AlwaysFailure => IssueType::AlwaysFailure,
        }
    }

    pub fn template(&self) -> &'static EventTemplate {
        let index = Self::ORDER
            .iter()
            .position(|k| k == self)
            .unwrap_or_default();
        &registry()[index].1
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The built-in templates, evaluated in this order each detection cycle.
pub fn registry() -> &'static [(TemplateKind, EventTemplate)] {
    static REGISTRY: OnceLock<Vec<(TemplateKind, EventTemplate)>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        use RunStatus::{CriticalFailure as CRIT, Failure as FAIL, Missing as MISS, Ok as OK};

        let new_contributed = EventTemplate {
            include_missing: true,
            should_be_first_non_missing: true,
            ..EventTemplate::fixed(&[MISS; 4], &[FAIL; 4])
        };

        vec![
            (TemplateKind::NewFailure, EventTemplate::fixed(&[OK; 5], &[FAIL; 4])),
            (
                TemplateKind::NewCriticalFailure,
                EventTemplate::fixed(&[RunStatus::OkOrFailure], &[CRIT; 3]),
            ),
            (TemplateKind::NewContributedTestFailure, new_contributed),
            (
                TemplateKind::NewFailureForFlakyTest,
                EventTemplate::fixed(&[OK; 5], &[FAIL; 8]),
            ),
            (TemplateKind::AlwaysFailure, EventTemplate::fixed(&[FAIL; 6], &[FAIL; 6])),
        ]
    })
}
