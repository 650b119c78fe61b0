//! Run-history template matcher.
//!
//! Pure functions; safe for unsynchronized concurrent use.

use healthbot_state::{BuildId, Invocation, RunHistory, RunStatus};

use crate::template::{registry, EventTemplate, TemplateKind};

/// Find the most recent transition in `history` that satisfies `template`.
///
/// Windows of `template.total_events()` consecutive entries are tried from
/// the newest position toward the oldest. The first window that matches
/// wins and the build id at its transition point is returned.
pub fn detect(history: &RunHistory, template: &EventTemplate) -> Option<BuildId> {
    let entries = history.entries();
    let total = template.total_events();
    if total == 0 || entries.len() < total {
        return None;
    }

    let pattern: Vec<RunStatus> = template.pattern().collect();
    let include_missing = template.include_missing();

    let detected = (0..=entries.len() - total).rev().find_map(|start| {
        let window = &entries[start..start + total];
        window_matches(window, &pattern, include_missing)
            .then(|| window[template.transition_offset()].build_id)
    })?;

    if template.should_be_first_non_missing() {
        let first = history.first_non_missing()?;
        if first.build_id != detected {
            return None;
        }
    }

    Some(detected)
}

/// Evaluate every built-in template, in registry order.
pub fn detect_all(history: &RunHistory) -> Vec<(TemplateKind, BuildId)> {
    registry()
        .iter()
        .filter_map(|(kind, template)| detect(history, template).map(|build| (*kind, build)))
        .collect()
}

fn window_matches(window: &[Invocation], pattern: &[RunStatus], include_missing: bool) -> bool {
    window
        .iter()
        .zip(pattern)
        .all(|(inv, expected)| status_matches(*expected, inv.status, include_missing))
}

/// `OkOrFailure` matches `Ok` or `Failure` only. `Missing` never matches
/// unless the template includes it, and then only literally.
pub fn status_matches(expected: RunStatus, actual: RunStatus, include_missing: bool) -> bool {
    if actual == RunStatus::Missing && !include_missing {
        return false;
    }
    match expected {
        RunStatus::OkOrFailure => matches!(actual, RunStatus::Ok | RunStatus::Failure),
        other => other == actual,
    }
}
