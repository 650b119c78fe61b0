//! Template matching against recorded run histories.

use healthbot_core::{detect, detect_all, EventTemplate, TemplateKind};
use healthbot_state::{BuildId, RunHistory, RunStatus};

use RunStatus::{CriticalFailure as C, Failure as F, Missing as M, Ok as O};

fn history(statuses: &[RunStatus]) -> RunHistory {
    RunHistory::from_entries(
        statuses
            .iter()
            .enumerate()
            .map(|(i, s)| (100 + i as BuildId, *s)),
    )
    .unwrap()
}

#[test]
fn test_short_history_never_matches() {
    let h = history(&[O, O, O, O, F, F, F, F]);
    for (kind, _) in healthbot_core::registry() {
        assert_eq!(detect(&h, kind.template()), None, "{kind}");
    }
    assert!(detect_all(&RunHistory::new()).is_empty());
}

#[test]
fn test_new_failure_returns_first_failure() {
    let h = history(&[O, O, O, O, O, F, F, F, F]);
    assert_eq!(detect(&h, TemplateKind::NewFailure.template()), Some(105));
}

#[test]
fn test_new_failure_with_longer_prefix() {
    let h = history(&[F, F, O, O, O, O, O, O, F, F, F, F]);
    assert_eq!(detect(&h, TemplateKind::NewFailure.template()), Some(108));
}

#[test]
fn test_most_recent_transition_wins() {
    let h = history(&[
        O, O, O, O, O, F, F, F, F, // first transition at 105
        O, O, O, O, O, F, F, F, F, // second transition at 114
    ]);
    assert_eq!(detect(&h, TemplateKind::NewFailure.template()), Some(114));
}

#[test]
fn test_missing_inside_window_fails_match() {
    let h = history(&[O, O, O, M, O, O, F, F, F, F]);
    // window [O,O,M,O,O,F,F,F,F] contains MISSING, the older one is too short
    assert_eq!(detect(&h, TemplateKind::NewFailure.template()), None);
}

#[test]
fn test_missing_outside_window_is_ignored() {
    let h = history(&[M, M, O, O, O, O, O, F, F, F, F]);
    assert_eq!(detect(&h, TemplateKind::NewFailure.template()), Some(107));
}

#[test]
fn test_critical_failure_after_ok_or_failure() {
    let t = TemplateKind::NewCriticalFailure.template();
    assert_eq!(detect(&history(&[O, C, C, C]), t), Some(101));
    assert_eq!(detect(&history(&[F, C, C, C]), t), Some(101));
    assert_eq!(detect(&history(&[C, C, C, C]), t), None);
    assert_eq!(detect(&history(&[M, C, C, C]), t), None);
}

#[test]
fn test_wildcard_template_rejects_critical_and_missing() {
    let t = EventTemplate::new(vec![RunStatus::OkOrFailure], vec![F], false, false).unwrap();
    assert_eq!(detect(&history(&[O, F]), &t), Some(101));
    assert_eq!(detect(&history(&[F, F]), &t), Some(101));
    assert_eq!(detect(&history(&[C, F]), &t), None);
    assert_eq!(detect(&history(&[M, F]), &t), None);
}

#[test]
fn test_contributed_test_failure_fires_at_first_run() {
    let t = TemplateKind::NewContributedTestFailure.template();
    let h = history(&[M, M, M, M, F, F, F, F]);
    assert_eq!(detect(&h, t), Some(104));
}

#[test]
fn test_contributed_test_failure_requires_first_non_missing() {
    let t = TemplateKind::NewContributedTestFailure.template();
    // raw pattern matches at 106, but the test already ran at 101
    let h = history(&[M, O, M, M, M, M, F, F, F, F]);
    assert_eq!(detect(&h, t), None);
}

#[test]
fn test_always_failure() {
    let t = TemplateKind::AlwaysFailure.template();
    assert_eq!(detect(&history(&[F; 12]), t), Some(106));
    assert_eq!(detect(&history(&[F; 11]), t), None);
}

#[test]
fn test_detect_all_reports_every_template() {
    let mut statuses = vec![O; 5];
    statuses.extend([F; 8]);
    let found = detect_all(&history(&statuses));
    assert_eq!(
        found,
        vec![
            (TemplateKind::NewFailure, 105),
            (TemplateKind::NewFailureForFlakyTest, 105),
        ]
    );
}
