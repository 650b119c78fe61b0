//! Structured lifecycle events for detection, clustering, GC and tasks.
//!
//! Events are emitted at `info!` (failures at `warn!`/`error!`) with an
//! `event` field naming them, so they can be filtered in JSON output.

use healthbot_state::{BuildId, DefectId, IssueKey, IssueType};
use tracing::info;

/// Span wrapping one execution of a named task. Attach with
/// `tracing::Instrument::instrument`.
pub fn task_span(task: &str, runner: &str) -> tracing::Span {
    tracing::info_span!("healthbot.task", task = %task, runner = %runner)
}

pub fn emit_issue_registered(key: &IssueKey, issue_type: IssueType) {
    info!(
        event = "issue.registered",
        server = %key.server_id,
        build_id = key.build_id,
        name = %key.test_or_suite_name,
        issue_type = issue_type.code(),
    );
}

pub fn emit_defect_created(defect_id: DefectId, server: &str, build_id: BuildId) {
    info!(event = "defect.created", defect_id = defect_id, server = %server, build_id = build_id);
}

pub fn emit_defect_updated(defect_id: DefectId, build_id: BuildId) {
    info!(event = "defect.updated", defect_id = defect_id, build_id = build_id);
}

/// Several open defects collapsed into `target`.
pub fn emit_defect_merged(target: DefectId, superseded: &[DefectId]) {
    info!(event = "defect.merged", defect_id = target, superseded = ?superseded);
}

pub fn emit_gc_finished(
    broken_flagged: usize,
    broken_restored: usize,
    defects_removed: usize,
    issues_removed: usize,
) {
    info!(
        event = "gc.finished",
        broken_flagged = broken_flagged,
        broken_restored = broken_restored,
        defects_removed = defects_removed,
        issues_removed = issues_removed,
    );
}

pub fn emit_notification_sent(address: &str, issues: usize) {
    info!(event = "notification.sent", address = %address, issues = issues);
}

pub fn emit_notification_failed(address: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "notification.failed", address = %address, error = %error);
}

pub fn emit_task_failed(task: &str, error: &dyn std::fmt::Display) {
    tracing::error!(event = "task.failed", task = %task, error = %error);
}

pub fn emit_task_finished(task: &str, duration_ms: u64) {
    tracing::debug!(event = "task.finished", task = %task, duration_ms = duration_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitters_do_not_panic_without_subscriber() {
        let _entered = task_span("issuesToDefects", "poller-0").entered();
        emit_issue_registered(&IssueKey::new("apache", 1, "t"), IssueType::NewFailure);
        emit_defect_created(1, "apache", 1);
        emit_defect_merged(1, &[2, 3]);
        emit_gc_finished(0, 0, 1, 2);
        emit_task_failed("cleaner", &"boom");
    }
}
