use chrono::{DateTime, Utc};

use crate::domain::approval::{Approval, ApprovalStatus};
use crate::domain::settings::ApprovalSettings;

/// Whole hours elapsed since the approval was created; never negative.
pub fn age_in_hours(approval: &Approval, now: DateTime<Utc>) -> i64 {
    now.signed_duration_since(approval.created_at).num_hours().max(0)
}

/// True only when the approval is still pending, not yet flagged, escalation is enabled
/// for the company, and its age is strictly past the timeout. Never mutates anything.
pub fn should_escalate(
    approval: &Approval,
    settings: &ApprovalSettings,
    now: DateTime<Utc>,
) -> bool {
    if approval.status != ApprovalStatus::Pending || approval.escalated || approval.is_deleted() {
        return false;
    }
    if !settings.escalation_enabled {
        return false;
    }

    age_in_hours(approval, now) > i64::from(settings.escalation_timeout_hours)
}
