//! Approval status machine.
//!
//! Individual approvals move `Pending -> Approved | Rejected` and stay there. The aggregate
//! gate of a cart is derived from its non-deleted approvals: any rejection vetoes the cart,
//! otherwise it is approved only once nothing is pending.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::ActorContext;
use crate::domain::approval::{Approval, ApprovalStatus, ApprovalType};
use crate::errors::DomainError;

/// Counts over the live approvals of one cart, read in a single query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartApprovalSummary {
    pub pending: u32,
    pub approved: u32,
    pub rejected: u32,
}

impl CartApprovalSummary {
    pub fn has_pending(&self) -> bool {
        self.pending > 0
    }

    pub fn record(&mut self, status: ApprovalStatus) {
        match status {
            ApprovalStatus::Pending => self.pending += 1,
            ApprovalStatus::Approved => self.approved += 1,
            ApprovalStatus::Rejected => self.rejected += 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionOutcome {
    pub approval: Approval,
    pub previous_status: ApprovalStatus,
    /// False when the actor had already approved; nothing needs persisting.
    pub changed: bool,
}

/// Only `Approved` and `Rejected` may be requested by an approver.
pub fn validate_target(target: ApprovalStatus) -> Result<ApprovalStatus, DomainError> {
    match target {
        ApprovalStatus::Approved | ApprovalStatus::Rejected => Ok(target),
        ApprovalStatus::Pending => {
            Err(DomainError::InvalidTargetStatus { requested: target.as_str().to_string() })
        }
    }
}

/// Applies an approver's decision to one approval without touching storage.
pub fn apply_action(
    approval: &Approval,
    target: ApprovalStatus,
    actor: &ActorContext,
    now: DateTime<Utc>,
) -> Result<ActionOutcome, DomainError> {
    let target = validate_target(target)?;
    let previous_status = approval.status;

    // Decided approvals are final.
    if previous_status.is_terminal() {
        return Err(DomainError::InvalidTransition { from: previous_status, to: target });
    }

    if ApprovalType::parse(&actor.role) != Some(approval.approval_type) {
        return Err(DomainError::RoleMismatch {
            actor_role: actor.role.clone(),
            required: approval.approval_type,
        });
    }

    let mut next = approval.clone();
    if target == ApprovalStatus::Rejected {
        next.status = ApprovalStatus::Rejected;
        next.resolved_at = Some(now);
    } else {
        if next.approver_ids.iter().any(|id| id == &actor.id) {
            return Ok(ActionOutcome { approval: next, previous_status, changed: false });
        }
        next.approver_ids.push(actor.id.clone());
        if next.remaining_approvals() == 0 {
            next.status = ApprovalStatus::Approved;
            next.resolved_at = Some(now);
        }
    }
    next.updated_at = now;
    next.version = approval.version.saturating_add(1);

    Ok(ActionOutcome { approval: next, previous_status, changed: true })
}

/// Next aggregate status, or `None` when the stored one is already right.
///
/// A rejection is applied unconditionally, even if `summary` was read before it landed.
pub fn recompute_aggregate(
    current: Option<ApprovalStatus>,
    incoming: ApprovalStatus,
    summary: &CartApprovalSummary,
) -> Option<ApprovalStatus> {
    let derived = if incoming == ApprovalStatus::Rejected || summary.rejected > 0 {
        ApprovalStatus::Rejected
    } else if summary.has_pending() {
        ApprovalStatus::Pending
    } else {
        ApprovalStatus::Approved
    };

    if current == Some(ApprovalStatus::Rejected) || current == Some(derived) {
        return None;
    }
    Some(derived)
}
