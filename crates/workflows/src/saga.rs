use serde::{Deserialize, Serialize};

use tollgate_core::domain::approval::{ApprovalAggregate, ApprovalId, CartId};
use tollgate_core::domain::rule::{ApprovalRule, ApprovalRuleId};
use tollgate_core::domain::settings::{ApprovalSettings, CompanyId};

/// Undo instruction returned by a mutating step. `previous: None` means the step created the
/// row, so compensating removes it again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Compensation {
    SoftDeleteApproval { approval_id: ApprovalId },
    RestoreAggregate { cart_id: CartId, previous: Option<ApprovalAggregate> },
    RestoreSettings { company_id: CompanyId, previous: Option<ApprovalSettings> },
    RestoreRule { rule_id: ApprovalRuleId, previous: Option<ApprovalRule> },
}

impl Compensation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SoftDeleteApproval { .. } => "soft_delete_approval",
            Self::RestoreAggregate { .. } => "restore_aggregate",
            Self::RestoreSettings { .. } => "restore_settings",
            Self::RestoreRule { .. } => "restore_rule",
        }
    }

    pub fn subject_id(&self) -> &str {
        match self {
            Self::SoftDeleteApproval { approval_id } => &approval_id.0,
            Self::RestoreAggregate { cart_id, .. } => &cart_id.0,
            Self::RestoreSettings { company_id, .. } => &company_id.0,
            Self::RestoreRule { rule_id, .. } => &rule_id.0,
        }
    }
}

/// Result of a forward step together with what reverses it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step<T> {
    pub value: T,
    pub compensations: Vec<Compensation>,
}

impl<T> Step<T> {
    pub fn new(value: T) -> Self {
        Self { value, compensations: Vec::new() }
    }

    pub fn with_compensation(mut self, compensation: Compensation) -> Self {
        self.compensations.push(compensation);
        self
    }
}
