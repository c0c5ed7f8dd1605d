pub mod approvals;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod escalation;
pub mod idempotency;
pub mod rules;

pub use approvals::{ActionOutcome, CartApprovalSummary};
pub use audit::{ActorContext, HistoryEvent, PiiHasher};
pub use domain::approval::{
    Approval, ApprovalAggregate, ApprovalId, ApprovalStatus, ApprovalType, CartId,
};
pub use domain::history::{ApprovalHistory, ApprovalHistoryId};
pub use domain::purchase::PurchaseContext;
pub use domain::rule::{
    ApprovalRule, ApprovalRuleId, ApprovalRuleUpdate, NewApprovalRule, RuleCondition,
    RuleConditions,
};
pub use domain::settings::{ApprovalSettings, ApprovalSettingsUpdate, CompanyId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use idempotency::{derive_key, IdempotencyKey};
pub use rules::{MatchedRequirement, RequiredApproval, RequirementSource, RuleMatcher};
