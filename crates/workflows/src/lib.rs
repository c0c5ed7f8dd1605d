//! Approval workflows: the operations a checkout or admin caller invokes, composed from the
//! pure decisions in `tollgate-core` and the storage ports in `tollgate-db`.

pub mod audit_trail;
pub mod saga;
pub mod service;
pub mod stores;

pub use audit_trail::AuditTrailRecorder;
pub use saga::{Compensation, Step};
pub use service::{
    ActedApproval, ApprovalDecision, ApprovalService, EscalationSweep, RequestedApprovals,
    REASON_ESCALATION_TIMEOUT, REASON_REQUESTED, REASON_RESTORED,
};
pub use stores::ApprovalStores;
