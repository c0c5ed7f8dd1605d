use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::settings::CompanyId;
use crate::idempotency::{derive_key, IdempotencyKey};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

/// Identifier of the purchase (cart or order) an approval gates.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CartId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Admin,
    SalesManager,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::SalesManager => "sales_manager",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "sales_manager" => Some(Self::SalesManager),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

/// One required approval for a (cart, approval type) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub cart_id: CartId,
    pub company_id: CompanyId,
    pub approval_type: ApprovalType,
    pub status: ApprovalStatus,
    pub required_count: u32,
    /// Distinct actors that have approved so far.
    pub approver_ids: Vec<String>,
    pub escalated: bool,
    pub idempotency_key: IdempotencyKey,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Approval {
    pub fn new_pending(
        cart_id: CartId,
        company_id: CompanyId,
        approval_type: ApprovalType,
        required_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let idempotency_key = derive_key(&cart_id, approval_type);
        Self {
            id: ApprovalId(format!("APR-{}", Uuid::new_v4())),
            cart_id,
            company_id,
            approval_type,
            status: ApprovalStatus::Pending,
            required_count: required_count.max(1),
            approver_ids: Vec::new(),
            escalated: false,
            idempotency_key,
            version: 1,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            escalated_at: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn remaining_approvals(&self) -> u32 {
        let received = u32::try_from(self.approver_ids.len()).unwrap_or(u32::MAX);
        self.required_count.saturating_sub(received)
    }
}

/// Overall gate for a purchase, persisted in the `approval_status` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalAggregate {
    pub cart_id: CartId,
    pub status: ApprovalStatus,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalAggregate {
    pub fn new(cart_id: CartId, status: ApprovalStatus, now: DateTime<Utc>) -> Self {
        Self { cart_id, status, version: 1, created_at: now, updated_at: now }
    }
}
