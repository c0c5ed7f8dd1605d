use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::approval::{ApprovalId, ApprovalStatus, CartId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalHistoryId(pub String);

/// Append-only audit row. Actor network identifiers are stored only as one-way hashes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalHistory {
    pub id: ApprovalHistoryId,
    pub approval_id: ApprovalId,
    pub cart_id: CartId,
    pub previous_status: Option<ApprovalStatus>,
    pub new_status: ApprovalStatus,
    pub actor_id: String,
    pub actor_role: String,
    pub actor_ip_hash: Option<String>,
    pub actor_user_agent_hash: Option<String>,
    pub reason: Option<String>,
    pub cart_total_at_action: Option<Decimal>,
    pub action_timestamp: DateTime<Utc>,
}
