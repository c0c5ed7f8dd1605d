use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompanyId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSettings {
    pub company_id: CompanyId,
    pub requires_admin_approval: bool,
    pub requires_sales_manager_approval: bool,
    pub escalation_enabled: bool,
    pub escalation_timeout_hours: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalSettings {
    pub fn new(company_id: CompanyId, now: DateTime<Utc>) -> Self {
        Self {
            company_id,
            requires_admin_approval: false,
            requires_sales_manager_approval: false,
            escalation_enabled: false,
            escalation_timeout_hours: 24,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, update: &ApprovalSettingsUpdate, now: DateTime<Utc>) {
        if let Some(value) = update.requires_admin_approval {
            self.requires_admin_approval = value;
        }
        if let Some(value) = update.requires_sales_manager_approval {
            self.requires_sales_manager_approval = value;
        }
        if let Some(value) = update.escalation_enabled {
            self.escalation_enabled = value;
        }
        if let Some(value) = update.escalation_timeout_hours {
            self.escalation_timeout_hours = value;
        }
        self.updated_at = now;
    }
}

/// Partial update; `None` leaves the stored value untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSettingsUpdate {
    pub requires_admin_approval: Option<bool>,
    pub requires_sales_manager_approval: Option<bool>,
    pub escalation_enabled: Option<bool>,
    pub escalation_timeout_hours: Option<u32>,
}
