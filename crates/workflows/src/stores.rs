use std::sync::Arc;

use tollgate_db::repositories::{
    ApprovalAggregateRepository, ApprovalHistoryRepository, ApprovalRepository,
    ApprovalRuleRepository, ApprovalSettingsRepository, InMemoryApprovalHistoryRepository,
    InMemoryApprovalRepository, InMemoryApprovalRuleRepository,
    InMemoryApprovalSettingsRepository, SqlApprovalAggregateRepository,
    SqlApprovalHistoryRepository, SqlApprovalRepository, SqlApprovalRuleRepository,
    SqlApprovalSettingsRepository,
};
use tollgate_db::DbPool;

/// One adapter per storage port, shared by every operation of the engine.
#[derive(Clone)]
pub struct ApprovalStores {
    pub rules: Arc<dyn ApprovalRuleRepository>,
    pub settings: Arc<dyn ApprovalSettingsRepository>,
    pub approvals: Arc<dyn ApprovalRepository>,
    pub aggregates: Arc<dyn ApprovalAggregateRepository>,
    pub history: Arc<dyn ApprovalHistoryRepository>,
}

impl ApprovalStores {
    pub fn sqlite(pool: DbPool) -> Self {
        Self {
            rules: Arc::new(SqlApprovalRuleRepository::new(pool.clone())),
            settings: Arc::new(SqlApprovalSettingsRepository::new(pool.clone())),
            approvals: Arc::new(SqlApprovalRepository::new(pool.clone())),
            aggregates: Arc::new(SqlApprovalAggregateRepository::new(pool.clone())),
            history: Arc::new(SqlApprovalHistoryRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        let approvals = InMemoryApprovalRepository::default();
        let aggregates = approvals.aggregate_repository();
        Self {
            rules: Arc::new(InMemoryApprovalRuleRepository::default()),
            settings: Arc::new(InMemoryApprovalSettingsRepository::default()),
            approvals: Arc::new(approvals),
            aggregates: Arc::new(aggregates),
            history: Arc::new(InMemoryApprovalHistoryRepository::default()),
        }
    }
}
