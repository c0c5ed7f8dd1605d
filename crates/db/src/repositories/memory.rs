use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use tollgate_core::approvals::CartApprovalSummary;
use tollgate_core::domain::approval::{
    Approval, ApprovalAggregate, ApprovalId, ApprovalStatus, CartId,
};
use tollgate_core::domain::history::ApprovalHistory;
use tollgate_core::domain::rule::{ApprovalRule, ApprovalRuleId};
use tollgate_core::domain::settings::{ApprovalSettings, CompanyId};
use tollgate_core::idempotency::IdempotencyKey;

use super::{
    ApprovalAggregateRepository, ApprovalHistoryRepository, ApprovalRepository,
    ApprovalRuleRepository, ApprovalSettingsRepository, CreateOutcome, RepositoryError,
};

#[derive(Default)]
pub struct InMemoryApprovalRuleRepository {
    rules: RwLock<HashMap<String, ApprovalRule>>,
}

#[async_trait::async_trait]
impl ApprovalRuleRepository for InMemoryApprovalRuleRepository {
    async fn find_by_id(
        &self,
        id: &ApprovalRuleId,
    ) -> Result<Option<ApprovalRule>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules.get(&id.0).cloned())
    }

    async fn list_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rules = self.rules.read().await;
        let mut matching: Vec<ApprovalRule> =
            rules.values().filter(|rule| &rule.company_id == company_id).cloned().collect();
        matching.sort_by(|left, right| {
            right
                .priority
                .cmp(&left.priority)
                .then_with(|| left.created_at.cmp(&right.created_at))
                .then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(matching)
    }

    async fn save(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        rules.insert(rule.id.0.clone(), rule);
        Ok(())
    }

    async fn delete(&self, id: &ApprovalRuleId) -> Result<bool, RepositoryError> {
        let mut rules = self.rules.write().await;
        Ok(rules.remove(&id.0).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryApprovalSettingsRepository {
    settings: RwLock<HashMap<String, ApprovalSettings>>,
}

#[async_trait::async_trait]
impl ApprovalSettingsRepository for InMemoryApprovalSettingsRepository {
    async fn find_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<ApprovalSettings>, RepositoryError> {
        let settings = self.settings.read().await;
        Ok(settings.get(&company_id.0).cloned())
    }

    async fn save(&self, settings: ApprovalSettings) -> Result<(), RepositoryError> {
        let mut stored = self.settings.write().await;
        let created_at = stored.get(&settings.company_id.0).map(|existing| existing.created_at);
        let mut settings = settings;
        if let Some(created_at) = created_at {
            settings.created_at = created_at;
        }
        stored.insert(settings.company_id.0.clone(), settings);
        Ok(())
    }

    async fn delete(&self, company_id: &CompanyId) -> Result<bool, RepositoryError> {
        let mut settings = self.settings.write().await;
        Ok(settings.remove(&company_id.0).is_some())
    }
}

/// Approvals and cart aggregates behind one lock, so gate checks see both tables at once.
#[derive(Default)]
struct CartTables {
    approvals: HashMap<String, Approval>,
    aggregates: HashMap<String, ApprovalAggregate>,
}

impl CartTables {
    fn has_live_pending(&self, cart_id: &CartId) -> bool {
        self.approvals.values().any(|approval| {
            &approval.cart_id == cart_id
                && approval.status == ApprovalStatus::Pending
                && !approval.is_deleted()
        })
    }

    // An approved gate may not coexist with a live pending approval.
    fn reopen_if_pending(&mut self, cart_id: &CartId, now: DateTime<Utc>) {
        if !self.has_live_pending(cart_id) {
            return;
        }
        if let Some(aggregate) = self.aggregates.get_mut(&cart_id.0) {
            if aggregate.status == ApprovalStatus::Approved {
                aggregate.status = ApprovalStatus::Pending;
                aggregate.version = aggregate.version.saturating_add(1);
                aggregate.updated_at = now;
            }
        }
    }

    fn admits(&self, aggregate: &ApprovalAggregate) -> bool {
        aggregate.status != ApprovalStatus::Approved || !self.has_live_pending(&aggregate.cart_id)
    }
}

/// Keyed by approval id; the idempotency key is checked under the same write lock.
#[derive(Default)]
pub struct InMemoryApprovalRepository {
    tables: Arc<RwLock<CartTables>>,
}

impl InMemoryApprovalRepository {
    /// Aggregate repository over the same tables as this one.
    pub fn aggregate_repository(&self) -> InMemoryApprovalAggregateRepository {
        InMemoryApprovalAggregateRepository { tables: Arc::clone(&self.tables) }
    }
}

fn oldest_first(left: &Approval, right: &Approval) -> std::cmp::Ordering {
    left.created_at.cmp(&right.created_at).then_with(|| left.id.0.cmp(&right.id.0))
}

#[async_trait::async_trait]
impl ApprovalRepository for InMemoryApprovalRepository {
    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.approvals.get(&id.0).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Approval>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.approvals.values().find(|approval| &approval.idempotency_key == key).cloned())
    }

    async fn create_if_absent(
        &self,
        approval: Approval,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, RepositoryError> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .approvals
            .values_mut()
            .find(|stored| stored.idempotency_key == approval.idempotency_key);

        let outcome = match existing {
            Some(stored) if stored.is_deleted() => {
                stored.deleted_at = None;
                stored.updated_at = now;
                stored.version = stored.version.saturating_add(1);
                CreateOutcome::Restored(stored.clone())
            }
            Some(stored) => return Ok(CreateOutcome::Existing(stored.clone())),
            None => {
                tables.approvals.insert(approval.id.0.clone(), approval.clone());
                CreateOutcome::Created(approval)
            }
        };
        tables.reopen_if_pending(&outcome.approval().cart_id, now);
        Ok(outcome)
    }

    async fn update_if_version(
        &self,
        approval: &Approval,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        match tables.approvals.get_mut(&approval.id.0) {
            Some(stored) if stored.version == expected_version => {
                *stored = approval.clone();
            }
            _ => return Ok(false),
        }
        tables.reopen_if_pending(&approval.cart_id, approval.updated_at);
        Ok(true)
    }

    async fn soft_delete(
        &self,
        id: &ApprovalId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        match tables.approvals.get_mut(&id.0) {
            Some(stored) if !stored.is_deleted() => {
                stored.deleted_at = Some(now);
                stored.updated_at = now;
                stored.version = stored.version.saturating_add(1);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn restore(&self, id: &ApprovalId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        let cart_id = match tables.approvals.get_mut(&id.0) {
            Some(stored) if stored.is_deleted() => {
                stored.deleted_at = None;
                stored.updated_at = now;
                stored.version = stored.version.saturating_add(1);
                stored.cart_id.clone()
            }
            _ => return Ok(false),
        };
        tables.reopen_if_pending(&cart_id, now);
        Ok(true)
    }

    async fn list_for_cart(&self, cart_id: &CartId) -> Result<Vec<Approval>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut live: Vec<Approval> = tables
            .approvals
            .values()
            .filter(|approval| &approval.cart_id == cart_id && !approval.is_deleted())
            .cloned()
            .collect();
        live.sort_by(oldest_first);
        Ok(live)
    }

    async fn summarize_cart(
        &self,
        cart_id: &CartId,
    ) -> Result<CartApprovalSummary, RepositoryError> {
        let tables = self.tables.read().await;
        let mut summary = CartApprovalSummary::default();
        tables
            .approvals
            .values()
            .filter(|approval| &approval.cart_id == cart_id && !approval.is_deleted())
            .for_each(|approval| summary.record(approval.status));
        Ok(summary)
    }

    async fn list_escalation_candidates(
        &self,
        limit: u32,
    ) -> Result<Vec<Approval>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut candidates: Vec<Approval> = tables
            .approvals
            .values()
            .filter(|approval| {
                approval.status == ApprovalStatus::Pending
                    && !approval.escalated
                    && !approval.is_deleted()
            })
            .cloned()
            .collect();
        candidates.sort_by(oldest_first);
        candidates.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(candidates)
    }
}

/// Build with [`InMemoryApprovalRepository::aggregate_repository`] to share its tables; a
/// default instance sees no approvals.
#[derive(Default)]
pub struct InMemoryApprovalAggregateRepository {
    tables: Arc<RwLock<CartTables>>,
}

#[async_trait::async_trait]
impl ApprovalAggregateRepository for InMemoryApprovalAggregateRepository {
    async fn find_by_cart(
        &self,
        cart_id: &CartId,
    ) -> Result<Option<ApprovalAggregate>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.aggregates.get(&cart_id.0).cloned())
    }

    async fn insert_if_absent(
        &self,
        aggregate: &ApprovalAggregate,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.aggregates.contains_key(&aggregate.cart_id.0) || !tables.admits(aggregate) {
            return Ok(false);
        }
        tables.aggregates.insert(aggregate.cart_id.0.clone(), aggregate.clone());
        Ok(true)
    }

    async fn update_if_version(
        &self,
        aggregate: &ApprovalAggregate,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        if !tables.admits(aggregate) {
            return Ok(false);
        }
        match tables.aggregates.get_mut(&aggregate.cart_id.0) {
            Some(stored) if stored.version == expected_version => {
                stored.status = aggregate.status;
                stored.version = aggregate.version;
                stored.updated_at = aggregate.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, cart_id: &CartId) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        Ok(tables.aggregates.remove(&cart_id.0).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryApprovalHistoryRepository {
    rows: RwLock<Vec<ApprovalHistory>>,
}

impl InMemoryApprovalHistoryRepository {
    async fn list_where(&self, keep: impl Fn(&ApprovalHistory) -> bool) -> Vec<ApprovalHistory> {
        let rows = self.rows.read().await;
        let mut selected: Vec<ApprovalHistory> =
            rows.iter().filter(|row| keep(row)).cloned().collect();
        // Stable sort keeps insertion order for equal timestamps.
        selected.sort_by(|left, right| left.action_timestamp.cmp(&right.action_timestamp));
        selected
    }
}

#[async_trait::async_trait]
impl ApprovalHistoryRepository for InMemoryApprovalHistoryRepository {
    async fn append(&self, entry: ApprovalHistory) -> Result<(), RepositoryError> {
        let mut rows = self.rows.write().await;
        rows.push(entry);
        Ok(())
    }

    async fn list_for_approval(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistory>, RepositoryError> {
        Ok(self.list_where(|row| &row.approval_id == approval_id).await)
    }

    async fn list_for_cart(
        &self,
        cart_id: &CartId,
    ) -> Result<Vec<ApprovalHistory>, RepositoryError> {
        Ok(self.list_where(|row| &row.cart_id == cart_id).await)
    }
}
