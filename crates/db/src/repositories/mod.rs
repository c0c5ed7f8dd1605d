use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use tollgate_core::approvals::CartApprovalSummary;
use tollgate_core::domain::approval::{Approval, ApprovalAggregate, ApprovalId, CartId};
use tollgate_core::domain::history::ApprovalHistory;
use tollgate_core::domain::rule::{ApprovalRule, ApprovalRuleId};
use tollgate_core::domain::settings::{ApprovalSettings, CompanyId};
use tollgate_core::errors::ApplicationError;
use tollgate_core::idempotency::IdempotencyKey;

pub mod aggregate;
pub mod approval;
pub mod history;
pub mod memory;
pub mod rule;
pub mod settings;

pub use aggregate::SqlApprovalAggregateRepository;
pub use approval::SqlApprovalRepository;
pub use history::SqlApprovalHistoryRepository;
pub use memory::{
    InMemoryApprovalAggregateRepository, InMemoryApprovalHistoryRepository,
    InMemoryApprovalRepository, InMemoryApprovalRuleRepository,
    InMemoryApprovalSettingsRepository,
};
pub use rule::SqlApprovalRuleRepository;
pub use settings::SqlApprovalSettingsRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        ApplicationError::Persistence(error.to_string())
    }
}

/// Result of an idempotent approval insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Approval),
    /// A live row with the same idempotency key already existed and is returned unchanged.
    Existing(Approval),
    /// A soft-deleted row with the same key was brought back instead of inserting a duplicate.
    Restored(Approval),
}

impl CreateOutcome {
    pub fn approval(&self) -> &Approval {
        match self {
            Self::Created(approval) | Self::Existing(approval) | Self::Restored(approval) => {
                approval
            }
        }
    }

    pub fn into_approval(self) -> Approval {
        match self {
            Self::Created(approval) | Self::Existing(approval) | Self::Restored(approval) => {
                approval
            }
        }
    }
}

#[async_trait]
pub trait ApprovalRuleRepository: Send + Sync {
    async fn find_by_id(&self, id: &ApprovalRuleId)
        -> Result<Option<ApprovalRule>, RepositoryError>;

    /// All rules of a company, active or not, ordered by priority desc, created_at, id.
    async fn list_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError>;

    async fn save(&self, rule: ApprovalRule) -> Result<(), RepositoryError>;

    async fn delete(&self, id: &ApprovalRuleId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ApprovalSettingsRepository: Send + Sync {
    async fn find_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<ApprovalSettings>, RepositoryError>;

    async fn save(&self, settings: ApprovalSettings) -> Result<(), RepositoryError>;

    async fn delete(&self, company_id: &CompanyId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    /// Includes soft-deleted rows; callers decide whether a tombstone counts as missing.
    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError>;

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Approval>, RepositoryError>;

    /// Inserts unless a row with the same idempotency key exists. Exactly one row per key
    /// survives concurrent callers.
    ///
    /// Writes that leave a live pending approval on a cart whose aggregate is approved also
    /// reopen that aggregate to pending, atomically with the write. The same holds for
    /// `update_if_version` and `restore`.
    async fn create_if_absent(
        &self,
        approval: Approval,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, RepositoryError>;

    /// Writes `approval` only if the stored version still equals `expected_version`.
    async fn update_if_version(
        &self,
        approval: &Approval,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    async fn soft_delete(&self, id: &ApprovalId, now: DateTime<Utc>)
        -> Result<bool, RepositoryError>;

    async fn restore(&self, id: &ApprovalId, now: DateTime<Utc>) -> Result<bool, RepositoryError>;

    /// Live approvals of a cart, oldest first.
    async fn list_for_cart(&self, cart_id: &CartId) -> Result<Vec<Approval>, RepositoryError>;

    /// Status counts over live approvals of a cart, taken from one consistent read.
    async fn summarize_cart(&self, cart_id: &CartId)
        -> Result<CartApprovalSummary, RepositoryError>;

    /// Pending, not yet escalated, live approvals, oldest first.
    async fn list_escalation_candidates(
        &self,
        limit: u32,
    ) -> Result<Vec<Approval>, RepositoryError>;
}

#[async_trait]
pub trait ApprovalAggregateRepository: Send + Sync {
    async fn find_by_cart(
        &self,
        cart_id: &CartId,
    ) -> Result<Option<ApprovalAggregate>, RepositoryError>;

    /// Returns false when another writer created the row first, or when the row would be
    /// approved while the cart still has a live pending approval.
    async fn insert_if_absent(&self, aggregate: &ApprovalAggregate)
        -> Result<bool, RepositoryError>;

    /// Compare-and-set on `version`. An approved write is refused, atomically with the
    /// version check, while the cart still has a live pending approval.
    async fn update_if_version(
        &self,
        aggregate: &ApprovalAggregate,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    async fn delete(&self, cart_id: &CartId) -> Result<bool, RepositoryError>;
}

/// Append-only: rows are never updated or deleted.
#[async_trait]
pub trait ApprovalHistoryRepository: Send + Sync {
    async fn append(&self, entry: ApprovalHistory) -> Result<(), RepositoryError>;

    async fn list_for_approval(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistory>, RepositoryError>;

    async fn list_for_cart(&self, cart_id: &CartId)
        -> Result<Vec<ApprovalHistory>, RepositoryError>;
}

// Fixed-width UTC timestamps sort lexicographically in the same order as chronologically.
pub(crate) fn encode_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{column}: {error}")))
}

pub(crate) fn decode_optional_timestamp(
    column: &str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    raw.map(|value| decode_timestamp(column, &value)).transpose()
}

pub(crate) fn decode_decimal(column: &str, raw: &str) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(raw).map_err(|error| RepositoryError::Decode(format!("{column}: {error}")))
}

pub(crate) fn decode_error(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

pub(crate) fn decode_count(column: &str, raw: i64) -> Result<u32, RepositoryError> {
    u32::try_from(raw).map_err(|_| RepositoryError::Decode(format!("{column}: {raw} out of range")))
}
