use sqlx::Row;

use tollgate_core::domain::approval::{ApprovalAggregate, ApprovalStatus, CartId};

use super::{
    decode_count, decode_error, decode_timestamp, encode_timestamp, ApprovalAggregateRepository,
    RepositoryError,
};
use crate::DbPool;

// Binds the new status, then the cart id. Evaluated in the same statement as the write.
const GATE_ADMITS: &str = "(? <> 'approved' OR NOT EXISTS (
        SELECT 1 FROM approval
        WHERE cart_id = ? AND status = 'pending' AND deleted_at IS NULL))";

pub struct SqlApprovalAggregateRepository {
    pool: DbPool,
}

impl SqlApprovalAggregateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_aggregate(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalAggregate, RepositoryError> {
    let cart_id: String = row.try_get("cart_id").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;

    let status = ApprovalStatus::parse(&status)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown aggregate status `{status}`")))?;

    Ok(ApprovalAggregate {
        cart_id: CartId(cart_id),
        status,
        version: decode_count("version", version)?,
        created_at: decode_timestamp("created_at", &created_at)?,
        updated_at: decode_timestamp("updated_at", &updated_at)?,
    })
}

#[async_trait::async_trait]
impl ApprovalAggregateRepository for SqlApprovalAggregateRepository {
    async fn find_by_cart(
        &self,
        cart_id: &CartId,
    ) -> Result<Option<ApprovalAggregate>, RepositoryError> {
        let row = sqlx::query(
            "SELECT cart_id, status, version, created_at, updated_at
             FROM approval_status WHERE cart_id = ?",
        )
        .bind(&cart_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_aggregate).transpose()
    }

    async fn insert_if_absent(
        &self,
        aggregate: &ApprovalAggregate,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(&format!(
            "INSERT INTO approval_status (cart_id, status, version, created_at, updated_at)
             SELECT ?, ?, ?, ?, ?
             WHERE {GATE_ADMITS}
             ON CONFLICT(cart_id) DO NOTHING"
        ))
        .bind(&aggregate.cart_id.0)
        .bind(aggregate.status.as_str())
        .bind(i64::from(aggregate.version))
        .bind(encode_timestamp(&aggregate.created_at))
        .bind(encode_timestamp(&aggregate.updated_at))
        .bind(aggregate.status.as_str())
        .bind(&aggregate.cart_id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_if_version(
        &self,
        aggregate: &ApprovalAggregate,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(&format!(
            "UPDATE approval_status SET status = ?, version = ?, updated_at = ?
             WHERE cart_id = ? AND version = ? AND {GATE_ADMITS}"
        ))
        .bind(aggregate.status.as_str())
        .bind(i64::from(aggregate.version))
        .bind(encode_timestamp(&aggregate.updated_at))
        .bind(&aggregate.cart_id.0)
        .bind(i64::from(expected_version))
        .bind(aggregate.status.as_str())
        .bind(&aggregate.cart_id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, cart_id: &CartId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM approval_status WHERE cart_id = ?")
            .bind(&cart_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use tollgate_core::domain::approval::{
        Approval, ApprovalAggregate, ApprovalStatus, ApprovalType, CartId,
    };
    use tollgate_core::domain::settings::CompanyId;

    use super::SqlApprovalAggregateRepository;
    use crate::repositories::{
        ApprovalAggregateRepository, ApprovalRepository, SqlApprovalRepository,
    };
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlApprovalAggregateRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlApprovalAggregateRepository::new(pool)
    }

    #[tokio::test]
    async fn insert_if_absent_keeps_first_writer() {
        let repo = setup().await;
        let cart = CartId("cart-1".to_string());

        let first = ApprovalAggregate::new(cart.clone(), ApprovalStatus::Pending, Utc::now());
        let second = ApprovalAggregate::new(cart.clone(), ApprovalStatus::Approved, Utc::now());

        assert!(repo.insert_if_absent(&first).await.expect("first insert"));
        assert!(!repo.insert_if_absent(&second).await.expect("second insert"));

        let stored = repo.find_by_cart(&cart).await.expect("find").expect("exists");
        assert_eq!(stored.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn compare_and_set_detects_interleaved_writers() {
        let repo = setup().await;
        let cart = CartId("cart-1".to_string());
        let initial = ApprovalAggregate::new(cart.clone(), ApprovalStatus::Pending, Utc::now());
        repo.insert_if_absent(&initial).await.expect("insert");

        let mut rejected = initial.clone();
        rejected.status = ApprovalStatus::Rejected;
        rejected.version = 2;
        let mut approved = initial.clone();
        approved.status = ApprovalStatus::Approved;
        approved.version = 2;

        assert!(repo.update_if_version(&rejected, 1).await.expect("winner"));
        assert!(!repo.update_if_version(&approved, 1).await.expect("loser"));

        let stored = repo.find_by_cart(&cart).await.expect("find").expect("exists");
        assert_eq!(stored.status, ApprovalStatus::Rejected);
        assert_eq!(stored.version, 2);

        assert!(repo.delete(&cart).await.expect("delete"));
        assert_eq!(repo.find_by_cart(&cart).await.expect("find"), None);
    }

    #[tokio::test]
    async fn approved_gate_waits_for_pending_approvals() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let approvals = SqlApprovalRepository::new(pool.clone());
        let repo = SqlApprovalAggregateRepository::new(pool);
        let cart = CartId("cart-1".to_string());

        let approval = Approval::new_pending(
            cart.clone(),
            CompanyId("comp-1".to_string()),
            ApprovalType::Admin,
            1,
            Utc::now(),
        );
        approvals.create_if_absent(approval.clone(), Utc::now()).await.expect("create");

        let approved = ApprovalAggregate::new(cart.clone(), ApprovalStatus::Approved, Utc::now());
        assert!(!repo.insert_if_absent(&approved).await.expect("guarded insert"));

        let gate = ApprovalAggregate::new(cart.clone(), ApprovalStatus::Pending, Utc::now());
        assert!(repo.insert_if_absent(&gate).await.expect("insert"));
        let mut next = gate.clone();
        next.status = ApprovalStatus::Approved;
        next.version = 2;
        assert!(!repo.update_if_version(&next, 1).await.expect("guarded cas"));

        let mut decided = approval.clone();
        decided.status = ApprovalStatus::Approved;
        decided.version = 2;
        assert!(approvals.update_if_version(&decided, 1).await.expect("decide"));
        assert!(repo.update_if_version(&next, 1).await.expect("cas"));

        let mut reopened = decided.clone();
        reopened.status = ApprovalStatus::Pending;
        reopened.version = 3;
        assert!(approvals.update_if_version(&reopened, 2).await.expect("reopen"));
        let stored = repo.find_by_cart(&cart).await.expect("find").expect("exists");
        assert_eq!(stored.status, ApprovalStatus::Pending);
        assert_eq!(stored.version, 3);
    }
}
