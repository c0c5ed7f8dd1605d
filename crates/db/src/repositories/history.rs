use sqlx::Row;

use tollgate_core::domain::approval::{ApprovalId, ApprovalStatus, CartId};
use tollgate_core::domain::history::{ApprovalHistory, ApprovalHistoryId};

use super::{
    decode_decimal, decode_error, decode_timestamp, encode_timestamp, ApprovalHistoryRepository,
    RepositoryError,
};
use crate::DbPool;

const HISTORY_COLUMNS: &str = "id, approval_id, cart_id, previous_status, new_status, actor_id,
    actor_role, actor_ip_hash, actor_user_agent_hash, reason, cart_total_at_action,
    action_timestamp";

pub struct SqlApprovalHistoryRepository {
    pool: DbPool,
}

impl SqlApprovalHistoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_status(column: &str, raw: &str) -> Result<ApprovalStatus, RepositoryError> {
    ApprovalStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Decode(format!("{column}: unknown status `{raw}`")))
}

fn row_to_history(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalHistory, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_error)?;
    let approval_id: String = row.try_get("approval_id").map_err(decode_error)?;
    let cart_id: String = row.try_get("cart_id").map_err(decode_error)?;
    let previous_status: Option<String> = row.try_get("previous_status").map_err(decode_error)?;
    let new_status: String = row.try_get("new_status").map_err(decode_error)?;
    let actor_id: String = row.try_get("actor_id").map_err(decode_error)?;
    let actor_role: String = row.try_get("actor_role").map_err(decode_error)?;
    let actor_ip_hash: Option<String> = row.try_get("actor_ip_hash").map_err(decode_error)?;
    let actor_user_agent_hash: Option<String> =
        row.try_get("actor_user_agent_hash").map_err(decode_error)?;
    let reason: Option<String> = row.try_get("reason").map_err(decode_error)?;
    let cart_total: Option<String> = row.try_get("cart_total_at_action").map_err(decode_error)?;
    let action_timestamp: String = row.try_get("action_timestamp").map_err(decode_error)?;

    Ok(ApprovalHistory {
        id: ApprovalHistoryId(id),
        approval_id: ApprovalId(approval_id),
        cart_id: CartId(cart_id),
        previous_status: previous_status
            .map(|raw| parse_status("previous_status", &raw))
            .transpose()?,
        new_status: parse_status("new_status", &new_status)?,
        actor_id,
        actor_role,
        actor_ip_hash,
        actor_user_agent_hash,
        reason,
        cart_total_at_action: cart_total
            .map(|raw| decode_decimal("cart_total_at_action", &raw))
            .transpose()?,
        action_timestamp: decode_timestamp("action_timestamp", &action_timestamp)?,
    })
}

#[async_trait::async_trait]
impl ApprovalHistoryRepository for SqlApprovalHistoryRepository {
    async fn append(&self, entry: ApprovalHistory) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approval_history (id, approval_id, cart_id, previous_status, new_status,
                                           actor_id, actor_role, actor_ip_hash,
                                           actor_user_agent_hash, reason, cart_total_at_action,
                                           action_timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id.0)
        .bind(&entry.approval_id.0)
        .bind(&entry.cart_id.0)
        .bind(entry.previous_status.map(|status| status.as_str()))
        .bind(entry.new_status.as_str())
        .bind(&entry.actor_id)
        .bind(&entry.actor_role)
        .bind(&entry.actor_ip_hash)
        .bind(&entry.actor_user_agent_hash)
        .bind(&entry.reason)
        .bind(entry.cart_total_at_action.map(|total| total.to_string()))
        .bind(encode_timestamp(&entry.action_timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_approval(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistory>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM approval_history
             WHERE approval_id = ?
             ORDER BY action_timestamp ASC, rowid ASC"
        ))
        .bind(&approval_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_history).collect()
    }

    async fn list_for_cart(
        &self,
        cart_id: &CartId,
    ) -> Result<Vec<ApprovalHistory>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM approval_history
             WHERE cart_id = ?
             ORDER BY action_timestamp ASC, rowid ASC"
        ))
        .bind(&cart_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_history).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use tollgate_core::audit::{ActorContext, HistoryEvent, PiiHasher};
    use tollgate_core::domain::approval::{Approval, ApprovalStatus, ApprovalType, CartId};
    use tollgate_core::domain::settings::CompanyId;

    use super::SqlApprovalHistoryRepository;
    use crate::repositories::{
        ApprovalHistoryRepository, ApprovalRepository, SqlApprovalRepository,
    };
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    /// Inserts the parent approval so the history foreign key is satisfied.
    async fn insert_approval(pool: &sqlx::SqlitePool, cart: &str) -> Approval {
        let approval = Approval::new_pending(
            CartId(cart.to_string()),
            CompanyId("comp-1".to_string()),
            ApprovalType::Admin,
            1,
            Utc::now(),
        );
        SqlApprovalRepository::new(pool.clone())
            .create_if_absent(approval, Utc::now())
            .await
            .expect("insert parent approval")
            .into_approval()
    }

    #[tokio::test]
    async fn appended_rows_list_oldest_first_with_hashes_only() {
        let pool = setup().await;
        let approval = insert_approval(&pool, "cart-1").await;
        let repo = SqlApprovalHistoryRepository::new(pool);
        let hasher = PiiHasher::default();
        let start = Utc::now();

        let created = HistoryEvent::for_approval(&approval, None, ActorContext::system())
            .with_cart_total(Some(Decimal::new(1500000, 2)))
            .into_history(&hasher, start);
        let mut decided = approval.clone();
        decided.status = ApprovalStatus::Approved;
        let actor = ActorContext::new("user-1", "admin")
            .with_ip("10.0.0.50")
            .with_user_agent("Safari/17.0");
        let approved = HistoryEvent::for_approval(&decided, Some(ApprovalStatus::Pending), actor)
            .with_reason(Some("fits the quarter budget".to_string()))
            .into_history(&hasher, start + Duration::seconds(5));

        repo.append(approved).await.expect("append approval row");
        repo.append(created).await.expect("append creation row");

        let rows = repo.list_for_approval(&approval.id).await.expect("list");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].previous_status, None);
        assert_eq!(rows[0].cart_total_at_action, Some(Decimal::new(15000, 0)));
        assert_eq!(rows[1].new_status, ApprovalStatus::Approved);
        assert_eq!(rows[1].reason.as_deref(), Some("fits the quarter budget"));

        let ip_hash = rows[1].actor_ip_hash.as_deref().expect("ip hash");
        assert_eq!(ip_hash.len(), 64);
        assert_ne!(ip_hash, "10.0.0.50");
        assert_ne!(rows[1].actor_user_agent_hash.as_deref(), Some("Safari/17.0"));
    }

    #[tokio::test]
    async fn cart_listing_spans_all_approvals_of_the_cart() {
        let pool = setup().await;
        let first = insert_approval(&pool, "cart-1").await;
        let other = insert_approval(&pool, "cart-2").await;
        let repo = SqlApprovalHistoryRepository::new(pool);
        let hasher = PiiHasher::default();

        for approval in [&first, &other] {
            let row = HistoryEvent::for_approval(approval, None, ActorContext::system())
                .into_history(&hasher, Utc::now());
            repo.append(row).await.expect("append");
        }

        let rows = repo.list_for_cart(&CartId("cart-1".to_string())).await.expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].approval_id, first.id);
    }
}
