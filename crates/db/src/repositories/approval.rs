use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};

use tollgate_core::approvals::CartApprovalSummary;
use tollgate_core::domain::approval::{
    Approval, ApprovalId, ApprovalStatus, ApprovalType, CartId,
};
use tollgate_core::domain::settings::CompanyId;
use tollgate_core::idempotency::IdempotencyKey;

use super::{
    decode_count, decode_error, decode_optional_timestamp, decode_timestamp, encode_timestamp,
    ApprovalRepository, CreateOutcome, RepositoryError,
};
use crate::DbPool;

const APPROVAL_COLUMNS: &str = "id, cart_id, company_id, approval_type, status, required_count,
    approver_ids_json, escalated, idempotency_key, version, created_at, updated_at,
    resolved_at, escalated_at, deleted_at";

pub struct SqlApprovalRepository {
    pool: DbPool,
}

impl SqlApprovalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_approval(row: &sqlx::sqlite::SqliteRow) -> Result<Approval, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_error)?;
    let cart_id: String = row.try_get("cart_id").map_err(decode_error)?;
    let company_id: String = row.try_get("company_id").map_err(decode_error)?;
    let approval_type: String = row.try_get("approval_type").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let required_count: i64 = row.try_get("required_count").map_err(decode_error)?;
    let approver_ids_json: String = row.try_get("approver_ids_json").map_err(decode_error)?;
    let escalated: bool = row.try_get("escalated").map_err(decode_error)?;
    let idempotency_key: String = row.try_get("idempotency_key").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;
    let resolved_at: Option<String> = row.try_get("resolved_at").map_err(decode_error)?;
    let escalated_at: Option<String> = row.try_get("escalated_at").map_err(decode_error)?;
    let deleted_at: Option<String> = row.try_get("deleted_at").map_err(decode_error)?;

    let approval_type = ApprovalType::parse(&approval_type).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown approval_type `{approval_type}`"))
    })?;
    let status = ApprovalStatus::parse(&status)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval status `{status}`")))?;
    let approver_ids: Vec<String> = serde_json::from_str(&approver_ids_json)
        .map_err(|error| RepositoryError::Decode(format!("approver_ids_json: {error}")))?;

    Ok(Approval {
        id: ApprovalId(id),
        cart_id: CartId(cart_id),
        company_id: CompanyId(company_id),
        approval_type,
        status,
        required_count: decode_count("required_count", required_count)?,
        approver_ids,
        escalated,
        idempotency_key: IdempotencyKey(idempotency_key),
        version: decode_count("version", version)?,
        created_at: decode_timestamp("created_at", &created_at)?,
        updated_at: decode_timestamp("updated_at", &updated_at)?,
        resolved_at: decode_optional_timestamp("resolved_at", resolved_at)?,
        escalated_at: decode_optional_timestamp("escalated_at", escalated_at)?,
        deleted_at: decode_optional_timestamp("deleted_at", deleted_at)?,
    })
}

// An approved cart gate may not coexist with a live pending approval.
async fn reopen_if_pending(
    conn: &mut SqliteConnection,
    cart_id: &CartId,
    now: &DateTime<Utc>,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "UPDATE approval_status SET status = 'pending', version = version + 1, updated_at = ?
         WHERE cart_id = ? AND status = 'approved'
           AND EXISTS (SELECT 1 FROM approval
                       WHERE cart_id = ? AND status = 'pending' AND deleted_at IS NULL)",
    )
    .bind(encode_timestamp(now))
    .bind(&cart_id.0)
    .bind(&cart_id.0)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn encode_approver_ids(approver_ids: &[String]) -> String {
    serde_json::Value::from(approver_ids.to_vec()).to_string()
}

#[async_trait::async_trait]
impl ApprovalRepository for SqlApprovalRepository {
    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {APPROVAL_COLUMNS} FROM approval WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_approval).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Approval>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval WHERE idempotency_key = ?"
        ))
        .bind(&key.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_approval).transpose()
    }

    async fn create_if_absent(
        &self,
        approval: Approval,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, RepositoryError> {
        // The unique index on idempotency_key arbitrates concurrent creators.
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO approval (id, cart_id, company_id, approval_type, status, required_count,
                                   approver_ids_json, escalated, idempotency_key, version,
                                   created_at, updated_at, resolved_at, escalated_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(idempotency_key) DO NOTHING",
        )
        .bind(&approval.id.0)
        .bind(&approval.cart_id.0)
        .bind(&approval.company_id.0)
        .bind(approval.approval_type.as_str())
        .bind(approval.status.as_str())
        .bind(i64::from(approval.required_count))
        .bind(encode_approver_ids(&approval.approver_ids))
        .bind(approval.escalated)
        .bind(&approval.idempotency_key.0)
        .bind(i64::from(approval.version))
        .bind(encode_timestamp(&approval.created_at))
        .bind(encode_timestamp(&approval.updated_at))
        .bind(approval.resolved_at.as_ref().map(encode_timestamp))
        .bind(approval.escalated_at.as_ref().map(encode_timestamp))
        .bind(approval.deleted_at.as_ref().map(encode_timestamp))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            reopen_if_pending(&mut tx, &approval.cart_id, &now).await?;
            tx.commit().await?;
            return Ok(CreateOutcome::Created(approval));
        }
        tx.rollback().await?;

        let existing = self.find_by_idempotency_key(&approval.idempotency_key).await?.ok_or_else(
            || {
                RepositoryError::Decode(format!(
                    "idempotency key `{}` conflicted but no row was found",
                    approval.idempotency_key.0
                ))
            },
        )?;

        if !existing.is_deleted() {
            return Ok(CreateOutcome::Existing(existing));
        }

        let restored = self.restore(&existing.id, now).await?;
        let current = self.find_by_id(&existing.id).await?.ok_or_else(|| {
            RepositoryError::Decode(format!("approval `{}` vanished during restore", existing.id.0))
        })?;

        if restored {
            Ok(CreateOutcome::Restored(current))
        } else {
            Ok(CreateOutcome::Existing(current))
        }
    }

    async fn update_if_version(
        &self,
        approval: &Approval,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE approval
             SET status = ?, required_count = ?, approver_ids_json = ?, escalated = ?,
                 version = ?, updated_at = ?, resolved_at = ?, escalated_at = ?, deleted_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(approval.status.as_str())
        .bind(i64::from(approval.required_count))
        .bind(encode_approver_ids(&approval.approver_ids))
        .bind(approval.escalated)
        .bind(i64::from(approval.version))
        .bind(encode_timestamp(&approval.updated_at))
        .bind(approval.resolved_at.as_ref().map(encode_timestamp))
        .bind(approval.escalated_at.as_ref().map(encode_timestamp))
        .bind(approval.deleted_at.as_ref().map(encode_timestamp))
        .bind(&approval.id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }
        reopen_if_pending(&mut tx, &approval.cart_id, &approval.updated_at).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn soft_delete(
        &self,
        id: &ApprovalId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE approval SET deleted_at = ?, updated_at = ?, version = version + 1
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(encode_timestamp(&now))
        .bind(encode_timestamp(&now))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn restore(&self, id: &ApprovalId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let restored = sqlx::query(
            "UPDATE approval SET deleted_at = NULL, updated_at = ?, version = version + 1
             WHERE id = ? AND deleted_at IS NOT NULL
             RETURNING cart_id",
        )
        .bind(encode_timestamp(&now))
        .bind(&id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = restored else {
            tx.rollback().await?;
            return Ok(false);
        };
        let cart_id: String = row.try_get("cart_id").map_err(decode_error)?;
        reopen_if_pending(&mut tx, &CartId(cart_id), &now).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_for_cart(&self, cart_id: &CartId) -> Result<Vec<Approval>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval
             WHERE cart_id = ? AND deleted_at IS NULL
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&cart_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_approval).collect()
    }

    async fn summarize_cart(
        &self,
        cart_id: &CartId,
    ) -> Result<CartApprovalSummary, RepositoryError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                    COALESCE(SUM(CASE WHEN status = 'approved' THEN 1 ELSE 0 END), 0) AS approved,
                    COALESCE(SUM(CASE WHEN status = 'rejected' THEN 1 ELSE 0 END), 0) AS rejected
             FROM approval
             WHERE cart_id = ? AND deleted_at IS NULL",
        )
        .bind(&cart_id.0)
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = row.try_get("pending").map_err(decode_error)?;
        let approved: i64 = row.try_get("approved").map_err(decode_error)?;
        let rejected: i64 = row.try_get("rejected").map_err(decode_error)?;

        Ok(CartApprovalSummary {
            pending: decode_count("pending", pending)?,
            approved: decode_count("approved", approved)?,
            rejected: decode_count("rejected", rejected)?,
        })
    }

    async fn list_escalation_candidates(
        &self,
        limit: u32,
    ) -> Result<Vec<Approval>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval
             WHERE status = 'pending' AND escalated = 0 AND deleted_at IS NULL
             ORDER BY created_at ASC, id ASC
             LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_approval).collect()
    }
}
