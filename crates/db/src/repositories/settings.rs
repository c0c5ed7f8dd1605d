use sqlx::Row;

use tollgate_core::domain::settings::{ApprovalSettings, CompanyId};

use super::{
    decode_count, decode_error, decode_timestamp, encode_timestamp, ApprovalSettingsRepository,
    RepositoryError,
};
use crate::DbPool;

pub struct SqlApprovalSettingsRepository {
    pool: DbPool,
}

impl SqlApprovalSettingsRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_settings(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalSettings, RepositoryError> {
    let company_id: String = row.try_get("company_id").map_err(decode_error)?;
    let requires_admin: bool = row.try_get("requires_admin_approval").map_err(decode_error)?;
    let requires_sales_manager: bool =
        row.try_get("requires_sales_manager_approval").map_err(decode_error)?;
    let escalation_enabled: bool = row.try_get("escalation_enabled").map_err(decode_error)?;
    let timeout_hours: i64 = row.try_get("escalation_timeout_hours").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;

    Ok(ApprovalSettings {
        company_id: CompanyId(company_id),
        requires_admin_approval: requires_admin,
        requires_sales_manager_approval: requires_sales_manager,
        escalation_enabled,
        escalation_timeout_hours: decode_count("escalation_timeout_hours", timeout_hours)?,
        created_at: decode_timestamp("created_at", &created_at)?,
        updated_at: decode_timestamp("updated_at", &updated_at)?,
    })
}

#[async_trait::async_trait]
impl ApprovalSettingsRepository for SqlApprovalSettingsRepository {
    async fn find_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<ApprovalSettings>, RepositoryError> {
        let row = sqlx::query(
            "SELECT company_id, requires_admin_approval, requires_sales_manager_approval,
                    escalation_enabled, escalation_timeout_hours, created_at, updated_at
             FROM approval_settings WHERE company_id = ?",
        )
        .bind(&company_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_settings).transpose()
    }

    async fn save(&self, settings: ApprovalSettings) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approval_settings (company_id, requires_admin_approval,
                                            requires_sales_manager_approval, escalation_enabled,
                                            escalation_timeout_hours, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(company_id) DO UPDATE SET
                 requires_admin_approval = excluded.requires_admin_approval,
                 requires_sales_manager_approval = excluded.requires_sales_manager_approval,
                 escalation_enabled = excluded.escalation_enabled,
                 escalation_timeout_hours = excluded.escalation_timeout_hours,
                 updated_at = excluded.updated_at",
        )
        .bind(&settings.company_id.0)
        .bind(settings.requires_admin_approval)
        .bind(settings.requires_sales_manager_approval)
        .bind(settings.escalation_enabled)
        .bind(i64::from(settings.escalation_timeout_hours))
        .bind(encode_timestamp(&settings.created_at))
        .bind(encode_timestamp(&settings.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, company_id: &CompanyId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM approval_settings WHERE company_id = ?")
            .bind(&company_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
