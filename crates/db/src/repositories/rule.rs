use sqlx::Row;

use tollgate_core::domain::approval::ApprovalType;
use tollgate_core::domain::rule::{ApprovalRule, ApprovalRuleId, RuleConditions};
use tollgate_core::domain::settings::CompanyId;

use super::{
    decode_count, decode_error, decode_optional_timestamp, decode_timestamp, encode_timestamp,
    ApprovalRuleRepository, RepositoryError,
};
use crate::DbPool;

const RULE_COLUMNS: &str = "id, company_id, rule_name, conditions_json, required_approval_type,
    required_approvers_count, priority, is_active, effective_from, effective_until,
    created_at, updated_at";

pub struct SqlApprovalRuleRepository {
    pool: DbPool,
}

impl SqlApprovalRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalRule, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_error)?;
    let company_id: String = row.try_get("company_id").map_err(decode_error)?;
    let rule_name: String = row.try_get("rule_name").map_err(decode_error)?;
    let conditions_json: String = row.try_get("conditions_json").map_err(decode_error)?;
    let approval_type: String = row.try_get("required_approval_type").map_err(decode_error)?;
    let approvers_count: i64 = row.try_get("required_approvers_count").map_err(decode_error)?;
    let priority: i64 = row.try_get("priority").map_err(decode_error)?;
    let is_active: bool = row.try_get("is_active").map_err(decode_error)?;
    let effective_from: Option<String> = row.try_get("effective_from").map_err(decode_error)?;
    let effective_until: Option<String> = row.try_get("effective_until").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;

    let conditions_value: serde_json::Value = serde_json::from_str(&conditions_json)
        .map_err(|error| RepositoryError::Decode(format!("conditions_json: {error}")))?;
    let required_approval_type = ApprovalType::parse(&approval_type).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown required_approval_type `{approval_type}`"))
    })?;
    let priority = i32::try_from(priority)
        .map_err(|_| RepositoryError::Decode(format!("priority: {priority} out of range")))?;

    Ok(ApprovalRule {
        id: ApprovalRuleId(id),
        company_id: CompanyId(company_id),
        rule_name,
        conditions: RuleConditions::from_json(&conditions_value),
        required_approval_type,
        required_approvers_count: decode_count("required_approvers_count", approvers_count)?,
        priority,
        is_active,
        effective_from: decode_optional_timestamp("effective_from", effective_from)?,
        effective_until: decode_optional_timestamp("effective_until", effective_until)?,
        created_at: decode_timestamp("created_at", &created_at)?,
        updated_at: decode_timestamp("updated_at", &updated_at)?,
    })
}

#[async_trait::async_trait]
impl ApprovalRuleRepository for SqlApprovalRuleRepository {
    async fn find_by_id(
        &self,
        id: &ApprovalRuleId,
    ) -> Result<Option<ApprovalRule>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RULE_COLUMNS} FROM approval_rule WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_rule).transpose()
    }

    async fn list_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM approval_rule
             WHERE company_id = ?
             ORDER BY priority DESC, created_at ASC, id ASC"
        ))
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_rule).collect()
    }

    async fn save(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approval_rule (id, company_id, rule_name, conditions_json,
                                        required_approval_type, required_approvers_count,
                                        priority, is_active, effective_from, effective_until,
                                        created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 rule_name = excluded.rule_name,
                 conditions_json = excluded.conditions_json,
                 required_approval_type = excluded.required_approval_type,
                 required_approvers_count = excluded.required_approvers_count,
                 priority = excluded.priority,
                 is_active = excluded.is_active,
                 effective_from = excluded.effective_from,
                 effective_until = excluded.effective_until,
                 updated_at = excluded.updated_at",
        )
        .bind(&rule.id.0)
        .bind(&rule.company_id.0)
        .bind(&rule.rule_name)
        .bind(rule.conditions.to_json().to_string())
        .bind(rule.required_approval_type.as_str())
        .bind(i64::from(rule.required_approvers_count))
        .bind(i64::from(rule.priority))
        .bind(rule.is_active)
        .bind(rule.effective_from.as_ref().map(encode_timestamp))
        .bind(rule.effective_until.as_ref().map(encode_timestamp))
        .bind(encode_timestamp(&rule.created_at))
        .bind(encode_timestamp(&rule.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &ApprovalRuleId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM approval_rule WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc, Weekday};
    use rust_decimal::Decimal;

    use tollgate_core::domain::approval::ApprovalType;
    use tollgate_core::domain::rule::{
        ApprovalRule, ApprovalRuleUpdate, NewApprovalRule, RuleCondition, RuleConditions,
    };
    use tollgate_core::domain::settings::CompanyId;

    use super::SqlApprovalRuleRepository;
    use crate::repositories::ApprovalRuleRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn sample_rule(company: &str, priority: i32) -> ApprovalRule {
        ApprovalRule::from_new(
            NewApprovalRule {
                company_id: CompanyId(company.to_string()),
                rule_name: format!("priority {priority}"),
                conditions: RuleConditions::new(vec![
                    RuleCondition::CartTotalGte { threshold: Decimal::new(1000050, 2) },
                    RuleCondition::DayOfWeekIn { days: vec![Weekday::Sun, Weekday::Sat] },
                ]),
                required_approval_type: ApprovalType::Admin,
                required_approvers_count: 2,
                priority,
                is_active: true,
                effective_from: Some(Utc::now() - Duration::days(1)),
                effective_until: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn save_and_find_preserves_conditions_and_window() {
        let repo = SqlApprovalRuleRepository::new(setup().await);
        let rule = sample_rule("comp-1", 10);

        repo.save(rule.clone()).await.expect("save");
        let found = repo.find_by_id(&rule.id).await.expect("find").expect("should exist");

        assert_eq!(found.conditions, rule.conditions);
        assert_eq!(found.required_approvers_count, 2);
        assert_eq!(
            found.effective_from.map(|at| at.timestamp_micros()),
            rule.effective_from.map(|at| at.timestamp_micros())
        );
        assert_eq!(found.effective_until, None);
    }

    #[tokio::test]
    async fn list_for_company_orders_by_priority_and_scopes_company() {
        let repo = SqlApprovalRuleRepository::new(setup().await);
        repo.save(sample_rule("comp-1", 5)).await.expect("save low");
        repo.save(sample_rule("comp-1", 20)).await.expect("save high");
        repo.save(sample_rule("comp-2", 99)).await.expect("save foreign");

        let rules = repo.list_for_company(&CompanyId("comp-1".to_string())).await.expect("list");

        let priorities: Vec<i32> = rules.iter().map(|rule| rule.priority).collect();
        assert_eq!(priorities, vec![20, 5]);
    }

    #[tokio::test]
    async fn save_upserts_and_delete_removes() {
        let repo = SqlApprovalRuleRepository::new(setup().await);
        let mut rule = sample_rule("comp-1", 10);
        repo.save(rule.clone()).await.expect("save");

        rule.apply(ApprovalRuleUpdate { is_active: Some(false), ..Default::default() }, Utc::now());
        repo.save(rule.clone()).await.expect("upsert");
        let found = repo.find_by_id(&rule.id).await.expect("find").expect("should exist");
        assert!(!found.is_active);

        assert!(repo.delete(&rule.id).await.expect("delete"));
        assert!(!repo.delete(&rule.id).await.expect("delete again"));
        assert_eq!(repo.find_by_id(&rule.id).await.expect("find"), None);
    }

    #[tokio::test]
    async fn unknown_condition_keys_in_storage_are_ignored() {
        let pool = setup().await;
        let repo = SqlApprovalRuleRepository::new(pool.clone());
        let rule = sample_rule("comp-1", 1);
        repo.save(rule.clone()).await.expect("save");

        sqlx::query(
            "UPDATE approval_rule
             SET conditions_json = '{\"cart_total_gte\": 500, \"customer_tier\": \"gold\"}'
             WHERE id = ?",
        )
        .bind(&rule.id.0)
        .execute(&pool)
        .await
        .expect("rewrite conditions");

        let found = repo.find_by_id(&rule.id).await.expect("find").expect("should exist");
        assert_eq!(
            found.conditions,
            RuleConditions::new(vec![RuleCondition::CartTotalGte {
                threshold: Decimal::new(500, 0)
            }])
        );
    }
}
