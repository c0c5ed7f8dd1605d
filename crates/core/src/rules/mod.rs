use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::ApprovalType;
use crate::domain::purchase::PurchaseContext;
use crate::domain::rule::{ApprovalRule, ApprovalRuleId, RuleCondition};
use crate::domain::settings::{ApprovalSettings, CompanyId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredApproval {
    pub approval_type: ApprovalType,
    pub required_count: u32,
}

/// Where a requirement came from, for logging and display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequirementSource {
    Rule { rule_id: ApprovalRuleId, priority: i32 },
    CompanySetting,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedRequirement {
    pub requirement: RequiredApproval,
    pub source: RequirementSource,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RuleMatcher;

impl RuleMatcher {
    /// Requirements of every effective, matching rule of `company_id`, highest priority first.
    pub fn evaluate(
        &self,
        company_id: &CompanyId,
        rules: &[ApprovalRule],
        context: &PurchaseContext,
        now: DateTime<Utc>,
    ) -> Vec<RequiredApproval> {
        self.matching_rules(company_id, rules, context, now)
            .into_iter()
            .map(requirement_of)
            .collect()
    }

    pub fn matching_rules<'a>(
        &self,
        company_id: &CompanyId,
        rules: &'a [ApprovalRule],
        context: &PurchaseContext,
        now: DateTime<Utc>,
    ) -> Vec<&'a ApprovalRule> {
        let mut candidates: Vec<&ApprovalRule> = rules
            .iter()
            .filter(|rule| &rule.company_id == company_id)
            .filter(|rule| rule.is_effective_at(now))
            .collect();
        candidates.sort_by(|left, right| priority_order(left, right));

        candidates.into_iter().filter(|rule| rule_matches(rule, context)).collect()
    }

    /// Rule requirements followed by the coarse per-company toggles, which only add a
    /// requirement for a type no matched rule already asks for.
    pub fn requirements_with_settings(
        &self,
        settings: &ApprovalSettings,
        rules: &[ApprovalRule],
        context: &PurchaseContext,
        now: DateTime<Utc>,
    ) -> Vec<MatchedRequirement> {
        let mut requirements: Vec<MatchedRequirement> = self
            .matching_rules(&settings.company_id, rules, context, now)
            .into_iter()
            .map(|rule| MatchedRequirement {
                requirement: requirement_of(rule),
                source: RequirementSource::Rule { rule_id: rule.id.clone(), priority: rule.priority },
            })
            .collect();

        let toggles = [
            (settings.requires_admin_approval, ApprovalType::Admin),
            (settings.requires_sales_manager_approval, ApprovalType::SalesManager),
        ];
        for (enabled, approval_type) in toggles {
            let already_required =
                requirements.iter().any(|matched| matched.requirement.approval_type == approval_type);
            if enabled && !already_required {
                requirements.push(MatchedRequirement {
                    requirement: RequiredApproval { approval_type, required_count: 1 },
                    source: RequirementSource::CompanySetting,
                });
            }
        }

        requirements
    }
}

// Ties on priority fall back to creation time, then id, so storage order never leaks.
fn priority_order(left: &ApprovalRule, right: &ApprovalRule) -> Ordering {
    right
        .priority
        .cmp(&left.priority)
        .then_with(|| left.created_at.cmp(&right.created_at))
        .then_with(|| left.id.0.cmp(&right.id.0))
}

fn rule_matches(rule: &ApprovalRule, context: &PurchaseContext) -> bool {
    rule.conditions.iter().all(|condition| condition_holds(condition, context))
}

fn condition_holds(condition: &RuleCondition, context: &PurchaseContext) -> bool {
    match condition {
        RuleCondition::CartTotalGte { threshold } => context.total >= *threshold,
        RuleCondition::ItemCountGte { threshold } => context.item_count >= *threshold,
        RuleCondition::DayOfWeekIn { days } => {
            context.day_of_week.is_some_and(|day| days.contains(&day))
        }
        RuleCondition::Unreadable { .. } => false,
    }
}

fn requirement_of(rule: &ApprovalRule) -> RequiredApproval {
    RequiredApproval {
        approval_type: rule.required_approval_type,
        required_count: rule.required_approvers_count.max(1),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc, Weekday};
    use rust_decimal::Decimal;

    use super::{RequiredApproval, RequirementSource, RuleMatcher};
    use crate::domain::approval::ApprovalType;
    use crate::domain::purchase::PurchaseContext;
    use crate::domain::rule::{ApprovalRule, NewApprovalRule, RuleCondition, RuleConditions};
    use crate::domain::settings::{ApprovalSettings, CompanyId};

    fn company() -> CompanyId {
        CompanyId("comp-1".to_string())
    }

    fn rule(
        name: &str,
        conditions: Vec<RuleCondition>,
        approval_type: ApprovalType,
        count: u32,
        priority: i32,
    ) -> ApprovalRule {
        ApprovalRule::from_new(
            NewApprovalRule {
                company_id: company(),
                rule_name: name.to_string(),
                conditions: RuleConditions::new(conditions),
                required_approval_type: approval_type,
                required_approvers_count: count,
                priority,
                is_active: true,
                effective_from: None,
                effective_until: None,
            },
            Utc::now(),
        )
    }

    fn total_gte(amount: i64) -> RuleCondition {
        RuleCondition::CartTotalGte { threshold: Decimal::new(amount, 0) }
    }

    fn context(total: i64) -> PurchaseContext {
        PurchaseContext::new(Decimal::new(total, 0), 4)
    }

    #[test]
    fn single_threshold_rule_matches_large_cart() {
        let rules = vec![rule("big", vec![total_gte(10000)], ApprovalType::Admin, 1, 10)];

        let result = RuleMatcher.evaluate(&company(), &rules, &context(15000), Utc::now());

        assert_eq!(
            result,
            vec![RequiredApproval { approval_type: ApprovalType::Admin, required_count: 1 }]
        );
        assert!(RuleMatcher.evaluate(&company(), &rules, &context(9999), Utc::now()).is_empty());
        assert_eq!(RuleMatcher.evaluate(&company(), &rules, &context(10000), Utc::now()).len(), 1);
    }

    #[test]
    fn results_follow_priority_descending_regardless_of_input_order() {
        let rules = vec![
            rule("low", vec![total_gte(100)], ApprovalType::SalesManager, 1, 5),
            rule("high", vec![total_gte(100)], ApprovalType::Admin, 2, 20),
        ];

        let result = RuleMatcher.evaluate(&company(), &rules, &context(500), Utc::now());

        assert_eq!(
            result,
            vec![
                RequiredApproval { approval_type: ApprovalType::Admin, required_count: 2 },
                RequiredApproval { approval_type: ApprovalType::SalesManager, required_count: 1 },
            ]
        );

        let reversed: Vec<ApprovalRule> = rules.into_iter().rev().collect();
        assert_eq!(RuleMatcher.evaluate(&company(), &reversed, &context(500), Utc::now()), result);
    }

    #[test]
    fn missing_day_of_week_makes_dependent_rule_not_match() {
        let rules = vec![rule(
            "weekend big carts",
            vec![
                total_gte(1000),
                RuleCondition::DayOfWeekIn { days: vec![Weekday::Sat, Weekday::Sun] },
            ],
            ApprovalType::Admin,
            1,
            10,
        )];

        assert!(RuleMatcher.evaluate(&company(), &rules, &context(5000), Utc::now()).is_empty());
        let saturday = context(5000).with_day_of_week(Weekday::Sat);
        assert_eq!(RuleMatcher.evaluate(&company(), &rules, &saturday, Utc::now()).len(), 1);
        let monday = context(5000).with_day_of_week(Weekday::Mon);
        assert!(RuleMatcher.evaluate(&company(), &rules, &monday, Utc::now()).is_empty());
    }

    #[test]
    fn unreadable_stored_condition_never_matches() {
        let conditions = RuleConditions::from_json(&serde_json::json!({
            "cart_total_gte": 100,
            "day_of_week": ["someday"],
        }));
        let mut stored = rule("typo", vec![], ApprovalType::Admin, 1, 10);
        stored.conditions = conditions;

        let any_day = context(5000).with_day_of_week(Weekday::Fri);
        assert!(RuleMatcher.evaluate(&company(), &[stored], &any_day, Utc::now()).is_empty());
    }

    #[test]
    fn inactive_and_future_rules_never_contribute() {
        let now = Utc::now();
        let mut inactive = rule("inactive", vec![], ApprovalType::Admin, 1, 10);
        inactive.is_active = false;
        let mut future = rule("future", vec![], ApprovalType::SalesManager, 1, 10);
        future.effective_from = Some(now + Duration::days(1));
        let mut expired = rule("expired", vec![], ApprovalType::SalesManager, 1, 10);
        expired.effective_until = Some(now - Duration::days(1));

        let rules = vec![inactive, future, expired];
        assert!(RuleMatcher.evaluate(&company(), &rules, &context(1_000_000), now).is_empty());
    }

    #[test]
    fn empty_conditions_always_match_and_empty_rule_set_requires_nothing() {
        let rules = vec![rule("always", vec![], ApprovalType::SalesManager, 1, 1)];
        assert_eq!(RuleMatcher.evaluate(&company(), &rules, &context(0), Utc::now()).len(), 1);
        assert!(RuleMatcher.evaluate(&company(), &[], &context(0), Utc::now()).is_empty());
    }

    #[test]
    fn other_company_rules_are_ignored() {
        let mut foreign = rule("foreign", vec![], ApprovalType::Admin, 1, 1);
        foreign.company_id = CompanyId("comp-2".to_string());

        assert!(RuleMatcher.evaluate(&company(), &[foreign], &context(0), Utc::now()).is_empty());
    }

    #[test]
    fn same_type_rules_are_additive() {
        let rules = vec![
            rule("a", vec![total_gte(10)], ApprovalType::Admin, 1, 10),
            rule("b", vec![total_gte(10)], ApprovalType::Admin, 3, 1),
        ];

        let result = RuleMatcher.evaluate(&company(), &rules, &context(100), Utc::now());
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].required_count, 1);
        assert_eq!(result[1].required_count, 3);
    }

    #[test]
    fn equal_priorities_resolve_by_creation_time() {
        let now = Utc::now();
        let mut older = rule("older", vec![], ApprovalType::SalesManager, 1, 7);
        older.created_at = now - Duration::days(2);
        let mut newer = rule("newer", vec![], ApprovalType::Admin, 1, 7);
        newer.created_at = now;

        let result = RuleMatcher.evaluate(&company(), &[newer, older], &context(1), now);
        assert_eq!(result[0].approval_type, ApprovalType::SalesManager);
    }

    #[test]
    fn company_toggles_append_baseline_requirements_once() {
        let mut settings = ApprovalSettings::new(company(), Utc::now());
        settings.requires_admin_approval = true;
        settings.requires_sales_manager_approval = true;
        let rules = vec![rule("big", vec![total_gte(100)], ApprovalType::Admin, 2, 10)];

        let matched =
            RuleMatcher.requirements_with_settings(&settings, &rules, &context(500), Utc::now());

        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].requirement.required_count, 2);
        assert!(matches!(matched[0].source, RequirementSource::Rule { priority: 10, .. }));
        assert_eq!(matched[1].requirement.approval_type, ApprovalType::SalesManager);
        assert_eq!(matched[1].source, RequirementSource::CompanySetting);

        let small =
            RuleMatcher.requirements_with_settings(&settings, &rules, &context(5), Utc::now());
        assert_eq!(small.len(), 2);
        assert!(small.iter().all(|matched| matched.source == RequirementSource::CompanySetting));
    }
}
