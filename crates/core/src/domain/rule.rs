use std::str::FromStr;

use chrono::{DateTime, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::approval::ApprovalType;
use crate::domain::settings::CompanyId;

pub const CART_TOTAL_GTE: &str = "cart_total_gte";
pub const ITEM_COUNT_GTE: &str = "item_count_gte";
pub const DAY_OF_WEEK: &str = "day_of_week";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalRuleId(pub String);

impl ApprovalRuleId {
    pub fn generate() -> Self {
        Self(format!("RULE-{}", Uuid::new_v4()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    CartTotalGte { threshold: Decimal },
    ItemCountGte { threshold: u32 },
    DayOfWeekIn { days: Vec<Weekday> },
    /// A known key whose stored value could not be read. Never matches.
    Unreadable { key: String, raw: String },
}

impl RuleCondition {
    pub fn key(&self) -> &str {
        match self {
            Self::CartTotalGte { .. } => CART_TOTAL_GTE,
            Self::ItemCountGte { .. } => ITEM_COUNT_GTE,
            Self::DayOfWeekIn { .. } => DAY_OF_WEEK,
            Self::Unreadable { key, .. } => key,
        }
    }

    fn unreadable(key: &str, value: &Value) -> Self {
        Self::Unreadable { key: key.to_string(), raw: value.to_string() }
    }
}

/// Conjunction of conditions declared on a rule. Empty means "always matches".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConditions(pub Vec<RuleCondition>);

impl RuleConditions {
    pub fn new(conditions: Vec<RuleCondition>) -> Self {
        Self(conditions)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleCondition> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses the stored `{key: value}` object. Unknown keys are dropped; a known key with a
    /// value that cannot be read is kept as [`RuleCondition::Unreadable`].
    pub fn from_json(value: &Value) -> Self {
        match value.as_object() {
            Some(map) => Self::from_map(map),
            None => Self::default(),
        }
    }

    pub fn from_map(map: &Map<String, Value>) -> Self {
        let conditions = map
            .iter()
            .filter_map(|(key, value)| {
                let key = key.trim().to_ascii_lowercase();
                let parsed = match key.as_str() {
                    CART_TOTAL_GTE => parse_decimal(value)
                        .map(|threshold| RuleCondition::CartTotalGte { threshold }),
                    ITEM_COUNT_GTE => value
                        .as_u64()
                        .and_then(|raw| u32::try_from(raw).ok())
                        .map(|threshold| RuleCondition::ItemCountGte { threshold }),
                    DAY_OF_WEEK => {
                        parse_days(value).map(|days| RuleCondition::DayOfWeekIn { days })
                    }
                    _ => return None,
                };
                Some(parsed.unwrap_or_else(|| RuleCondition::unreadable(&key, value)))
            })
            .collect();

        Self(conditions)
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for condition in &self.0 {
            let value = match condition {
                RuleCondition::CartTotalGte { threshold } => Value::String(threshold.to_string()),
                RuleCondition::ItemCountGte { threshold } => Value::from(*threshold),
                RuleCondition::DayOfWeekIn { days } => Value::Array(
                    days.iter()
                        .map(|day| Value::String(day.to_string().to_ascii_lowercase()))
                        .collect(),
                ),
                RuleCondition::Unreadable { raw, .. } => serde_json::from_str(raw)
                    .unwrap_or_else(|_| Value::String(raw.clone())),
            };
            map.insert(condition.key().to_string(), value);
        }
        Value::Object(map)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: ApprovalRuleId,
    pub company_id: CompanyId,
    pub rule_name: String,
    pub conditions: RuleConditions,
    pub required_approval_type: ApprovalType,
    pub required_approvers_count: u32,
    pub priority: i32,
    pub is_active: bool,
    pub effective_from: Option<DateTime<Utc>>,
    pub effective_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRule {
    pub fn from_new(input: NewApprovalRule, now: DateTime<Utc>) -> Self {
        Self {
            id: ApprovalRuleId::generate(),
            company_id: input.company_id,
            rule_name: input.rule_name,
            conditions: input.conditions,
            required_approval_type: input.required_approval_type,
            required_approvers_count: input.required_approvers_count.max(1),
            priority: input.priority,
            is_active: input.is_active,
            effective_from: input.effective_from,
            effective_until: input.effective_until,
            created_at: now,
            updated_at: now,
        }
    }

    /// Active and inside the inclusive `[effective_from, effective_until]` window.
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        if self.effective_from.is_some_and(|from| now < from) {
            return false;
        }
        if self.effective_until.is_some_and(|until| now > until) {
            return false;
        }
        true
    }

    pub fn apply(&mut self, update: ApprovalRuleUpdate, now: DateTime<Utc>) {
        if let Some(rule_name) = update.rule_name {
            self.rule_name = rule_name;
        }
        if let Some(conditions) = update.conditions {
            self.conditions = conditions;
        }
        if let Some(approval_type) = update.required_approval_type {
            self.required_approval_type = approval_type;
        }
        if let Some(count) = update.required_approvers_count {
            self.required_approvers_count = count.max(1);
        }
        if let Some(priority) = update.priority {
            self.priority = priority;
        }
        if let Some(is_active) = update.is_active {
            self.is_active = is_active;
        }
        if let Some(effective_from) = update.effective_from {
            self.effective_from = effective_from;
        }
        if let Some(effective_until) = update.effective_until {
            self.effective_until = effective_until;
        }
        self.updated_at = now;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewApprovalRule {
    pub company_id: CompanyId,
    pub rule_name: String,
    pub conditions: RuleConditions,
    pub required_approval_type: ApprovalType,
    pub required_approvers_count: u32,
    pub priority: i32,
    pub is_active: bool,
    pub effective_from: Option<DateTime<Utc>>,
    pub effective_until: Option<DateTime<Utc>>,
}

/// Partial update. The nested options on the window fields distinguish "leave" from "clear".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRuleUpdate {
    pub rule_name: Option<String>,
    pub conditions: Option<RuleConditions>,
    pub required_approval_type: Option<ApprovalType>,
    pub required_approvers_count: Option<u32>,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
    pub effective_from: Option<Option<DateTime<Utc>>>,
    pub effective_until: Option<Option<DateTime<Utc>>>,
}

fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => Decimal::from_str(&number.to_string())
            .or_else(|_| Decimal::from_scientific(&number.to_string()))
            .ok(),
        Value::String(raw) => Decimal::from_str(raw.trim()).ok(),
        _ => None,
    }
}

// Every listed day must parse; a partly readable list is not narrowed silently.
fn parse_days(value: &Value) -> Option<Vec<Weekday>> {
    let mut days: Vec<Weekday> = match value {
        Value::Array(items) => items.iter().map(parse_weekday).collect::<Option<Vec<_>>>()?,
        single => vec![parse_weekday(single)?],
    };
    if days.is_empty() {
        return None;
    }
    days.sort_by_key(Weekday::num_days_from_sunday);
    days.dedup();
    Some(days)
}

// Integer codes count from Sunday = 0.
fn parse_weekday(value: &Value) -> Option<Weekday> {
    match value {
        Value::Number(number) => match number.as_u64()? {
            0 => Some(Weekday::Sun),
            1 => Some(Weekday::Mon),
            2 => Some(Weekday::Tue),
            3 => Some(Weekday::Wed),
            4 => Some(Weekday::Thu),
            5 => Some(Weekday::Fri),
            6 => Some(Weekday::Sat),
            _ => None,
        },
        Value::String(raw) => Weekday::from_str(raw.trim()).ok(),
        _ => None,
    }
}
