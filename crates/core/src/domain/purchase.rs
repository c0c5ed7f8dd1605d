use chrono::Weekday;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Facts about a pending purchase that rule conditions are evaluated against.
///
/// Optional inputs left as `None` make every condition that depends on them fail to match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseContext {
    pub total: Decimal,
    pub item_count: u32,
    pub day_of_week: Option<Weekday>,
}

impl PurchaseContext {
    pub fn new(total: Decimal, item_count: u32) -> Self {
        Self { total, item_count, day_of_week: None }
    }

    pub fn with_day_of_week(mut self, day_of_week: Weekday) -> Self {
        self.day_of_week = Some(day_of_week);
        self
    }
}
