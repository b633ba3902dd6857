use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::donation::CounterDelta;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "campaigns")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub title: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub goal_amount: Decimal,
    pub currency: String,
    /// Number of donations currently in COMPLETED status
    pub donations_count: i64,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub amount_raised: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::donation::Entity")]
    Donations,
}

impl Related<super::donation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Donations.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn new(title: impl Into<String>, goal_amount: Decimal, currency: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            title: title.into(),
            goal_amount,
            currency: currency.into(),
            donations_count: 0,
            amount_raised: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply_delta(&mut self, delta: CounterDelta) {
        self.donations_count += delta.count;
        self.amount_raised += delta.amount;
        self.updated_at = Utc::now();
    }

    pub fn progress_percentage(&self) -> Decimal {
        if self.goal_amount.is_zero() {
            return Decimal::ZERO;
        }
        (self.amount_raised / self.goal_amount * Decimal::from(100)).round_dp(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn applies_counter_delta() {
        let mut campaign = Model::new("Clean water", dec!(1000), "EUR");
        campaign.apply_delta(CounterDelta {
            count: 1,
            amount: dec!(250),
        });
        assert_eq!(campaign.donations_count, 1);
        assert_eq!(campaign.amount_raised, dec!(250));
        assert_eq!(campaign.progress_percentage(), dec!(25));

        campaign.apply_delta(CounterDelta {
            count: -1,
            amount: dec!(-250),
        });
        assert_eq!(campaign.donations_count, 0);
        assert_eq!(campaign.amount_raised, Decimal::ZERO);
    }
}
