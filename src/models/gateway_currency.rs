use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-currency support row for a gateway, optionally overriding its limits.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_gateway_currencies")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub gateway_id: i64,
    /// ISO 4217, upper case
    pub currency: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))", nullable)]
    pub min_amount: Option<Decimal>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))", nullable)]
    pub max_amount: Option<Decimal>,
    /// Fraction of the amount, e.g. 0.029 for 2.9%
    #[sea_orm(column_type = "Decimal(Some((7, 6)))")]
    pub fee_percentage: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub fee_fixed: Decimal,
    pub is_active: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::payment_gateway::Entity",
        from = "Column::GatewayId",
        to = "super::payment_gateway::Column::Id"
    )]
    Gateway,
}

impl Related<super::payment_gateway::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Gateway.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Currency support as supplied by configuration, before ids are known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencySupport {
    pub currency: String,
    #[serde(default)]
    pub min_amount: Option<Decimal>,
    #[serde(default)]
    pub max_amount: Option<Decimal>,
    #[serde(default)]
    pub fee_percentage: Decimal,
    #[serde(default)]
    pub fee_fixed: Decimal,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl CurrencySupport {
    pub fn new(currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            min_amount: None,
            max_amount: None,
            fee_percentage: Decimal::ZERO,
            fee_fixed: Decimal::ZERO,
            is_active: true,
        }
    }

    pub fn into_model(self, gateway_id: i64) -> Model {
        Model {
            id: 0,
            gateway_id,
            currency: self.currency.trim().to_ascii_uppercase(),
            min_amount: self.min_amount,
            max_amount: self.max_amount,
            fee_percentage: self.fee_percentage,
            fee_fixed: self.fee_fixed,
            is_active: self.is_active,
        }
    }
}

impl Model {
    pub fn matches(&self, currency: &str) -> bool {
        self.currency.eq_ignore_ascii_case(currency.trim())
    }

    /// Effective amount bounds: the row's overrides, else the gateway's.
    pub fn limits(&self, gateway_min: Decimal, gateway_max: Decimal) -> (Decimal, Decimal) {
        (
            self.min_amount.unwrap_or(gateway_min),
            self.max_amount.unwrap_or(gateway_max),
        )
    }

    pub fn calculate_fee(&self, amount: Decimal) -> Decimal {
        (amount * self.fee_percentage + self.fee_fixed).round_dp(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn overrides_take_precedence_over_gateway_limits() {
        let mut row = CurrencySupport::new("eur").into_model(1);
        assert_eq!(row.currency, "EUR");
        assert_eq!(row.limits(dec!(1), dec!(100)), (dec!(1), dec!(100)));

        row.max_amount = Some(dec!(50));
        assert_eq!(row.limits(dec!(1), dec!(100)), (dec!(1), dec!(50)));
        assert!(row.matches("Eur"));
    }

    #[test]
    fn fee_is_percentage_plus_fixed() {
        let mut row = CurrencySupport::new("EUR").into_model(1);
        row.fee_percentage = dec!(0.029);
        row.fee_fixed = dec!(0.25);
        assert_eq!(row.calculate_fee(dec!(100)), dec!(3.15));
    }
}
