use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::gateway_currency;
use super::status::GatewayProvider;
use crate::crypto::{FieldCipher, GatewayCredentials};
use crate::errors::ServiceError;

/// Gateway configuration for one provider in one mode. Secret columns hold
/// sealed values and are only opened through [`Model::credentials`].
#[derive(Clone, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_gateways")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub provider: GatewayProvider,
    pub is_active: bool,
    #[serde(skip_serializing)]
    pub api_key_encrypted: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_secret_encrypted: Option<String>,
    #[serde(skip_serializing)]
    pub settings_encrypted: Option<String>,
    /// Higher wins during selection
    pub priority: i32,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub min_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub max_amount: Decimal,
    pub test_mode: bool,
    /// Optimistic lock for configuration writes
    pub lock_version: i32,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentGateway")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("is_active", &self.is_active)
            .field("priority", &self.priority)
            .field("min_amount", &self.min_amount)
            .field("max_amount", &self.max_amount)
            .field("test_mode", &self.test_mode)
            .field("lock_version", &self.lock_version)
            .finish_non_exhaustive()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::gateway_currency::Entity")]
    Currencies,
}

impl Related<super::gateway_currency::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Currencies.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Requirements a provider needs before it may be activated, given the
/// credentials currently available. Empty means configured.
pub fn missing_requirements(
    provider: GatewayProvider,
    credentials: &GatewayCredentials,
) -> Vec<&'static str> {
    let mut missing = Vec::new();
    let has_api_key = credentials
        .api_key
        .as_deref()
        .map_or(false, |k| !k.trim().is_empty());
    if !has_api_key {
        missing.push("api_key");
    }
    match provider {
        GatewayProvider::Stripe => {
            let has_secret = credentials
                .webhook_secret
                .as_deref()
                .map_or(false, |s| !s.trim().is_empty());
            if !has_secret {
                missing.push("webhook_secret");
            }
        }
        GatewayProvider::Paypal => {
            if credentials.setting_str("client_id").is_none() {
                missing.push("client_id");
            }
        }
        GatewayProvider::Mollie => {}
    }
    missing
}

impl Model {
    pub fn new(name: impl Into<String>, provider: GatewayProvider, test_mode: bool) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            provider,
            is_active: false,
            api_key_encrypted: None,
            webhook_secret_encrypted: None,
            settings_encrypted: None,
            priority: 0,
            min_amount: Decimal::ONE,
            max_amount: Decimal::from(10_000),
            test_mode,
            lock_version: 0,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Opens every sealed column. Values that fail to open are treated as absent.
    pub fn credentials(&self, cipher: &FieldCipher) -> GatewayCredentials {
        let settings = cipher
            .open_stored(self.settings_encrypted.as_deref())
            .and_then(|raw| match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(serde_json::Value::Object(map)) => Some(map),
                Ok(_) | Err(_) => {
                    warn!(gateway_id = self.id, "Gateway settings are not a JSON object");
                    None
                }
            })
            .unwrap_or_default();

        GatewayCredentials {
            api_key: cipher.open_stored(self.api_key_encrypted.as_deref()),
            webhook_secret: cipher.open_stored(self.webhook_secret_encrypted.as_deref()),
            settings,
        }
    }

    /// Seals and stores the given credentials. `None` leaves a column untouched.
    pub fn seal_credentials(
        &mut self,
        cipher: &FieldCipher,
        api_key: Option<&str>,
        webhook_secret: Option<&str>,
        settings: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<(), ServiceError> {
        if let Some(key) = api_key {
            self.api_key_encrypted = Some(cipher.seal(key)?.into_inner());
        }
        if let Some(secret) = webhook_secret {
            self.webhook_secret_encrypted = Some(cipher.seal(secret)?.into_inner());
        }
        if let Some(settings) = settings {
            let raw = serde_json::to_string(settings)?;
            self.settings_encrypted = Some(cipher.seal(&raw)?.into_inner());
        }
        Ok(())
    }

    pub fn missing_requirements(&self, cipher: &FieldCipher) -> Vec<&'static str> {
        missing_requirements(self.provider, &self.credentials(cipher))
    }

    pub fn is_configured(&self, cipher: &FieldCipher) -> bool {
        self.missing_requirements(cipher).is_empty()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A gateway together with its currency rows; the unit the selector works on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayProfile {
    pub gateway: Model,
    pub currencies: Vec<gateway_currency::Model>,
}

impl GatewayProfile {
    pub fn new(gateway: Model, currencies: Vec<gateway_currency::Model>) -> Self {
        Self {
            gateway,
            currencies,
        }
    }

    pub fn id(&self) -> i64 {
        self.gateway.id
    }

    /// The active currency row for `currency`, if the gateway supports it.
    pub fn currency(&self, currency: &str) -> Option<&gateway_currency::Model> {
        self.currencies
            .iter()
            .find(|c| c.is_active && c.matches(currency))
    }

    pub fn supports_currency(&self, currency: &str) -> bool {
        self.currency(currency).is_some()
    }

    /// Currency and amount rules alone, without credentials.
    pub fn accepts(&self, amount: Decimal, currency: &str) -> bool {
        match self.currency(currency) {
            Some(row) => {
                let (min, max) = row.limits(self.gateway.min_amount, self.gateway.max_amount);
                min <= amount && amount <= max
            }
            None => false,
        }
    }

    /// Full eligibility: live, configured, supports the currency and the amount.
    pub fn can_process_payment(&self, amount: Decimal, currency: &str, cipher: &FieldCipher) -> bool {
        self.gateway.is_active
            && !self.gateway.is_deleted()
            && self.accepts(amount, currency)
            && self.gateway.is_configured(cipher)
    }

    pub fn calculate_fee(&self, amount: Decimal, currency: &str) -> Option<Decimal> {
        self.currency(currency).map(|row| row.calculate_fee(amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::gateway_currency::CurrencySupport;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn cipher() -> FieldCipher {
        FieldCipher::new(&[3u8; 32]).unwrap()
    }

    fn stripe(cipher: &FieldCipher) -> Model {
        let mut g = Model::new("Stripe", GatewayProvider::Stripe, true);
        g.id = 1;
        g.seal_credentials(cipher, Some("sk_test"), Some("whsec"), None)
            .unwrap();
        g.is_active = true;
        g
    }

    #[test]
    fn provider_requirements() {
        let creds = GatewayCredentials {
            api_key: Some("key".into()),
            ..Default::default()
        };
        assert_eq!(
            missing_requirements(GatewayProvider::Stripe, &creds),
            vec!["webhook_secret"]
        );
        assert!(missing_requirements(GatewayProvider::Mollie, &creds).is_empty());
        assert_eq!(
            missing_requirements(GatewayProvider::Paypal, &creds),
            vec!["client_id"]
        );

        let mut settings = serde_json::Map::new();
        settings.insert("client_id".into(), json!("AZ123"));
        let paypal = GatewayCredentials {
            settings,
            ..creds
        };
        assert!(missing_requirements(GatewayProvider::Paypal, &paypal).is_empty());
    }

    #[test]
    fn credentials_are_sealed_at_rest() {
        let c = cipher();
        let g = stripe(&c);
        assert_ne!(g.api_key_encrypted.as_deref(), Some("sk_test"));
        assert_eq!(g.credentials(&c).api_key.as_deref(), Some("sk_test"));
        assert!(g.is_configured(&c));
    }

    #[test]
    fn unreadable_secret_counts_as_missing() {
        let c = cipher();
        let g = stripe(&c);
        let rotated = FieldCipher::new(&[4u8; 32]).unwrap();
        assert!(!g.is_configured(&rotated));
        assert_eq!(g.missing_requirements(&rotated), vec!["api_key", "webhook_secret"]);
    }

    #[test]
    fn profile_eligibility_uses_currency_rows() {
        let c = cipher();
        let g = stripe(&c);
        let mut usd = CurrencySupport::new("USD").into_model(1);
        usd.max_amount = Some(dec!(200));
        let mut gbp = CurrencySupport::new("GBP").into_model(1);
        gbp.is_active = false;
        let profile = GatewayProfile::new(g, vec![CurrencySupport::new("EUR").into_model(1), usd, gbp]);

        assert!(profile.can_process_payment(dec!(500), "EUR", &c));
        assert!(!profile.can_process_payment(dec!(500), "USD", &c));
        assert!(profile.can_process_payment(dec!(150), "usd", &c));
        assert!(!profile.can_process_payment(dec!(10), "GBP", &c));
        assert!(!profile.can_process_payment(dec!(0.5), "EUR", &c));
        assert!(!profile.can_process_payment(dec!(10), "CHF", &c));
    }

    #[test]
    fn inactive_gateway_is_not_eligible() {
        let c = cipher();
        let mut g = stripe(&c);
        g.is_active = false;
        let profile = GatewayProfile::new(g, vec![CurrencySupport::new("EUR").into_model(1)]);
        assert!(!profile.can_process_payment(dec!(10), "EUR", &c));
    }

    #[test]
    fn debug_hides_sealed_columns() {
        let c = cipher();
        let g = stripe(&c);
        let sealed = g.api_key_encrypted.clone().unwrap();
        assert!(!format!("{:?}", g).contains(&sealed));
    }
}
