use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::{Validate, ValidationError};

use super::{CallerContext, GatewaySelector};
use crate::crypto::{FieldCipher, GatewayCredentials};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateways::GatewayClients;
use crate::models::payment_gateway::missing_requirements;
use crate::models::{CurrencySupport, GatewayProfile, GatewayProvider, PaymentGateway};
use crate::repositories::GatewayStore;

fn validate_provider(provider: &str) -> Result<(), ValidationError> {
    provider.parse::<GatewayProvider>().map(|_| ()).map_err(|msg| {
        let mut err = ValidationError::new("provider");
        err.message = Some(msg.into());
        err
    })
}

fn validate_currencies(currencies: &Vec<CurrencySupport>) -> Result<(), ValidationError> {
    for support in currencies {
        let code = support.currency.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            let mut err = ValidationError::new("currency");
            err.message = Some(format!("'{}' is not a 3-letter ISO currency code", code).into());
            return Err(err);
        }
        if let (Some(min), Some(max)) = (support.min_amount, support.max_amount) {
            if min >= max {
                let mut err = ValidationError::new("currency_limits");
                err.message = Some(format!("{}: min_amount must be less than max_amount", code).into());
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Configuration write for one provider/mode pair. Absent optional fields
/// keep their stored values when the gateway already exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct GatewayConfigInput {
    #[validate(custom = "validate_provider")]
    pub provider: String,
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing)]
    pub webhook_secret: Option<String>,
    #[serde(default, skip_serializing)]
    pub settings: Option<Map<String, Value>>,
    pub priority: Option<i32>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    #[validate(custom = "validate_currencies")]
    pub currencies: Option<Vec<CurrencySupport>>,
}

impl GatewayConfigInput {
    pub fn new(provider: impl Into<String>, test_mode: bool) -> Self {
        Self {
            provider: provider.into(),
            test_mode,
            ..Default::default()
        }
    }

    /// Stored credentials overlaid with whatever this input supplies.
    fn merged_credentials(&self, stored: GatewayCredentials) -> GatewayCredentials {
        let mut merged = stored;
        if let Some(key) = &self.api_key {
            merged.api_key = Some(key.clone());
        }
        if let Some(secret) = &self.webhook_secret {
            merged.webhook_secret = Some(secret.clone());
        }
        if let Some(settings) = &self.settings {
            for (k, v) in settings {
                merged.settings.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

fn default_name(provider: GatewayProvider, test_mode: bool) -> String {
    let base = match provider {
        GatewayProvider::Mollie => "Mollie",
        GatewayProvider::Stripe => "Stripe",
        GatewayProvider::Paypal => "PayPal",
    };
    if test_mode {
        format!("{} (test)", base)
    } else {
        base.to_string()
    }
}

fn sort_by_priority(profiles: &mut [GatewayProfile]) {
    profiles.sort_by(|a, b| {
        b.gateway
            .priority
            .cmp(&a.gateway.priority)
            .then_with(|| a.gateway.name.cmp(&b.gateway.name))
    });
}

/// Gateway registry management: configuration, activation, connectivity.
#[derive(Clone)]
pub struct GatewayConfigService {
    gateways: Arc<dyn GatewayStore>,
    cipher: Arc<FieldCipher>,
    clients: GatewayClients,
    selector: GatewaySelector,
    event_sender: EventSender,
}

impl GatewayConfigService {
    pub fn new(
        gateways: Arc<dyn GatewayStore>,
        cipher: Arc<FieldCipher>,
        clients: GatewayClients,
        event_sender: EventSender,
    ) -> Self {
        let selector = GatewaySelector::new(gateways.clone(), cipher.clone());
        Self {
            gateways,
            cipher,
            clients,
            selector,
            event_sender,
        }
    }

    /// Creates or updates the gateway for (provider, test_mode). Rejects the
    /// write before anything is persisted when required fields are missing
    /// or the amount range is empty.
    #[instrument(skip(self, input, caller), fields(provider = %input.provider, test_mode = input.test_mode, actor = caller.actor()))]
    pub async fn configure_gateway(
        &self,
        input: GatewayConfigInput,
        caller: &CallerContext,
    ) -> Result<GatewayProfile, ServiceError> {
        input.validate()?;
        let provider: GatewayProvider = input
            .provider
            .parse()
            .map_err(ServiceError::ValidationError)?;

        let existing = self
            .gateways
            .find_gateway_by_provider_mode(provider, input.test_mode)
            .await?;

        let mut gateway = match &existing {
            Some(profile) => profile.gateway.clone(),
            None => PaymentGateway::new(default_name(provider, input.test_mode), provider, input.test_mode),
        };

        let min_amount = input.min_amount.unwrap_or(gateway.min_amount);
        let max_amount = input.max_amount.unwrap_or(gateway.max_amount);
        if min_amount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "min_amount must not be negative".to_string(),
            ));
        }
        if min_amount >= max_amount {
            return Err(ServiceError::ValidationError(format!(
                "min_amount ({}) must be less than max_amount ({})",
                min_amount, max_amount
            )));
        }

        let merged = input.merged_credentials(gateway.credentials(&self.cipher));
        let missing = missing_requirements(provider, &merged);
        if !missing.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "{} gateway is missing required configuration: {}",
                provider,
                missing.join(", ")
            )));
        }

        if let Some(name) = &input.name {
            gateway.name = name.trim().to_string();
        }
        if let Some(priority) = input.priority {
            gateway.priority = priority;
        }
        gateway.min_amount = min_amount;
        gateway.max_amount = max_amount;
        gateway.updated_at = Utc::now();

        let settings = input.settings.as_ref().map(|_| &merged.settings);
        gateway.seal_credentials(
            &self.cipher,
            input.api_key.as_deref(),
            input.webhook_secret.as_deref(),
            settings,
        )?;

        let profile = match existing {
            Some(profile) => {
                let saved = self.gateways.update_gateway(&gateway).await?;
                let currencies = match input.currencies {
                    Some(currencies) => self.gateways.replace_currencies(saved.id, currencies).await?,
                    None => profile.currencies,
                };
                info!(gateway_id = saved.id, "Gateway configuration updated");
                GatewayProfile::new(saved, currencies)
            }
            None => {
                let profile = self
                    .gateways
                    .insert_gateway(gateway, input.currencies.unwrap_or_default())
                    .await?;
                info!(gateway_id = profile.id(), "Gateway created");
                profile
            }
        };

        Ok(profile)
    }

    async fn load(&self, id: i64) -> Result<GatewayProfile, ServiceError> {
        self.gateways
            .find_gateway_profile(id)
            .await?
            .filter(|p| !p.gateway.is_deleted())
            .ok_or_else(|| ServiceError::NotFound(format!("Gateway {} not found", id)))
    }

    fn ensure_configured(&self, gateway: &PaymentGateway) -> Result<(), ServiceError> {
        let missing = gateway.missing_requirements(&self.cipher);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::GatewayNotConfigured(format!(
                "gateway '{}' ({}) is missing: {}",
                gateway.name,
                gateway.provider,
                missing.join(", ")
            )))
        }
    }

    /// Turns a configured gateway on. Repeating it is a no-op.
    #[instrument(skip(self, caller), fields(actor = caller.actor()))]
    pub async fn activate_gateway(
        &self,
        id: i64,
        caller: &CallerContext,
    ) -> Result<PaymentGateway, ServiceError> {
        let profile = self.load(id).await?;
        self.ensure_configured(&profile.gateway)?;
        if profile.gateway.is_active {
            return Ok(profile.gateway);
        }

        let mut gateway = profile.gateway;
        gateway.is_active = true;
        let saved = self.gateways.update_gateway(&gateway).await?;
        info!(gateway_id = id, provider = %saved.provider, "Gateway activated");
        self.event_sender
            .send_or_log(Event::GatewayActivated {
                gateway_id: id,
                provider: saved.provider.to_string(),
            })
            .await;
        Ok(saved)
    }

    /// Turns a gateway off. Repeating it is a no-op.
    #[instrument(skip(self, caller), fields(actor = caller.actor()))]
    pub async fn deactivate_gateway(
        &self,
        id: i64,
        caller: &CallerContext,
    ) -> Result<PaymentGateway, ServiceError> {
        let profile = self.load(id).await?;
        if !profile.gateway.is_active {
            return Ok(profile.gateway);
        }

        let mut gateway = profile.gateway;
        gateway.is_active = false;
        let saved = self.gateways.update_gateway(&gateway).await?;
        info!(gateway_id = id, provider = %saved.provider, "Gateway deactivated");
        self.event_sender
            .send_or_log(Event::GatewayDeactivated {
                gateway_id: id,
                provider: saved.provider.to_string(),
            })
            .await;
        Ok(saved)
    }

    /// Logically removes a gateway; it stops being listed or selected.
    #[instrument(skip(self, caller), fields(actor = caller.actor()))]
    pub async fn delete_gateway(&self, id: i64, caller: &CallerContext) -> Result<(), ServiceError> {
        let mut gateway = self.load(id).await?.gateway;
        gateway.is_active = false;
        gateway.deleted_at = Some(Utc::now());
        self.gateways.update_gateway(&gateway).await?;
        info!(gateway_id = id, "Gateway deleted");
        Ok(())
    }

    /// Asks the provider whether the stored credentials work.
    #[instrument(skip(self))]
    pub async fn test_connection(&self, id: i64) -> Result<bool, ServiceError> {
        let profile = self.load(id).await?;
        self.ensure_configured(&profile.gateway)?;
        let credentials = profile.gateway.credentials(&self.cipher);
        let ok = self
            .clients
            .test_connection(profile.gateway.provider.as_str(), &credentials)
            .await?;
        if !ok {
            warn!(gateway_id = id, "Gateway rejected stored credentials");
        }
        Ok(ok)
    }

    pub async fn get_active_gateways(&self) -> Result<Vec<GatewayProfile>, ServiceError> {
        let mut profiles = self.gateways.list_gateway_profiles(true).await?;
        sort_by_priority(&mut profiles);
        Ok(profiles)
    }

    pub async fn list_gateways(&self) -> Result<Vec<GatewayProfile>, ServiceError> {
        let mut profiles = self.gateways.list_gateway_profiles(false).await?;
        sort_by_priority(&mut profiles);
        Ok(profiles)
    }

    pub async fn find_best_gateway(
        &self,
        amount: Decimal,
        currency: &str,
    ) -> Result<Option<GatewayProfile>, ServiceError> {
        self.selector.find_best_gateway(amount, currency).await
    }

    /// Fee for `amount` through gateway `id`, if it supports the currency.
    pub async fn calculate_fee(
        &self,
        id: i64,
        amount: Decimal,
        currency: &str,
    ) -> Result<Option<Decimal>, ServiceError> {
        Ok(self.load(id).await?.calculate_fee(amount, currency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_provider() {
        let input = GatewayConfigInput::new("adyen", false);
        let errors = input.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("provider"));
    }

    #[test]
    fn rejects_bad_currency_code() {
        let mut input = GatewayConfigInput::new("mollie", false);
        input.currencies = Some(vec![CurrencySupport::new("EURO")]);
        assert!(input.validate().is_err());
    }

    #[test]
    fn merges_supplied_credentials_over_stored() {
        let mut input = GatewayConfigInput::new("paypal", false);
        let mut settings = Map::new();
        settings.insert("client_id".into(), Value::String("AZ".into()));
        input.settings = Some(settings);

        let mut stored = GatewayCredentials {
            api_key: Some("old".into()),
            ..Default::default()
        };
        stored.settings.insert("mode".into(), Value::String("live".into()));

        let merged = input.merged_credentials(stored);
        assert_eq!(merged.api_key.as_deref(), Some("old"));
        assert_eq!(merged.setting_str("client_id"), Some("AZ"));
        assert_eq!(merged.setting_str("mode"), Some("live"));
    }
}
