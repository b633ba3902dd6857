use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::{Validate, ValidationError};

use super::CallerContext;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::{Campaign, Donation, DonationStatus};
use crate::repositories::{CampaignStore, DonationStore};

const RECURRING_FREQUENCIES: &[&str] = &["weekly", "monthly", "quarterly", "yearly"];

fn validate_positive_amount(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount must be greater than 0".into());
        Err(err)
    }
}

fn validate_currency(currency: &str) -> Result<(), ValidationError> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency");
        err.message = Some("Currency must be a 3-letter ISO code".into());
        Err(err)
    }
}

fn validate_frequency(frequency: &str) -> Result<(), ValidationError> {
    if RECURRING_FREQUENCIES.contains(&frequency) {
        Ok(())
    } else {
        let mut err = ValidationError::new("recurring_frequency");
        err.message = Some("Frequency must be weekly, monthly, quarterly or yearly".into());
        Err(err)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateDonationRequest {
    pub campaign_id: i64,
    pub donor_id: Option<i64>,
    #[validate(custom = "validate_positive_amount")]
    pub amount: Decimal,
    #[validate(custom = "validate_currency")]
    pub currency: String,
    #[validate(length(min = 1, max = 50))]
    pub payment_method: String,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub is_recurring: bool,
    #[validate(custom = "validate_frequency")]
    pub recurring_frequency: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Donor-facing pledges and the campaign counters derived from them.
#[derive(Clone)]
pub struct DonationService {
    campaigns: Arc<dyn CampaignStore>,
    donations: Arc<dyn DonationStore>,
    event_sender: EventSender,
}

impl DonationService {
    pub fn new(
        campaigns: Arc<dyn CampaignStore>,
        donations: Arc<dyn DonationStore>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            campaigns,
            donations,
            event_sender,
        }
    }

    pub async fn create_campaign(
        &self,
        title: &str,
        goal_amount: Decimal,
        currency: &str,
    ) -> Result<Campaign, ServiceError> {
        validate_currency(currency).map_err(|_| {
            ServiceError::ValidationError(format!("'{}' is not a 3-letter ISO currency code", currency))
        })?;
        self.campaigns
            .insert_campaign(Campaign::new(title, goal_amount, currency.to_ascii_uppercase()))
            .await
    }

    pub async fn get_campaign(&self, id: i64) -> Result<Campaign, ServiceError> {
        self.campaigns
            .find_campaign(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Campaign {} not found", id)))
    }

    #[instrument(skip(self, request, caller), fields(campaign_id = request.campaign_id, actor = caller.actor()))]
    pub async fn create_donation(
        &self,
        request: CreateDonationRequest,
        caller: &CallerContext,
    ) -> Result<Donation, ServiceError> {
        request.validate()?;
        if request.is_recurring && request.recurring_frequency.is_none() {
            return Err(ServiceError::ValidationError(
                "Recurring donations need a recurring_frequency".to_string(),
            ));
        }
        self.get_campaign(request.campaign_id).await?;

        let mut donation = Donation::new(
            request.campaign_id,
            request.amount,
            request.currency.to_ascii_uppercase(),
            request.payment_method,
        );
        donation.donor_id = if request.is_anonymous {
            None
        } else {
            request.donor_id
        };
        donation.is_anonymous = request.is_anonymous || request.donor_id.is_none();
        donation.is_recurring = request.is_recurring;
        donation.recurring_frequency = request.recurring_frequency.filter(|_| request.is_recurring);
        donation.metadata = request.metadata;

        let saved = self.donations.insert_donation(donation).await?;
        info!(donation_id = saved.id, amount = %saved.amount, "Donation created");
        Ok(saved)
    }

    pub async fn get_donation(&self, id: i64) -> Result<Donation, ServiceError> {
        self.donations
            .find_donation(id)
            .await?
            .filter(|d| !d.is_deleted())
            .ok_or_else(|| ServiceError::NotFound(format!("Donation {} not found", id)))
    }

    /// Changes the amount of a PENDING donation.
    pub async fn update_amount(&self, id: i64, amount: Decimal) -> Result<Donation, ServiceError> {
        let mut donation = self.get_donation(id).await?;
        let status = donation.status;
        donation.set_amount(amount)?;
        self.donations
            .save_with_counter(&donation, status, Default::default())
            .await
    }

    /// Applies a status outside the webhook path, e.g. an operator marking a
    /// bank transfer as received. Counters follow the same rules.
    #[instrument(skip(self, caller), fields(actor = caller.actor()))]
    pub async fn update_status(
        &self,
        id: i64,
        status: DonationStatus,
        reason: Option<String>,
        caller: &CallerContext,
    ) -> Result<Donation, ServiceError> {
        let mut donation = self.get_donation(id).await?;
        let change = donation.apply_status(status, reason, Utc::now());
        if change.is_noop() {
            return Ok(donation);
        }

        let saved = self
            .donations
            .save_with_counter(&donation, change.from, change.delta)
            .await?;
        self.event_sender
            .send_or_log(Event::DonationStatusChanged {
                donation_id: saved.id,
                campaign_id: saved.campaign_id,
                old_status: change.from,
                new_status: change.to,
            })
            .await;
        if change.to == DonationStatus::Completed {
            self.event_sender
                .send_or_log(Event::DonationCompleted {
                    donation_id: saved.id,
                    campaign_id: saved.campaign_id,
                    amount: saved.amount,
                    currency: saved.currency.clone(),
                })
                .await;
        }
        Ok(saved)
    }

    /// Logically removes a donation; a COMPLETED one is taken off its
    /// campaign's counters.
    #[instrument(skip(self, caller), fields(actor = caller.actor()))]
    pub async fn delete_donation(&self, id: i64, caller: &CallerContext) -> Result<(), ServiceError> {
        let Some(mut donation) = self.donations.find_donation(id).await? else {
            return Err(ServiceError::NotFound(format!("Donation {} not found", id)));
        };
        if donation.is_deleted() {
            warn!(donation_id = id, "Donation already deleted");
            return Ok(());
        }

        let status = donation.status;
        let delta = donation.soft_delete(Utc::now());
        self.donations
            .save_with_counter(&donation, status, delta)
            .await?;
        info!(donation_id = id, counter_delta = delta.count, "Donation deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> CreateDonationRequest {
        CreateDonationRequest {
            campaign_id: 1,
            donor_id: Some(9),
            amount: dec!(10),
            currency: "EUR".into(),
            payment_method: "card".into(),
            is_anonymous: false,
            is_recurring: false,
            recurring_frequency: None,
            metadata: None,
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_amount_and_bad_currency() {
        let mut r = request();
        r.amount = dec!(0);
        r.currency = "EURO".into();
        let errors = r.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("amount"));
        assert!(fields.contains_key("currency"));
    }

    #[test]
    fn rejects_unknown_frequency() {
        let mut r = request();
        r.is_recurring = true;
        r.recurring_frequency = Some("daily".into());
        assert!(r.validate().is_err());
    }
}
