use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::crypto::FieldCipher;
use crate::errors::ServiceError;
use crate::models::GatewayProfile;
use crate::repositories::GatewayStore;

/// Read-only eligibility queries over the gateway registry.
#[derive(Clone)]
pub struct GatewaySelector {
    gateways: Arc<dyn GatewayStore>,
    cipher: Arc<FieldCipher>,
}

impl GatewaySelector {
    pub fn new(gateways: Arc<dyn GatewayStore>, cipher: Arc<FieldCipher>) -> Self {
        Self { gateways, cipher }
    }

    /// Active, configured gateways accepting `amount` in `currency`, best
    /// first: priority descending, then name ascending. Empty for a
    /// non-positive amount.
    #[instrument(skip(self, amount), fields(amount = %amount))]
    pub async fn find_eligible_gateways(
        &self,
        amount: Decimal,
        currency: &str,
    ) -> Result<Vec<GatewayProfile>, ServiceError> {
        if amount <= Decimal::ZERO {
            debug!("Non-positive amount, no gateway is eligible");
            return Ok(Vec::new());
        }

        let mut eligible: Vec<GatewayProfile> = self
            .gateways
            .list_gateway_profiles(true)
            .await?
            .into_iter()
            .filter(|p| p.can_process_payment(amount, currency, &self.cipher))
            .collect();

        eligible.sort_by(|a, b| {
            b.gateway
                .priority
                .cmp(&a.gateway.priority)
                .then_with(|| a.gateway.name.cmp(&b.gateway.name))
        });

        debug!(count = eligible.len(), "Eligible gateways found");
        Ok(eligible)
    }

    /// The first eligible gateway that still qualifies when re-read from the
    /// store. `None` when nothing qualifies.
    #[instrument(skip(self, amount), fields(amount = %amount))]
    pub async fn find_best_gateway(
        &self,
        amount: Decimal,
        currency: &str,
    ) -> Result<Option<GatewayProfile>, ServiceError> {
        for candidate in self.find_eligible_gateways(amount, currency).await? {
            match self.gateways.find_gateway_profile(candidate.id()).await? {
                Some(fresh) if fresh.can_process_payment(amount, currency, &self.cipher) => {
                    return Ok(Some(fresh));
                }
                _ => {
                    warn!(
                        gateway_id = candidate.id(),
                        "Gateway changed since listing, skipping"
                    );
                }
            }
        }

        debug!(currency, "No gateway can process this payment");
        Ok(None)
    }
}
