use metrics::counter;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use super::{AttemptResult, AttemptTrailService, CallerContext};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateways::GatewayClients;
use crate::models::{DonationStatus, FailureDetail, GatewayProfile, Payment};
use crate::repositories::{DonationStore, KeyedLocks, PaymentStore};

/// Error code recorded when a gateway call never produced a response.
pub const CONNECTION_FAILURE_CODE: &str = "gateway_connection_failure";

/// A gateway response as seen by the caller: the value it needs plus what
/// goes into the attempt trail.
#[derive(Debug, Clone)]
pub struct GatewayReply<T> {
    pub value: T,
    pub result: AttemptResult,
}

/// Drives payments through their lifecycle and records every gateway call.
#[derive(Clone)]
pub struct PaymentService {
    payments: Arc<dyn PaymentStore>,
    donations: Arc<dyn DonationStore>,
    trail: AttemptTrailService,
    clients: GatewayClients,
    payment_locks: KeyedLocks,
    donation_locks: KeyedLocks,
    event_sender: EventSender,
}

impl PaymentService {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        donations: Arc<dyn DonationStore>,
        trail: AttemptTrailService,
        clients: GatewayClients,
        payment_locks: KeyedLocks,
        event_sender: EventSender,
    ) -> Self {
        Self {
            payments,
            donations,
            trail,
            clients,
            payment_locks,
            donation_locks: KeyedLocks::new(),
            event_sender,
        }
    }

    pub async fn get_payment(&self, id: i64) -> Result<Payment, ServiceError> {
        self.payments
            .find_payment(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", id)))
    }

    pub async fn payments_for_donation(&self, donation_id: i64) -> Result<Vec<Payment>, ServiceError> {
        self.payments.list_payments_for_donation(donation_id).await
    }

    /// Opens a PENDING payment for a donation through `gateway`. At most one
    /// open payment exists per donation; a second one is refused.
    #[instrument(skip(self, gateway, caller), fields(gateway_id = gateway.id(), actor = caller.actor()))]
    pub async fn open_payment(
        &self,
        donation_id: i64,
        gateway: &GatewayProfile,
        intent_id: &str,
        caller: &CallerContext,
    ) -> Result<Payment, ServiceError> {
        if intent_id.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Gateway intent id is required".to_string(),
            ));
        }

        let _guard = self.donation_locks.lock(donation_id).await;

        let mut donation = self
            .donations
            .find_donation(donation_id)
            .await?
            .filter(|d| !d.is_deleted())
            .ok_or_else(|| ServiceError::NotFound(format!("Donation {} not found", donation_id)))?;

        if !matches!(
            donation.status,
            DonationStatus::Pending | DonationStatus::Processing | DonationStatus::Failed
        ) {
            return Err(ServiceError::invalid_transition(
                "donation",
                donation.status.as_str(),
                "open a payment for",
            ));
        }
        if !gateway.gateway.is_active {
            return Err(ServiceError::GatewayNotConfigured(format!(
                "gateway '{}' is not active",
                gateway.gateway.name
            )));
        }
        if !gateway.accepts(donation.amount, &donation.currency) {
            return Err(ServiceError::ValidationError(format!(
                "gateway '{}' does not accept {} {}",
                gateway.gateway.name, donation.amount, donation.currency
            )));
        }

        let open = self
            .payments
            .list_payments_for_donation(donation_id)
            .await?
            .into_iter()
            .find(|p| p.status.is_open());
        if let Some(open) = open {
            return Err(ServiceError::Conflict(format!(
                "Donation {} already has open payment {} ({})",
                donation_id, open.id, open.status
            )));
        }

        let mut payment = Payment::new(
            donation_id,
            gateway.gateway.provider.as_str(),
            intent_id,
            donation.amount,
            donation.currency.clone(),
        );
        payment.payment_method = Some(donation.payment_method.clone());
        let payment = self.payments.insert_payment(payment).await?;

        let status = donation.status;
        donation.payment_intent_id = Some(intent_id.to_string());
        donation.updated_at = payment.created_at;
        if let Err(err) = self
            .donations
            .save_with_counter(&donation, status, Default::default())
            .await
        {
            self.abandon_payment(payment, &err).await;
            return Err(err);
        }

        counter!("payments.opened", 1, "gateway" => payment.gateway_name.clone());
        info!(payment_id = payment.id, donation_id, "Payment opened");
        Ok(payment)
    }

    /// Cancels a payment whose donation could not be pointed at it, so it
    /// does not stay open and block the next `open_payment`.
    async fn abandon_payment(&self, mut payment: Payment, cause: &ServiceError) {
        let _guard = self.payment_locks.lock(payment.id).await;
        let payment_id = payment.id;
        let reason = json!({ "abandoned": cause.to_string() });
        if let Err(e) = payment.cancel(Some(reason)) {
            error!(payment_id, error = %e, "Could not cancel unlinked payment");
            return;
        }
        match self.payments.save_payment(&payment).await {
            Ok(_) => warn!(
                payment_id,
                donation_id = payment.donation_id,
                error = %cause,
                "Donation not linked to new payment, payment cancelled"
            ),
            Err(e) => error!(payment_id, error = %e, "Could not cancel unlinked payment"),
        }
    }

    async fn transition<F>(&self, payment_id: i64, apply: F) -> Result<Payment, ServiceError>
    where
        F: FnOnce(&mut Payment) -> Result<(), ServiceError> + Send,
    {
        let _guard = self.payment_locks.lock(payment_id).await;
        let mut payment = self.get_payment(payment_id).await?;
        let old_status = payment.status;

        apply(&mut payment)?;
        let saved = self.payments.save_payment(&payment).await?;

        info!(
            payment_id,
            from = %old_status,
            to = %saved.status,
            "Payment status changed"
        );
        self.event_sender
            .send_or_log(Event::PaymentStatusChanged {
                payment_id,
                donation_id: saved.donation_id,
                old_status,
                new_status: saved.status,
            })
            .await;
        Ok(saved)
    }

    #[instrument(skip(self, gateway_data))]
    pub async fn authorize(
        &self,
        payment_id: i64,
        transaction_id: &str,
        gateway_data: Option<Value>,
    ) -> Result<Payment, ServiceError> {
        let transaction_id = transaction_id.to_string();
        self.transition(payment_id, move |p| p.authorize(transaction_id, gateway_data))
            .await
    }

    #[instrument(skip(self, gateway_data))]
    pub async fn capture(&self, payment_id: i64, gateway_data: Option<Value>) -> Result<Payment, ServiceError> {
        self.transition(payment_id, move |p| p.capture(gateway_data)).await
    }

    #[instrument(skip(self, gateway_data))]
    pub async fn fail(
        &self,
        payment_id: i64,
        detail: FailureDetail,
        gateway_data: Option<Value>,
    ) -> Result<Payment, ServiceError> {
        self.transition(payment_id, move |p| p.fail(detail, gateway_data))
            .await
    }

    #[instrument(skip(self, gateway_data))]
    pub async fn cancel(&self, payment_id: i64, gateway_data: Option<Value>) -> Result<Payment, ServiceError> {
        self.transition(payment_id, move |p| p.cancel(gateway_data)).await
    }

    /// Performs one gateway round-trip for a payment: opens an attempt,
    /// awaits `call` under the gateway timeout and closes the attempt with
    /// the outcome. When the gateway cannot be reached the payment is failed
    /// and the connection error returned.
    #[instrument(skip(self, request, caller, call), fields(actor = caller.actor()))]
    pub async fn execute_gateway_call<T, F>(
        &self,
        payment_id: i64,
        action: &str,
        request: Option<Value>,
        caller: &CallerContext,
        call: F,
    ) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<GatewayReply<T>, ServiceError>> + Send,
        T: Send,
    {
        let payment = self.get_payment(payment_id).await?;
        let attempt = self
            .trail
            .log_attempt_start(&payment, action, request, caller)
            .await?;

        let started = Instant::now();
        let outcome = self.clients.call(&payment.gateway_name, action, call).await;
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        match outcome {
            Ok(reply) => {
                self.trail
                    .log_attempt_completion(attempt, reply.result, elapsed_ms)
                    .await?;
                Ok(reply.value)
            }
            Err(err) => {
                let message = err.to_string();
                self.trail
                    .log_attempt_completion(
                        attempt,
                        AttemptResult::Failed {
                            code: Some(CONNECTION_FAILURE_CODE.to_string()),
                            message: Some(message.clone()),
                            response: None,
                        },
                        elapsed_ms,
                    )
                    .await?;

                let detail = FailureDetail::new(message).with_code(CONNECTION_FAILURE_CODE);
                match self.fail(payment_id, detail, None).await {
                    Ok(_) => {}
                    Err(e) if e.is_invalid_transition() => {
                        warn!(payment_id, "Payment already terminal, not failing it again");
                    }
                    Err(e) => {
                        error!(payment_id, error = %e, "Could not record gateway failure on payment");
                    }
                }
                Err(err)
            }
        }
    }

    /// Whether the payment may still be moved by a direct call.
    pub async fn is_open(&self, payment_id: i64) -> Result<bool, ServiceError> {
        Ok(self.get_payment(payment_id).await?.status.is_open())
    }

    pub async fn is_refundable(&self, payment_id: i64) -> Result<bool, ServiceError> {
        Ok(self.get_payment(payment_id).await?.status.can_be_refunded())
    }
}
