use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateways::{GatewayClients, GatewayTransaction};
use crate::models::{Donation, DonationStatus, PaymentStatus};
use crate::repositories::{DonationStore, KeyedLocks, PaymentStore};

const MAX_APPLY_ATTEMPTS: usize = 3;

/// What a webhook delivery did to local state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The donation moved to `status`.
    Applied { donation_id: i64, status: DonationStatus },
    /// The donation was already in `status`; nothing was written.
    Unchanged { donation_id: i64, status: DonationStatus },
    /// No live donation carries this intent id.
    UnknownDonation,
    /// The gateway reported a status this crate cannot map.
    UnrecognizedStatus { donation_id: i64 },
    /// Processing failed; the error was logged and absorbed.
    Failed { reason: String },
}

impl WebhookOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Unchanged { .. } => "unchanged",
            Self::UnknownDonation => "unknown_donation",
            Self::UnrecognizedStatus { .. } => "unrecognized_status",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Reconciles asynchronous gateway notifications into payment and donation
/// state. Status is re-fetched from the gateway and applied idempotently,
/// so duplicate deliveries converge on the same state.
#[derive(Clone)]
pub struct PaymentProcessor {
    clients: GatewayClients,
    donations: Arc<dyn DonationStore>,
    payments: Arc<dyn PaymentStore>,
    payment_locks: KeyedLocks,
    event_sender: EventSender,
}

impl PaymentProcessor {
    pub fn new(
        clients: GatewayClients,
        donations: Arc<dyn DonationStore>,
        payments: Arc<dyn PaymentStore>,
        payment_locks: KeyedLocks,
        event_sender: EventSender,
    ) -> Self {
        Self {
            clients,
            donations,
            payments,
            payment_locks,
            event_sender,
        }
    }

    /// Entry point for webhook deliveries. Never fails: errors are logged
    /// with gateway and external id and reported as [`WebhookOutcome::Failed`].
    pub async fn process_webhook_notification(
        &self,
        gateway: &str,
        external_id: &str,
        payload: &Value,
    ) -> WebhookOutcome {
        let outcome = match self.reconcile(gateway, external_id, payload).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    gateway,
                    external_id,
                    error = %err,
                    "Webhook processing failed"
                );
                WebhookOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };
        counter!(
            "payments.webhooks",
            1,
            "gateway" => gateway.to_ascii_lowercase(),
            "outcome" => outcome.label()
        );
        outcome
    }

    #[instrument(skip(self, payload))]
    pub async fn reconcile(
        &self,
        gateway: &str,
        external_id: &str,
        payload: &Value,
    ) -> Result<WebhookOutcome, ServiceError> {
        let gateway = gateway.to_ascii_lowercase();
        let transaction = self.clients.fetch_transaction(&gateway, external_id).await?;

        let Some(donation) = self.donations.find_by_payment_intent(external_id).await? else {
            warn!(gateway = %gateway, external_id, "Webhook for unknown donation");
            return Ok(WebhookOutcome::UnknownDonation);
        };

        let Some(status) = transaction.status else {
            warn!(
                gateway = %gateway,
                external_id,
                donation_id = donation.id,
                "Gateway reported an unrecognized status"
            );
            return Ok(WebhookOutcome::UnrecognizedStatus {
                donation_id: donation.id,
            });
        };

        self.reconcile_payment(&gateway, external_id, status, &transaction, payload)
            .await?;
        self.apply_to_donation(donation, status, &transaction).await
    }

    async fn reconcile_payment(
        &self,
        gateway: &str,
        external_id: &str,
        status: PaymentStatus,
        transaction: &GatewayTransaction,
        payload: &Value,
    ) -> Result<(), ServiceError> {
        let Some(found) = self
            .payments
            .find_payment_by_intent(gateway, external_id)
            .await?
        else {
            return Ok(());
        };

        let _guard = self.payment_locks.lock(found.id).await;
        let mut payment = match self.payments.find_payment(found.id).await? {
            Some(p) => p,
            None => return Ok(()),
        };

        let data = json!({
            "transaction": transaction.raw,
            "last_webhook": payload,
        });
        let previous = payment.update_from_gateway(status, transaction.transaction_id.clone(), Some(data));
        if status == PaymentStatus::Failed {
            if payment.failure_message.is_none() {
                payment.failure_message = transaction.failure_reason();
            }
            if payment.failure_code.is_none() {
                payment.failure_code = transaction.error_code.clone();
            }
        }
        let saved = self.payments.save_payment(&payment).await?;

        if previous != saved.status {
            info!(
                payment_id = saved.id,
                from = %previous,
                to = %saved.status,
                "Payment reconciled from gateway"
            );
            self.event_sender
                .send_or_log(Event::PaymentStatusChanged {
                    payment_id: saved.id,
                    donation_id: saved.donation_id,
                    old_status: previous,
                    new_status: saved.status,
                })
                .await;
        }
        Ok(())
    }

    async fn apply_to_donation(
        &self,
        mut donation: Donation,
        status: PaymentStatus,
        transaction: &GatewayTransaction,
    ) -> Result<WebhookOutcome, ServiceError> {
        let target = status.donation_status();
        let reason = match target {
            DonationStatus::Failed => transaction.failure_reason(),
            DonationStatus::Refunded => transaction
                .raw
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };

        for _ in 0..MAX_APPLY_ATTEMPTS {
            let change = donation.apply_status(target, reason.clone(), Utc::now());
            if change.is_noop() {
                return Ok(WebhookOutcome::Unchanged {
                    donation_id: donation.id,
                    status: target,
                });
            }

            match self
                .donations
                .save_with_counter(&donation, change.from, change.delta)
                .await
            {
                Ok(saved) => {
                    info!(
                        donation_id = saved.id,
                        from = %change.from,
                        to = %change.to,
                        counter_delta = change.delta.count,
                        "Donation status updated from gateway"
                    );
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
                    return Ok(WebhookOutcome::Applied {
                        donation_id: saved.id,
                        status: target,
                    });
                }
                Err(ServiceError::ConcurrentModification(id)) => {
                    warn!(donation_id = id, "Donation changed concurrently, reloading");
                    donation = self
                        .donations
                        .find_donation(id)
                        .await?
                        .ok_or_else(|| ServiceError::NotFound(format!("Donation {} not found", id)))?;
                }
                Err(other) => return Err(other),
            }
        }

        Err(ServiceError::ConcurrentModification(donation.id))
    }
}
