use chrono::{Duration, Utc};
use metrics::{counter, histogram};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::CallerContext;
use crate::config::AuditConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::{NewAttempt, Payment, PaymentAttempt};
use crate::repositories::AttemptStore;

/// What a gateway round-trip came back with.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Succeeded {
        transaction_id: Option<String>,
        response: Option<Value>,
    },
    Failed {
        code: Option<String>,
        message: Option<String>,
        response: Option<Value>,
    },
    /// Outcome still resolving on the gateway side.
    Pending { response: Option<Value> },
}

impl AttemptResult {
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            code: Some(code.into()),
            message: Some(message.into()),
            response: None,
        }
    }
}

/// Append-only log of gateway interactions per payment.
#[derive(Clone)]
pub struct AttemptTrailService {
    attempts: Arc<dyn AttemptStore>,
    audit: AuditConfig,
    event_sender: EventSender,
}

impl AttemptTrailService {
    pub fn new(attempts: Arc<dyn AttemptStore>, audit: AuditConfig, event_sender: EventSender) -> Self {
        Self {
            attempts,
            audit,
            event_sender,
        }
    }

    /// Opens a PENDING attempt numbered after the payment's last one.
    #[instrument(skip(self, payment, request, caller), fields(payment_id = payment.id, gateway = %payment.gateway_name))]
    pub async fn log_attempt_start(
        &self,
        payment: &Payment,
        action: &str,
        request: Option<Value>,
        caller: &CallerContext,
    ) -> Result<PaymentAttempt, ServiceError> {
        let attempt = self
            .attempts
            .create_attempt(NewAttempt {
                payment_id: payment.id,
                gateway_name: payment.gateway_name.clone(),
                gateway_action: action.to_string(),
                request_data: request,
                ip_address: caller.ip_address.clone(),
                user_agent: caller.user_agent.clone(),
            })
            .await?;

        info!(
            attempt_id = attempt.id,
            attempt_number = attempt.attempt_number,
            request_id = %attempt.gateway_request_id,
            "Gateway attempt started"
        );
        Ok(attempt)
    }

    /// Closes an attempt with the call's result. An attempt can only be
    /// closed once.
    #[instrument(skip(self, attempt, result), fields(attempt_id = attempt.id, payment_id = attempt.payment_id))]
    pub async fn log_attempt_completion(
        &self,
        mut attempt: PaymentAttempt,
        result: AttemptResult,
        response_time_ms: i64,
    ) -> Result<PaymentAttempt, ServiceError> {
        match result {
            AttemptResult::Succeeded {
                transaction_id,
                response,
            } => attempt.mark_successful(transaction_id, response.as_ref(), response_time_ms)?,
            AttemptResult::Failed {
                code,
                message,
                response,
            } => attempt.mark_failed(code, message, response.as_ref(), response_time_ms)?,
            AttemptResult::Pending { response } => {
                attempt.mark_pending(response.as_ref(), response_time_ms)?
            }
        }

        let saved = self.attempts.update_attempt(&attempt).await?;

        counter!(
            "payments.gateway_attempts",
            1,
            "gateway" => saved.gateway_name.clone(),
            "status" => saved.status.as_str()
        );
        histogram!(
            "payments.gateway_response_ms",
            response_time_ms as f64,
            "gateway" => saved.gateway_name.clone()
        );

        if saved.is_failed() {
            warn!(
                error_code = ?saved.error_code,
                retryable = self.is_retryable(&saved),
                "Gateway attempt failed"
            );
        } else {
            info!(status = %saved.status, response_time_ms, "Gateway attempt completed");
        }
        Ok(saved)
    }

    pub async fn get_payment_audit_trail(&self, payment_id: i64) -> Result<Vec<PaymentAttempt>, ServiceError> {
        self.attempts.list_attempts_for_payment(payment_id).await
    }

    pub fn is_retryable(&self, attempt: &PaymentAttempt) -> bool {
        attempt.is_retryable(&self.audit.permanent_error_codes)
    }

    /// Deletes attempts older than `days`. The only way attempts are removed.
    #[instrument(skip(self))]
    pub async fn purge_older_than(&self, days: i64) -> Result<u64, ServiceError> {
        if days < 1 {
            return Err(ServiceError::ValidationError(
                "Retention must be at least one day".to_string(),
            ));
        }
        let cutoff = Utc::now() - Duration::days(days);
        let removed = self.attempts.purge_attempts_before(cutoff).await?;
        info!(removed, %cutoff, "Purged gateway attempts");
        self.event_sender
            .send_or_log(Event::AttemptsPurged { cutoff, removed })
            .await;
        Ok(removed)
    }

    /// Purge with the configured retention period.
    pub async fn purge_expired(&self) -> Result<u64, ServiceError> {
        self.purge_older_than(self.audit.retention_days).await
    }
}
