//! Gateway client seam.
//!
//! The core never speaks a provider's wire protocol. It asks a
//! [`GatewayClient`] for the authoritative state of a transaction and for a
//! connectivity check; every call goes through [`GatewayClients`], which
//! bounds it with the configured timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, instrument};

use crate::crypto::GatewayCredentials;
use crate::errors::ServiceError;
use crate::models::PaymentStatus;

pub mod fake;

pub use fake::FakeGatewayClient;

/// Transaction state as reported by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayTransaction {
    /// None when the gateway reported a status this crate does not recognize
    pub status: Option<PaymentStatus>,
    pub transaction_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub raw: Value,
}

impl GatewayTransaction {
    pub fn with_status(status: PaymentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Builds from a provider status string, e.g. `"succeeded"` or `"paid"`.
    pub fn from_reported(raw_status: &str, transaction_id: Option<String>, raw: Value) -> Self {
        Self {
            status: PaymentStatus::from_gateway_str(raw_status),
            transaction_id,
            raw,
            ..Default::default()
        }
    }

    pub fn with_transaction_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn with_error(mut self, code: Option<&str>, message: impl Into<String>) -> Self {
        self.error_code = code.map(str::to_string);
        self.error_message = Some(message.into());
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn is_successful(&self) -> bool {
        self.status == Some(PaymentStatus::Completed)
    }

    /// Text recorded as the donation's failure reason.
    pub fn failure_reason(&self) -> Option<String> {
        match (&self.error_message, &self.error_code) {
            (Some(message), _) => Some(message.clone()),
            (None, Some(code)) => Some(code.clone()),
            (None, None) => None,
        }
    }
}

/// Interface every provider integration implements.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Provider tag this client serves, e.g. "stripe".
    fn name(&self) -> &str;

    /// Fetch the authoritative state of a transaction.
    async fn get_transaction(&self, external_id: &str) -> Result<GatewayTransaction, ServiceError>;

    /// Check that the credentials are accepted by the provider.
    async fn test_connection(&self, credentials: &GatewayCredentials) -> Result<bool, ServiceError>;
}

/// Registry of gateway clients keyed by provider tag.
#[derive(Clone)]
pub struct GatewayClients {
    clients: HashMap<String, Arc<dyn GatewayClient>>,
    timeout: Duration,
}

impl std::fmt::Debug for GatewayClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClients")
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GatewayClients {
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            timeout,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn GatewayClient>) -> Self {
        self.register(client);
        self
    }

    pub fn register(&mut self, client: Arc<dyn GatewayClient>) {
        self.clients
            .insert(client.name().to_ascii_lowercase(), client);
    }

    pub fn get(&self, gateway: &str) -> Result<Arc<dyn GatewayClient>, ServiceError> {
        self.clients
            .get(&gateway.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| {
                ServiceError::GatewayNotConfigured(format!(
                    "no client registered for gateway '{}'",
                    gateway
                ))
            })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs a gateway call under the configured timeout. Failures are logged
    /// with gateway and operation and surfaced as `GatewayConnectionFailure`.
    pub async fn call<T, F>(&self, gateway: &str, operation: &str, call: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                error!(gateway, operation, error = %err, "Gateway call failed");
                Err(match err {
                    e @ ServiceError::GatewayConnectionFailure { .. } => e,
                    e @ ServiceError::GatewayNotConfigured(_) => e,
                    other => ServiceError::connection_failure(gateway, format!("{}: {}", operation, other)),
                })
            }
            Err(_) => {
                error!(
                    gateway,
                    operation,
                    timeout_secs = self.timeout.as_secs(),
                    "Gateway call timed out"
                );
                Err(ServiceError::connection_failure(
                    gateway,
                    format!("{} timed out after {:?}", operation, self.timeout),
                ))
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn fetch_transaction(
        &self,
        gateway: &str,
        external_id: &str,
    ) -> Result<GatewayTransaction, ServiceError> {
        let client = self.get(gateway)?;
        self.call(gateway, "get_transaction", client.get_transaction(external_id))
            .await
    }

    #[instrument(skip(self, credentials))]
    pub async fn test_connection(
        &self,
        gateway: &str,
        credentials: &GatewayCredentials,
    ) -> Result<bool, ServiceError> {
        let client = self.get(gateway)?;
        self.call(gateway, "test_connection", client.test_connection(credentials))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn reported_status_strings_are_parsed() {
        let tx = GatewayTransaction::from_reported("succeeded", Some("ch_1".into()), Value::Null);
        assert!(tx.is_successful());
        let unknown = GatewayTransaction::from_reported("disputed", None, Value::Null);
        assert_eq!(unknown.status, None);
    }

    #[test]
    fn failure_reason_prefers_message() {
        let tx = GatewayTransaction::with_status(PaymentStatus::Failed)
            .with_error(Some("card_declined"), "Your card was declined");
        assert_eq!(tx.failure_reason().as_deref(), Some("Your card was declined"));

        let code_only = GatewayTransaction {
            error_code: Some("expired_card".into()),
            ..Default::default()
        };
        assert_eq!(code_only.failure_reason().as_deref(), Some("expired_card"));
    }

    #[tokio::test]
    async fn unknown_gateway_is_not_configured() {
        let clients = GatewayClients::new(Duration::from_secs(1));
        assert_matches!(
            clients.fetch_transaction("adyen", "x").await,
            Err(ServiceError::GatewayNotConfigured(_))
        );
    }

    #[tokio::test]
    async fn slow_gateway_times_out() {
        let fake = Arc::new(FakeGatewayClient::new("stripe").with_delay(Duration::from_millis(200)));
        let clients = GatewayClients::new(Duration::from_millis(20)).with_client(fake);
        assert_matches!(
            clients.fetch_transaction("stripe", "pi_1").await,
            Err(ServiceError::GatewayConnectionFailure { .. })
        );
    }
}
