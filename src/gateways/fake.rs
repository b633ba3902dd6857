//! Scriptable in-process gateway for development and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{GatewayClient, GatewayTransaction};
use crate::crypto::GatewayCredentials;
use crate::errors::ServiceError;

#[derive(Debug)]
pub struct FakeGatewayClient {
    name: String,
    transactions: DashMap<String, GatewayTransaction>,
    failures: DashMap<String, String>,
    delay: Option<Duration>,
    connection_ok: AtomicBool,
    calls: AtomicUsize,
}

impl FakeGatewayClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transactions: DashMap::new(),
            failures: DashMap::new(),
            delay: None,
            connection_ok: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_transaction(self, external_id: impl Into<String>, tx: GatewayTransaction) -> Self {
        self.set_transaction(external_id, tx);
        self
    }

    pub fn set_transaction(&self, external_id: impl Into<String>, tx: GatewayTransaction) {
        self.transactions.insert(external_id.into(), tx);
    }

    /// Makes lookups of `external_id` fail with a connection error.
    pub fn fail_lookup(&self, external_id: impl Into<String>, message: impl Into<String>) {
        self.failures.insert(external_id.into(), message.into());
    }

    pub fn set_connection_ok(&self, ok: bool) {
        self.connection_ok.store(ok, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl GatewayClient for FakeGatewayClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_transaction(&self, external_id: &str) -> Result<GatewayTransaction, ServiceError> {
        self.simulate_latency().await;

        if let Some(message) = self.failures.get(external_id) {
            return Err(ServiceError::connection_failure(&self.name, message.value().clone()));
        }

        self.transactions
            .get(external_id)
            .map(|tx| tx.value().clone())
            .ok_or_else(|| ServiceError::NotFound(format!("Transaction {} not found", external_id)))
    }

    async fn test_connection(&self, credentials: &GatewayCredentials) -> Result<bool, ServiceError> {
        self.simulate_latency().await;
        Ok(credentials.api_key.is_some() && self.connection_ok.load(Ordering::SeqCst))
    }
}
