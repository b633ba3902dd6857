//! Persistence seams for the payment core.
//!
//! Each aggregate has an `async_trait` store trait with two implementations:
//! sea-orm repositories for a real database and [`memory::InMemoryStore`]
//! for embedding and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::ServiceError;
use crate::models::{
    Campaign, CounterDelta, CurrencySupport, Donation, DonationStatus, GatewayCurrency,
    GatewayProfile, GatewayProvider, NewAttempt, Payment, PaymentAttempt, PaymentGateway,
};

pub mod attempt_repository;
pub mod donation_repository;
pub mod gateway_repository;
pub mod memory;
pub mod payment_repository;

pub use attempt_repository::AttemptRepository;
pub use donation_repository::{CampaignRepository, DonationRepository};
pub use gateway_repository::GatewayRepository;
pub use memory::InMemoryStore;
pub use payment_repository::PaymentRepository;

/// Repository trait for common database operations
pub trait Repository {
    fn get_db(&self) -> &DatabaseConnection;
}

#[derive(Debug, Clone)]
pub struct BaseRepository {
    db: Arc<DatabaseConnection>,
}

impl BaseRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

impl Repository for BaseRepository {
    fn get_db(&self) -> &DatabaseConnection {
        &self.db
    }
}

/// One async mutex per key, created on first use and dropped again once
/// nobody holds or waits for it. Serializes read-then-write sequences on a
/// single payment or donation.
#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<DashMap<i64, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: i64) -> KeyGuard {
        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            guard: Some(mutex.lock_owned().await),
            key,
            locks: self.locks.clone(),
        }
    }
}

/// Held lock on one key of a [`KeyedLocks`].
#[derive(Debug)]
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: i64,
    locks: Arc<DashMap<i64, Arc<Mutex<()>>>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own handle left: no holder, no waiter.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn insert_campaign(&self, campaign: Campaign) -> Result<Campaign, ServiceError>;
    async fn find_campaign(&self, id: i64) -> Result<Option<Campaign>, ServiceError>;
}

#[async_trait]
pub trait DonationStore: Send + Sync {
    async fn insert_donation(&self, donation: Donation) -> Result<Donation, ServiceError>;

    /// Includes soft-deleted rows.
    async fn find_donation(&self, id: i64) -> Result<Option<Donation>, ServiceError>;

    /// Live donation whose current payment intent is `intent_id`.
    async fn find_by_payment_intent(&self, intent_id: &str) -> Result<Option<Donation>, ServiceError>;

    /// Writes the donation and applies `delta` to its campaign atomically.
    /// Fails with `ConcurrentModification` when the stored status is no
    /// longer `expected_status`, and with `NotFound` when the stored row has
    /// been deleted.
    async fn save_with_counter(
        &self,
        donation: &Donation,
        expected_status: DonationStatus,
        delta: CounterDelta,
    ) -> Result<Donation, ServiceError>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert_payment(&self, payment: Payment) -> Result<Payment, ServiceError>;
    async fn find_payment(&self, id: i64) -> Result<Option<Payment>, ServiceError>;
    async fn find_payment_by_intent(
        &self,
        gateway_name: &str,
        intent_id: &str,
    ) -> Result<Option<Payment>, ServiceError>;
    async fn list_payments_for_donation(&self, donation_id: i64) -> Result<Vec<Payment>, ServiceError>;
    async fn save_payment(&self, payment: &Payment) -> Result<Payment, ServiceError>;
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Inserts with `attempt_number` = current max for the payment + 1.
    async fn create_attempt(&self, attempt: NewAttempt) -> Result<PaymentAttempt, ServiceError>;
    async fn find_attempt(&self, id: i64) -> Result<Option<PaymentAttempt>, ServiceError>;
    async fn update_attempt(&self, attempt: &PaymentAttempt) -> Result<PaymentAttempt, ServiceError>;

    /// Ordered by attempt number.
    async fn list_attempts_for_payment(&self, payment_id: i64) -> Result<Vec<PaymentAttempt>, ServiceError>;

    /// Attempts with `from <= attempted_at <= to`, oldest first.
    async fn list_attempts_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PaymentAttempt>, ServiceError>;

    async fn purge_attempts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, ServiceError>;
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn insert_gateway(
        &self,
        gateway: PaymentGateway,
        currencies: Vec<CurrencySupport>,
    ) -> Result<GatewayProfile, ServiceError>;

    async fn find_gateway_profile(&self, id: i64) -> Result<Option<GatewayProfile>, ServiceError>;

    async fn find_gateway_by_provider_mode(
        &self,
        provider: GatewayProvider,
        test_mode: bool,
    ) -> Result<Option<GatewayProfile>, ServiceError>;

    /// Live (not deleted) gateways, optionally only active ones.
    async fn list_gateway_profiles(&self, active_only: bool) -> Result<Vec<GatewayProfile>, ServiceError>;

    /// Optimistic write: succeeds only if the stored `lock_version` still
    /// equals `gateway.lock_version`, and bumps it.
    async fn update_gateway(&self, gateway: &PaymentGateway) -> Result<PaymentGateway, ServiceError>;

    async fn replace_currencies(
        &self,
        gateway_id: i64,
        currencies: Vec<CurrencySupport>,
    ) -> Result<Vec<GatewayCurrency>, ServiceError>;
}

/// The full set of stores the services depend on.
#[derive(Clone)]
pub struct Stores {
    pub campaigns: Arc<dyn CampaignStore>,
    pub donations: Arc<dyn DonationStore>,
    pub payments: Arc<dyn PaymentStore>,
    pub attempts: Arc<dyn AttemptStore>,
    pub gateways: Arc<dyn GatewayStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self::from_memory(Arc::new(InMemoryStore::new()))
    }

    pub fn from_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            campaigns: store.clone(),
            donations: store.clone(),
            payments: store.clone(),
            attempts: store.clone(),
            gateways: store,
        }
    }

    pub fn sea_orm(db: Arc<DatabaseConnection>) -> Self {
        Self {
            campaigns: Arc::new(CampaignRepository::new(db.clone())),
            donations: Arc::new(DonationRepository::new(db.clone())),
            payments: Arc::new(PaymentRepository::new(db.clone())),
            attempts: Arc::new(AttemptRepository::new(db.clone())),
            gateways: Arc::new(GatewayRepository::new(db)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn keyed_locks_serialize_same_key() {
        let locks = KeyedLocks::new();
        let guard = locks.lock(1).await;

        let other_key = tokio::time::timeout(Duration::from_millis(50), locks.lock(2)).await;
        assert!(other_key.is_ok());

        let same_key = tokio::time::timeout(Duration::from_millis(50), locks.lock(1)).await;
        assert!(same_key.is_err());

        drop(guard);
        assert!(tokio::time::timeout(Duration::from_millis(50), locks.lock(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn released_keys_are_forgotten() {
        let locks = KeyedLocks::new();
        for key in 0..1000 {
            let _guard = locks.lock(key).await;
        }
        assert!(locks.locks.is_empty());

        let held = locks.lock(7).await;
        assert_eq!(locks.locks.len(), 1);
        drop(held);
        assert!(locks.locks.is_empty());
    }

    #[tokio::test]
    async fn waiter_keeps_entry_alive() {
        let locks = KeyedLocks::new();
        let first = locks.lock(3).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(3).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert!(locks.locks.contains_key(&3) || waiter.is_finished());

        waiter.await.unwrap();
        assert!(locks.locks.is_empty());
    }
}
