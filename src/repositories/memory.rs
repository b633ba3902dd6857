use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use super::{AttemptStore, CampaignStore, DonationStore, GatewayStore, KeyedLocks, PaymentStore};
use crate::errors::ServiceError;
use crate::models::{
    Campaign, CounterDelta, CurrencySupport, Donation, DonationStatus, GatewayCurrency,
    GatewayProfile, GatewayProvider, NewAttempt, Payment, PaymentAttempt, PaymentGateway,
};

/// Process-local store backed by concurrent maps.
#[derive(Debug)]
pub struct InMemoryStore {
    campaigns: DashMap<i64, Campaign>,
    donations: DashMap<i64, Donation>,
    payments: DashMap<i64, Payment>,
    attempts: DashMap<i64, PaymentAttempt>,
    gateways: DashMap<i64, PaymentGateway>,
    currencies: DashMap<i64, GatewayCurrency>,
    next_id: AtomicI64,
    attempt_locks: KeyedLocks,
    // Donation status and campaign counter move together under this lock.
    counter_lock: Mutex<()>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            campaigns: DashMap::new(),
            donations: DashMap::new(),
            payments: DashMap::new(),
            attempts: DashMap::new(),
            gateways: DashMap::new(),
            currencies: DashMap::new(),
            next_id: AtomicI64::new(1),
            attempt_locks: KeyedLocks::new(),
            counter_lock: Mutex::new(()),
        }
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn profile(&self, gateway: PaymentGateway) -> GatewayProfile {
        let mut currencies: Vec<GatewayCurrency> = self
            .currencies
            .iter()
            .filter(|c| c.gateway_id == gateway.id)
            .map(|c| c.value().clone())
            .collect();
        currencies.sort_by_key(|c| c.id);
        GatewayProfile::new(gateway, currencies)
    }

    fn insert_currencies(&self, gateway_id: i64, currencies: Vec<CurrencySupport>) -> Vec<GatewayCurrency> {
        currencies
            .into_iter()
            .map(|support| {
                let mut row = support.into_model(gateway_id);
                row.id = self.next_id();
                self.currencies.insert(row.id, row.clone());
                row
            })
            .collect()
    }
}

#[async_trait]
impl CampaignStore for InMemoryStore {
    async fn insert_campaign(&self, mut campaign: Campaign) -> Result<Campaign, ServiceError> {
        campaign.id = self.next_id();
        self.campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn find_campaign(&self, id: i64) -> Result<Option<Campaign>, ServiceError> {
        Ok(self.campaigns.get(&id).map(|c| c.value().clone()))
    }
}

#[async_trait]
impl DonationStore for InMemoryStore {
    async fn insert_donation(&self, mut donation: Donation) -> Result<Donation, ServiceError> {
        donation.id = self.next_id();
        self.donations.insert(donation.id, donation.clone());
        Ok(donation)
    }

    async fn find_donation(&self, id: i64) -> Result<Option<Donation>, ServiceError> {
        Ok(self.donations.get(&id).map(|d| d.value().clone()))
    }

    async fn find_by_payment_intent(&self, intent_id: &str) -> Result<Option<Donation>, ServiceError> {
        Ok(self
            .donations
            .iter()
            .find(|d| !d.is_deleted() && d.payment_intent_id.as_deref() == Some(intent_id))
            .map(|d| d.value().clone()))
    }

    async fn save_with_counter(
        &self,
        donation: &Donation,
        expected_status: DonationStatus,
        delta: CounterDelta,
    ) -> Result<Donation, ServiceError> {
        let _guard = self
            .counter_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let (stored_status, stored_deleted) = self
            .donations
            .get(&donation.id)
            .map(|d| (d.status, d.is_deleted()))
            .ok_or_else(|| ServiceError::NotFound(format!("Donation {} not found", donation.id)))?;
        if stored_deleted {
            return Err(ServiceError::NotFound(format!(
                "Donation {} is deleted",
                donation.id
            )));
        }
        if stored_status != expected_status {
            return Err(ServiceError::ConcurrentModification(donation.id));
        }

        if !delta.is_zero() {
            let mut campaign = self.campaigns.get_mut(&donation.campaign_id).ok_or_else(|| {
                ServiceError::NotFound(format!("Campaign {} not found", donation.campaign_id))
            })?;
            campaign.apply_delta(delta);
        }

        self.donations.insert(donation.id, donation.clone());
        Ok(donation.clone())
    }
}

#[async_trait]
impl PaymentStore for InMemoryStore {
    async fn insert_payment(&self, mut payment: Payment) -> Result<Payment, ServiceError> {
        payment.id = self.next_id();
        self.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn find_payment(&self, id: i64) -> Result<Option<Payment>, ServiceError> {
        Ok(self.payments.get(&id).map(|p| p.value().clone()))
    }

    async fn find_payment_by_intent(
        &self,
        gateway_name: &str,
        intent_id: &str,
    ) -> Result<Option<Payment>, ServiceError> {
        Ok(self
            .payments
            .iter()
            .find(|p| p.gateway_name == gateway_name && p.intent_id == intent_id)
            .map(|p| p.value().clone()))
    }

    async fn list_payments_for_donation(&self, donation_id: i64) -> Result<Vec<Payment>, ServiceError> {
        let mut payments: Vec<Payment> = self
            .payments
            .iter()
            .filter(|p| p.donation_id == donation_id)
            .map(|p| p.value().clone())
            .collect();
        payments.sort_by_key(|p| p.id);
        Ok(payments)
    }

    async fn save_payment(&self, payment: &Payment) -> Result<Payment, ServiceError> {
        match self.payments.get_mut(&payment.id) {
            Some(mut stored) => {
                *stored = payment.clone();
                Ok(payment.clone())
            }
            None => Err(ServiceError::NotFound(format!("Payment {} not found", payment.id))),
        }
    }
}

#[async_trait]
impl AttemptStore for InMemoryStore {
    async fn create_attempt(&self, attempt: NewAttempt) -> Result<PaymentAttempt, ServiceError> {
        let _guard = self.attempt_locks.lock(attempt.payment_id).await;

        let last = self
            .attempts
            .iter()
            .filter(|a| a.payment_id == attempt.payment_id)
            .map(|a| a.attempt_number)
            .max()
            .unwrap_or(0);

        let mut model = attempt.into_model(last + 1, Utc::now());
        model.id = self.next_id();
        self.attempts.insert(model.id, model.clone());
        Ok(model)
    }

    async fn find_attempt(&self, id: i64) -> Result<Option<PaymentAttempt>, ServiceError> {
        Ok(self.attempts.get(&id).map(|a| a.value().clone()))
    }

    async fn update_attempt(&self, attempt: &PaymentAttempt) -> Result<PaymentAttempt, ServiceError> {
        match self.attempts.get_mut(&attempt.id) {
            Some(mut stored) => {
                *stored = attempt.clone();
                Ok(attempt.clone())
            }
            None => Err(ServiceError::NotFound(format!("Attempt {} not found", attempt.id))),
        }
    }

    async fn list_attempts_for_payment(&self, payment_id: i64) -> Result<Vec<PaymentAttempt>, ServiceError> {
        let mut attempts: Vec<PaymentAttempt> = self
            .attempts
            .iter()
            .filter(|a| a.payment_id == payment_id)
            .map(|a| a.value().clone())
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn list_attempts_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PaymentAttempt>, ServiceError> {
        let mut attempts: Vec<PaymentAttempt> = self
            .attempts
            .iter()
            .filter(|a| a.attempted_at >= from && a.attempted_at <= to)
            .map(|a| a.value().clone())
            .collect();
        attempts.sort_by_key(|a| (a.attempted_at, a.id));
        Ok(attempts)
    }

    async fn purge_attempts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, ServiceError> {
        let mut removed = 0u64;
        self.attempts.retain(|_, a| {
            let keep = a.attempted_at >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

#[async_trait]
impl GatewayStore for InMemoryStore {
    async fn insert_gateway(
        &self,
        mut gateway: PaymentGateway,
        currencies: Vec<CurrencySupport>,
    ) -> Result<GatewayProfile, ServiceError> {
        gateway.id = self.next_id();
        self.gateways.insert(gateway.id, gateway.clone());
        let rows = self.insert_currencies(gateway.id, currencies);
        Ok(GatewayProfile::new(gateway, rows))
    }

    async fn find_gateway_profile(&self, id: i64) -> Result<Option<GatewayProfile>, ServiceError> {
        let gateway = self.gateways.get(&id).map(|g| g.value().clone());
        Ok(gateway.map(|g| self.profile(g)))
    }

    async fn find_gateway_by_provider_mode(
        &self,
        provider: GatewayProvider,
        test_mode: bool,
    ) -> Result<Option<GatewayProfile>, ServiceError> {
        let gateway = self
            .gateways
            .iter()
            .filter(|g| !g.is_deleted() && g.provider == provider && g.test_mode == test_mode)
            .map(|g| g.value().clone())
            .min_by_key(|g| g.id);
        Ok(gateway.map(|g| self.profile(g)))
    }

    async fn list_gateway_profiles(&self, active_only: bool) -> Result<Vec<GatewayProfile>, ServiceError> {
        let mut gateways: Vec<PaymentGateway> = self
            .gateways
            .iter()
            .filter(|g| !g.is_deleted() && (!active_only || g.is_active))
            .map(|g| g.value().clone())
            .collect();
        gateways.sort_by_key(|g| g.id);
        Ok(gateways.into_iter().map(|g| self.profile(g)).collect())
    }

    async fn update_gateway(&self, gateway: &PaymentGateway) -> Result<PaymentGateway, ServiceError> {
        let mut stored = self
            .gateways
            .get_mut(&gateway.id)
            .ok_or_else(|| ServiceError::NotFound(format!("Gateway {} not found", gateway.id)))?;
        if stored.lock_version != gateway.lock_version {
            return Err(ServiceError::ConcurrentModification(gateway.id));
        }
        let mut updated = gateway.clone();
        updated.lock_version += 1;
        updated.updated_at = Utc::now();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn replace_currencies(
        &self,
        gateway_id: i64,
        currencies: Vec<CurrencySupport>,
    ) -> Result<Vec<GatewayCurrency>, ServiceError> {
        self.currencies.retain(|_, c| c.gateway_id != gateway_id);
        Ok(self.insert_currencies(gateway_id, currencies))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::status::PaymentStatus;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn new_attempt(payment_id: i64) -> NewAttempt {
        NewAttempt {
            payment_id,
            gateway_name: "mollie".into(),
            gateway_action: "create_payment".into(),
            request_data: None,
            ip_address: None,
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn concurrent_attempts_get_distinct_numbers() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create_attempt(new_attempt(7)).await.unwrap().attempt_number
            }));
        }
        let mut numbers = Vec::new();
        for h in handles {
            numbers.push(h.await.unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=20).collect::<Vec<i32>>());

        let other = store.create_attempt(new_attempt(8)).await.unwrap();
        assert_eq!(other.attempt_number, 1);
    }

    #[tokio::test]
    async fn save_with_counter_checks_expected_status() {
        let store = InMemoryStore::new();
        let campaign = store
            .insert_campaign(Campaign::new("Shelter", dec!(500), "EUR"))
            .await
            .unwrap();
        let mut donation = store
            .insert_donation(Donation::new(campaign.id, dec!(20), "EUR", "card"))
            .await
            .unwrap();

        let change = donation.apply_status(DonationStatus::Completed, None, Utc::now());
        store
            .save_with_counter(&donation, change.from, change.delta)
            .await
            .unwrap();

        let stale = store
            .save_with_counter(&donation, DonationStatus::Pending, change.delta)
            .await;
        assert!(matches!(stale, Err(ServiceError::ConcurrentModification(_))));

        let campaign = store.find_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.donations_count, 1);
        assert_eq!(campaign.amount_raised, dec!(20));
    }

    #[tokio::test]
    async fn stale_write_cannot_revive_deleted_donation() {
        let store = InMemoryStore::new();
        let campaign = store
            .insert_campaign(Campaign::new("Shelter", dec!(500), "EUR"))
            .await
            .unwrap();
        let donation = store
            .insert_donation(Donation::new(campaign.id, dec!(20), "EUR", "card"))
            .await
            .unwrap();
        let mut stale = donation.clone();

        let mut deleted = donation.clone();
        let delta = deleted.soft_delete(Utc::now());
        store
            .save_with_counter(&deleted, DonationStatus::Pending, delta)
            .await
            .unwrap();

        let change = stale.apply_status(DonationStatus::Completed, None, Utc::now());
        assert!(matches!(
            store.save_with_counter(&stale, change.from, change.delta).await,
            Err(ServiceError::NotFound(_))
        ));

        let stored = store.find_donation(donation.id).await.unwrap().unwrap();
        assert!(stored.is_deleted());
        assert_eq!(stored.status, DonationStatus::Pending);
        let campaign = store.find_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.donations_count, 0);
        assert_eq!(campaign.amount_raised, dec!(0));
    }

    #[tokio::test]
    async fn payment_lookup_by_intent_is_scoped_to_gateway() {
        let store = InMemoryStore::new();
        let payment = store
            .insert_payment(Payment::new(1, "stripe", "pi_1", dec!(10), "EUR"))
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);

        assert!(store
            .find_payment_by_intent("stripe", "pi_1")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_payment_by_intent("mollie", "pi_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn gateway_update_uses_lock_version() {
        let store = InMemoryStore::new();
        let profile = store
            .insert_gateway(
                PaymentGateway::new("Mollie", GatewayProvider::Mollie, false),
                vec![CurrencySupport::new("EUR")],
            )
            .await
            .unwrap();

        let mut first = profile.gateway.clone();
        first.priority = 5;
        let saved = store.update_gateway(&first).await.unwrap();
        assert_eq!(saved.lock_version, 1);

        let mut stale = profile.gateway.clone();
        stale.priority = 9;
        assert!(matches!(
            store.update_gateway(&stale).await,
            Err(ServiceError::ConcurrentModification(_))
        ));
    }
}
