#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use donation_payments::{
    config::AuditConfig,
    crypto::FieldCipher,
    events::{process_events, Event, EventHandler, EventSender},
    gateways::{FakeGatewayClient, GatewayClients},
    models::{Campaign, CurrencySupport, Donation, GatewayProfile, Payment},
    repositories::Stores,
    services::{CallerContext, CreateDonationRequest, GatewayConfigInput},
    PaymentCore,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

pub const TEST_KEY: &[u8; 32] = b"0123456789abcdef0123456789abcdef";
pub const STRIPE_SECRET: &str = "whsec_test_secret";

#[derive(Default)]
pub struct CollectedEvents(Mutex<Vec<Event>>);

#[async_trait]
impl EventHandler for CollectedEvents {
    async fn handle_event(&self, event: Event) -> Result<(), String> {
        self.0
            .lock()
            .map_err(|e| e.to_string())?
            .push(event);
        Ok(())
    }
}

/// Payment core over in-memory stores with scriptable gateways.
pub struct TestCore {
    pub core: PaymentCore,
    pub stripe: Arc<FakeGatewayClient>,
    pub mollie: Arc<FakeGatewayClient>,
    pub paypal: Arc<FakeGatewayClient>,
    events: Arc<CollectedEvents>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestCore {
    pub async fn new() -> Self {
        Self::with_stores(Stores::in_memory(), Duration::from_secs(20)).await
    }

    pub async fn with_stores(stores: Stores, timeout: Duration) -> Self {
        let stripe = Arc::new(FakeGatewayClient::new("stripe"));
        let mollie = Arc::new(FakeGatewayClient::new("mollie"));
        let paypal = Arc::new(FakeGatewayClient::new("paypal"));
        let clients = GatewayClients::new(timeout)
            .with_client(stripe.clone())
            .with_client(mollie.clone())
            .with_client(paypal.clone());

        let (event_tx, event_rx) = mpsc::channel(256);
        let events = Arc::new(CollectedEvents::default());
        let handler = events.clone();
        let event_task = tokio::spawn(async move {
            process_events(event_rx, Some(handler.as_ref())).await;
        });

        let cipher = Arc::new(FieldCipher::new(TEST_KEY).expect("32-byte key"));
        let core = PaymentCore::new(
            stores,
            cipher,
            clients,
            AuditConfig::default(),
            EventSender::new(event_tx),
        );

        Self {
            core,
            stripe,
            mollie,
            paypal,
            events,
            _event_task: event_task,
        }
    }

    pub fn caller() -> CallerContext {
        CallerContext::user("tester").with_ip("203.0.113.7")
    }

    /// Events seen so far, after giving the drain task a chance to run.
    pub async fn events(&self) -> Vec<Event> {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.events.0.lock().expect("events lock").clone()
    }

    pub async fn seed_campaign(&self) -> Campaign {
        self.core
            .donations
            .create_campaign("Clean water", dec!(10000), "EUR")
            .await
            .expect("create campaign")
    }

    pub async fn seed_donation(&self, campaign_id: i64, amount: Decimal) -> Donation {
        self.core
            .donations
            .create_donation(
                CreateDonationRequest {
                    campaign_id,
                    donor_id: Some(42),
                    amount,
                    currency: "EUR".to_string(),
                    payment_method: "card".to_string(),
                    is_anonymous: false,
                    is_recurring: false,
                    recurring_frequency: None,
                    metadata: None,
                },
                &Self::caller(),
            )
            .await
            .expect("create donation")
    }

    /// Configures and activates a gateway accepting EUR.
    pub async fn active_gateway(
        &self,
        provider: &str,
        priority: i32,
        min: Decimal,
        max: Decimal,
    ) -> GatewayProfile {
        let mut input = GatewayConfigInput::new(provider, false);
        input.api_key = Some(format!("{}_key", provider));
        input.webhook_secret = Some(STRIPE_SECRET.to_string());
        if provider == "paypal" {
            let mut settings = serde_json::Map::new();
            settings.insert("client_id".into(), "AZ-client".into());
            input.settings = Some(settings);
        }
        input.priority = Some(priority);
        input.min_amount = Some(min);
        input.max_amount = Some(max);
        input.currencies = Some(vec![CurrencySupport::new("EUR")]);

        let caller = Self::caller();
        let profile = self
            .core
            .gateways
            .configure_gateway(input, &caller)
            .await
            .expect("configure gateway");
        self.core
            .gateways
            .activate_gateway(profile.id(), &caller)
            .await
            .expect("activate gateway");
        self.core
            .stores
            .gateways
            .find_gateway_profile(profile.id())
            .await
            .expect("load gateway")
            .expect("gateway exists")
    }

    /// Campaign, donation, active stripe gateway and an open payment.
    pub async fn donation_with_payment(&self, amount: Decimal, intent: &str) -> (Donation, Payment) {
        let campaign = self.seed_campaign().await;
        let donation = self.seed_donation(campaign.id, amount).await;
        let gateway = self.active_gateway("stripe", 10, dec!(1), dec!(10000)).await;
        let payment = self
            .core
            .payments
            .open_payment(donation.id, &gateway, intent, &Self::caller())
            .await
            .expect("open payment");
        let donation = self
            .core
            .donations
            .get_donation(donation.id)
            .await
            .expect("reload donation");
        (donation, payment)
    }

    pub async fn campaign(&self, id: i64) -> Campaign {
        self.core.donations.get_campaign(id).await.expect("campaign")
    }
}
