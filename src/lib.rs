//! Donation payments core
//!
//! Gateway registry and selection, the payment lifecycle, webhook
//! reconciliation into donation state, and fraud signals computed from the
//! gateway attempt trail.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod crypto;
pub mod db;
pub mod errors;
pub mod events;
pub mod gateways;
pub mod handlers;
pub mod migrator;
pub mod models;
pub mod redaction;
pub mod repositories;
pub mod services;

use axum::Router;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{AppConfig, AuditConfig};
use crate::crypto::FieldCipher;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateways::GatewayClients;
use crate::handlers::WebhookState;
use crate::repositories::{KeyedLocks, Stores};
use crate::services::{
    AttemptTrailService, AuditService, DonationService, GatewayConfigService, GatewaySelector,
    PaymentProcessor, PaymentService,
};

/// Capacity of the domain event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// All services wired over one set of stores. Cloning is cheap.
#[derive(Clone)]
pub struct PaymentCore {
    pub stores: Stores,
    pub cipher: Arc<FieldCipher>,
    pub clients: GatewayClients,
    pub gateways: GatewayConfigService,
    pub selector: GatewaySelector,
    pub donations: DonationService,
    pub payments: PaymentService,
    pub trail: AttemptTrailService,
    pub processor: PaymentProcessor,
    pub audit: AuditService,
}

impl PaymentCore {
    pub fn new(
        stores: Stores,
        cipher: Arc<FieldCipher>,
        clients: GatewayClients,
        audit_config: AuditConfig,
        event_sender: EventSender,
    ) -> Self {
        // Payment writes from direct calls and webhooks share one lock set
        let payment_locks = KeyedLocks::new();

        let trail = AttemptTrailService::new(
            stores.attempts.clone(),
            audit_config.clone(),
            event_sender.clone(),
        );
        let payments = PaymentService::new(
            stores.payments.clone(),
            stores.donations.clone(),
            trail.clone(),
            clients.clone(),
            payment_locks.clone(),
            event_sender.clone(),
        );
        let processor = PaymentProcessor::new(
            clients.clone(),
            stores.donations.clone(),
            stores.payments.clone(),
            payment_locks,
            event_sender.clone(),
        );

        Self {
            gateways: GatewayConfigService::new(
                stores.gateways.clone(),
                cipher.clone(),
                clients.clone(),
                event_sender.clone(),
            ),
            selector: GatewaySelector::new(stores.gateways.clone(), cipher.clone()),
            donations: DonationService::new(
                stores.campaigns.clone(),
                stores.donations.clone(),
                event_sender,
            ),
            audit: AuditService::new(stores.attempts.clone(), audit_config),
            payments,
            trail,
            processor,
            stores,
            cipher,
            clients,
        }
    }

    pub fn webhook_state(&self, tolerance_secs: u64) -> WebhookState {
        WebhookState {
            processor: self.processor.clone(),
            gateways: self.stores.gateways.clone(),
            cipher: self.cipher.clone(),
            tolerance_secs,
        }
    }

    pub fn router(&self, tolerance_secs: u64) -> Router {
        handlers::webhook_routes(self.webhook_state(tolerance_secs))
    }
}

/// Connects to the configured database and wires the core over sea-orm
/// stores. The returned receiver must be drained, e.g. with
/// [`events::process_events`], or senders block once it fills.
pub async fn bootstrap(
    config: &AppConfig,
    clients: GatewayClients,
) -> Result<(PaymentCore, mpsc::Receiver<Event>), ServiceError> {
    let cipher = Arc::new(FieldCipher::from_base64(&config.encryption_key)?);
    let db = Arc::new(db::connect_from_app_config(config).await?);

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let core = PaymentCore::new(
        Stores::sea_orm(db),
        cipher,
        clients,
        config.audit.clone(),
        EventSender::new(event_tx),
    );
    info!(environment = %config.environment, "Payment core ready");
    Ok((core, event_rx))
}
