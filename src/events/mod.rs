use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::status::{DonationStatus, PaymentStatus};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends without propagating failure. Domain state is already committed
    /// when events go out, so a closed channel only costs the notification.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping domain event");
        }
    }
}

/// Domain events emitted after state has been persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    DonationStatusChanged {
        donation_id: i64,
        campaign_id: i64,
        old_status: DonationStatus,
        new_status: DonationStatus,
    },
    DonationCompleted {
        donation_id: i64,
        campaign_id: i64,
        amount: Decimal,
        currency: String,
    },
    PaymentStatusChanged {
        payment_id: i64,
        donation_id: i64,
        old_status: PaymentStatus,
        new_status: PaymentStatus,
    },
    GatewayActivated {
        gateway_id: i64,
        provider: String,
    },
    GatewayDeactivated {
        gateway_id: i64,
        provider: String,
    },
    AttemptsPurged {
        cutoff: DateTime<Utc>,
        removed: u64,
    },
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

/// Drains the channel, logging each event and forwarding it to `handler` when present.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handler: Option<&dyn EventHandler>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!(?event, "Received event");

        if let Event::DonationCompleted {
            donation_id,
            campaign_id,
            amount,
            ..
        } = &event
        {
            info!(donation_id, campaign_id, %amount, "Donation completed");
        }

        if let Some(h) = handler {
            if let Err(e) = h.handle_event(event).await {
                warn!(error = %e, "Event handler failed");
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collect(Mutex<Vec<Event>>);

    #[async_trait]
    impl EventHandler for Collect {
        async fn handle_event(&self, event: Event) -> Result<(), String> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn forwards_events_to_handler() {
        let (tx, rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);
        sender
            .send(Event::GatewayActivated {
                gateway_id: 1,
                provider: "stripe".into(),
            })
            .await
            .unwrap();
        drop(sender);

        let handler = Collect(Mutex::new(Vec::new()));
        process_events(rx, Some(&handler)).await;
        assert_eq!(handler.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_or_log_tolerates_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        EventSender::new(tx)
            .send_or_log(Event::AttemptsPurged {
                cutoff: Utc::now(),
                removed: 0,
            })
            .await;
    }
}
