use serde::{Deserialize, Serialize};

// Gateway registry
pub mod gateway_config;
pub mod gateway_selector;

// Payment lifecycle
pub mod attempt_trail;
pub mod donations;
pub mod payment_processor;
pub mod payments;

// Audit and compliance
pub mod audit;

pub use attempt_trail::{AttemptResult, AttemptTrailService};
pub use audit::{
    assess_attempts, AuditReport, AuditService, ComplianceReport, FraudIndicator, FraudIndicators,
    IndicatorKind, IndicatorMetric, Severity,
};
pub use donations::{CreateDonationRequest, DonationService};
pub use gateway_config::{GatewayConfigInput, GatewayConfigService};
pub use gateway_selector::GatewaySelector;
pub use payment_processor::{PaymentProcessor, WebhookOutcome};
pub use payments::{GatewayReply, PaymentService, CONNECTION_FAILURE_CODE};

/// Who is calling, as established by the boundary layer. Passed explicitly
/// into every operation that records or authorizes on behalf of a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl CallerContext {
    pub fn system() -> Self {
        Self {
            user_id: Some("system".to_string()),
            ..Default::default()
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn actor(&self) -> &str {
        self.user_id.as_deref().unwrap_or("anonymous")
    }
}
