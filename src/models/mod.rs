// Domain entities
pub mod campaign;
pub mod donation;
pub mod gateway_currency;
pub mod payment;
pub mod payment_attempt;
pub mod payment_gateway;
pub mod status;

pub use campaign::Model as Campaign;
pub use donation::{counter_delta, CounterDelta, Model as Donation, StatusChange};
pub use gateway_currency::{CurrencySupport, Model as GatewayCurrency};
pub use payment::{FailureDetail, Model as Payment};
pub use payment_attempt::{Model as PaymentAttempt, NewAttempt};
pub use payment_gateway::{GatewayProfile, Model as PaymentGateway};
pub use status::{AttemptStatus, DonationStatus, GatewayProvider, PaymentStatus};
