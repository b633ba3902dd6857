//! Status vocabularies for donations, payments, attempts and gateway providers.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl DonationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "requires_action")]
    RequiresAction,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "partially_refunded")]
    PartiallyRefunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::RequiresAction => "requires_action",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::PartiallyRefunded => "partially_refunded",
        }
    }

    /// Statuses from which the payment can still move forward.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::RequiresAction)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    pub fn can_authorize(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn can_capture(&self) -> bool {
        self.is_open()
    }

    pub fn can_cancel(&self) -> bool {
        self.is_open()
    }

    pub fn can_fail(&self) -> bool {
        self.is_open()
    }

    pub fn can_be_refunded(&self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyRefunded)
    }

    /// Parses a status string reported by a gateway, accepting the common
    /// provider spellings (`succeeded`, `paid`, `canceled`, `expired`, ...).
    pub fn from_gateway_str(raw: &str) -> Option<Self> {
        let status = match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "open" | "created" => Self::Pending,
            "processing" | "authorized" | "approved" => Self::Processing,
            "requires_action" | "requires_payment_method" | "requires_confirmation" => {
                Self::RequiresAction
            }
            "completed" | "succeeded" | "paid" | "captured" => Self::Completed,
            "failed" | "expired" | "declined" => Self::Failed,
            "cancelled" | "canceled" | "voided" => Self::Cancelled,
            "refunded" => Self::Refunded,
            "partially_refunded" => Self::PartiallyRefunded,
            _ => return None,
        };
        Some(status)
    }

    /// The donation status a payment in this status implies.
    pub fn donation_status(&self) -> DonationStatus {
        match self {
            Self::Pending => DonationStatus::Pending,
            Self::Processing | Self::RequiresAction => DonationStatus::Processing,
            Self::Completed => DonationStatus::Completed,
            Self::Failed => DonationStatus::Failed,
            Self::Cancelled => DonationStatus::Cancelled,
            Self::Refunded | Self::PartiallyRefunded => DonationStatus::Refunded,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "successful")]
    Successful,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum GatewayProvider {
    #[sea_orm(string_value = "mollie")]
    Mollie,
    #[sea_orm(string_value = "stripe")]
    Stripe,
    #[sea_orm(string_value = "paypal")]
    Paypal,
}

impl GatewayProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mollie => "mollie",
            Self::Stripe => "stripe",
            Self::Paypal => "paypal",
        }
    }

    pub fn all() -> [GatewayProvider; 3] {
        [Self::Mollie, Self::Stripe, Self::Paypal]
    }
}

impl fmt::Display for GatewayProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mollie" => Ok(Self::Mollie),
            "stripe" => Ok(Self::Stripe),
            "paypal" => Ok(Self::Paypal),
            other => Err(format!(
                "unsupported gateway provider '{}'; expected one of mollie, stripe, paypal",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PaymentStatus::Pending, true, true)]
    #[case(PaymentStatus::Processing, false, true)]
    #[case(PaymentStatus::RequiresAction, false, true)]
    #[case(PaymentStatus::Completed, false, false)]
    #[case(PaymentStatus::Failed, false, false)]
    #[case(PaymentStatus::Cancelled, false, false)]
    #[case(PaymentStatus::Refunded, false, false)]
    #[case(PaymentStatus::PartiallyRefunded, false, false)]
    fn payment_transition_guards(
        #[case] status: PaymentStatus,
        #[case] authorize: bool,
        #[case] open: bool,
    ) {
        assert_eq!(status.can_authorize(), authorize);
        assert_eq!(status.can_capture(), open);
        assert_eq!(status.can_cancel(), open);
        assert_eq!(status.can_fail(), open);
        assert_eq!(status.is_terminal(), !open);
    }

    #[rstest]
    #[case("succeeded", Some(PaymentStatus::Completed))]
    #[case("paid", Some(PaymentStatus::Completed))]
    #[case("canceled", Some(PaymentStatus::Cancelled))]
    #[case("expired", Some(PaymentStatus::Failed))]
    #[case("REQUIRES_ACTION", Some(PaymentStatus::RequiresAction))]
    #[case("partially_refunded", Some(PaymentStatus::PartiallyRefunded))]
    #[case("chargeback", None)]
    fn parses_gateway_status_spellings(#[case] raw: &str, #[case] expected: Option<PaymentStatus>) {
        assert_eq!(PaymentStatus::from_gateway_str(raw), expected);
    }

    #[test]
    fn payment_status_maps_to_donation_status() {
        assert_eq!(
            PaymentStatus::RequiresAction.donation_status(),
            DonationStatus::Processing
        );
        assert_eq!(
            PaymentStatus::PartiallyRefunded.donation_status(),
            DonationStatus::Refunded
        );
        assert_eq!(
            PaymentStatus::Completed.donation_status(),
            DonationStatus::Completed
        );
    }

    #[test]
    fn refundable_only_after_completion() {
        assert!(PaymentStatus::Completed.can_be_refunded());
        assert!(PaymentStatus::PartiallyRefunded.can_be_refunded());
        assert!(!PaymentStatus::Pending.can_be_refunded());
    }

    #[test]
    fn provider_parsing_is_case_insensitive() {
        assert_eq!("Stripe".parse::<GatewayProvider>(), Ok(GatewayProvider::Stripe));
        assert!("adyen".parse::<GatewayProvider>().is_err());
        assert_eq!(GatewayProvider::Paypal.to_string(), "paypal");
    }
}
