//! Property-based tests for the state machines and payload redaction.
//!
//! These tests use proptest to check invariants across arbitrary status
//! sequences and payload shapes.

use chrono::Utc;
use donation_payments::{
    models::{Donation, DonationStatus, Payment, PaymentStatus},
    redaction::{redact, REDACTED},
};
use proptest::prelude::*;
use proptest::sample::select;
use rust_decimal::Decimal;
use serde_json::{json, Value};

const DONATION_STATUSES: [DonationStatus; 6] = [
    DonationStatus::Pending,
    DonationStatus::Processing,
    DonationStatus::Completed,
    DonationStatus::Failed,
    DonationStatus::Cancelled,
    DonationStatus::Refunded,
];

const PAYMENT_STATUSES: [PaymentStatus; 8] = [
    PaymentStatus::Pending,
    PaymentStatus::Processing,
    PaymentStatus::RequiresAction,
    PaymentStatus::Completed,
    PaymentStatus::Failed,
    PaymentStatus::Cancelled,
    PaymentStatus::Refunded,
    PaymentStatus::PartiallyRefunded,
];

fn donation_status() -> impl Strategy<Value = DonationStatus> {
    select(DONATION_STATUSES.to_vec())
}

fn payment_status() -> impl Strategy<Value = PaymentStatus> {
    select(PAYMENT_STATUSES.to_vec())
}

fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000, 0u32..3).prop_map(|(units, scale)| Decimal::new(units, scale))
}

/// Mixed-case spellings of "cvv".
fn cvv_key() -> impl Strategy<Value = String> {
    proptest::collection::vec(any::<bool>(), 3).prop_map(|upper| {
        "cvv"
            .chars()
            .zip(upper)
            .map(|(c, up)| if up { c.to_ascii_uppercase() } else { c })
            .collect()
    })
}

/// Wraps `inner` in one object or array level per entry of `path`.
fn nest(inner: Value, path: &[bool]) -> Value {
    path.iter().rev().fold(inner, |acc, is_array| {
        if *is_array {
            json!([1, acc])
        } else {
            json!({"level": acc, "note": "kept"})
        }
    })
}

fn contains_string(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s == needle,
        Value::Array(items) => items.iter().any(|v| contains_string(v, needle)),
        Value::Object(map) => map.values().any(|v| contains_string(v, needle)),
        _ => false,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn capture_allowed_only_from_open_statuses(status in payment_status()) {
        let mut payment = Payment::new(1, "stripe", "pi_prop", Decimal::ONE_HUNDRED, "EUR");
        payment.status = status;

        let result = payment.capture(None);
        if matches!(status, PaymentStatus::Pending | PaymentStatus::Processing | PaymentStatus::RequiresAction) {
            prop_assert!(result.is_ok());
            prop_assert_eq!(payment.status, PaymentStatus::Completed);
            prop_assert!(payment.captured_at.is_some());
        } else {
            prop_assert!(result.unwrap_err().is_invalid_transition());
            prop_assert_eq!(payment.status, status);
            prop_assert!(payment.captured_at.is_none());
        }
    }

    #[test]
    fn counter_deltas_telescope(
        initial in donation_status(),
        steps in proptest::collection::vec(donation_status(), 0..20),
        amount in amount_strategy(),
    ) {
        let mut donation = Donation::new(1, amount, "EUR", "card");
        donation.status = initial;

        let mut count = 0i64;
        let mut raised = Decimal::ZERO;
        for status in &steps {
            let change = donation.apply_status(*status, None, Utc::now());
            count += change.delta.count;
            raised += change.delta.amount;
        }

        let expected = i64::from(donation.status.is_completed()) - i64::from(initial.is_completed());
        prop_assert_eq!(count, expected);
        prop_assert_eq!(raised, amount * Decimal::from(expected));
        if !donation.status.is_completed() {
            prop_assert!(donation.completed_at.is_none());
        }
    }

    #[test]
    fn reapplying_a_status_is_a_noop(status in donation_status(), amount in amount_strategy()) {
        let mut donation = Donation::new(1, amount, "EUR", "card");
        donation.apply_status(status, None, Utc::now());
        let before = donation.clone();

        let change = donation.apply_status(status, None, Utc::now());
        prop_assert!(change.is_noop());
        prop_assert!(change.delta.is_zero());
        prop_assert_eq!(donation, before);
    }

    #[test]
    fn cvv_is_redacted_at_any_depth(
        key in cvv_key(),
        secret in "[0-9]{3}",
        path in proptest::collection::vec(any::<bool>(), 0..6),
    ) {
        let payload = nest(json!({ key.clone(): secret.clone(), "last4": "4242" }), &path);
        let redacted = redact(&payload);

        prop_assert!(!contains_string(&redacted, &secret));
        prop_assert!(contains_string(&redacted, REDACTED));
        prop_assert!(contains_string(&redacted, "4242"));
        prop_assert!(contains_string(&redacted, "kept") || path.iter().all(|is_array| *is_array));
    }
}
