//! Attempt trail numbering, retention and the fraud/compliance views over it.

mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::TestCore;
use donation_payments::{
    errors::ServiceError,
    events::Event,
    models::Payment,
    services::{AttemptResult, CallerContext, IndicatorKind, IndicatorMetric, Severity},
};
use rust_decimal_macros::dec;
use tokio::task::JoinSet;

async fn failed_attempt(app: &TestCore, payment: &Payment, ip: &str, code: &str) {
    let caller = CallerContext::user("donor").with_ip(ip);
    let attempt = app
        .core
        .trail
        .log_attempt_start(payment, "charge", None, &caller)
        .await
        .unwrap();
    app.core
        .trail
        .log_attempt_completion(attempt, AttemptResult::failed(code, "declined"), 150)
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_attempts_are_numbered_without_gaps() {
    let app = TestCore::new().await;
    let (_, payment) = app.donation_with_payment(dec!(10), "pi_numbers").await;

    let mut tasks = JoinSet::new();
    for _ in 0..20 {
        let trail = app.core.trail.clone();
        let payment = payment.clone();
        tasks.spawn(async move {
            trail
                .log_attempt_start(&payment, "charge", None, &CallerContext::system())
                .await
                .map(|a| a.attempt_number)
        });
    }
    let mut numbers = Vec::new();
    while let Some(number) = tasks.join_next().await {
        numbers.push(number.unwrap().unwrap());
    }
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=20).collect::<Vec<i32>>());

    let trail = app.core.trail.get_payment_audit_trail(payment.id).await.unwrap();
    let ordered: Vec<i32> = trail.iter().map(|a| a.attempt_number).collect();
    assert_eq!(ordered, (1..=20).collect::<Vec<i32>>());
}

#[tokio::test]
async fn numbering_is_per_payment() {
    let app = TestCore::new().await;
    let (_, first) = app.donation_with_payment(dec!(10), "pi_a").await;
    let campaign = app.seed_campaign().await;
    let donation = app.seed_donation(campaign.id, dec!(12)).await;
    let gateway = app.core.gateways.get_active_gateways().await.unwrap().remove(0);
    let second = app
        .core
        .payments
        .open_payment(donation.id, &gateway, "pi_b", &TestCore::caller())
        .await
        .unwrap();

    let caller = CallerContext::system();
    let trail = &app.core.trail;
    assert_eq!(trail.log_attempt_start(&first, "charge", None, &caller).await.unwrap().attempt_number, 1);
    assert_eq!(trail.log_attempt_start(&first, "capture", None, &caller).await.unwrap().attempt_number, 2);
    assert_eq!(trail.log_attempt_start(&second, "charge", None, &caller).await.unwrap().attempt_number, 1);
}

#[tokio::test]
async fn attempt_completion_is_final() {
    let app = TestCore::new().await;
    let (_, payment) = app.donation_with_payment(dec!(10), "pi_once").await;
    let attempt = app
        .core
        .trail
        .log_attempt_start(&payment, "charge", None, &CallerContext::system())
        .await
        .unwrap();
    let done = app
        .core
        .trail
        .log_attempt_completion(attempt, AttemptResult::Pending { response: None }, 90)
        .await
        .unwrap();
    assert_eq!(done.response_time_ms, Some(90));

    assert_matches!(
        app.core
            .trail
            .log_attempt_completion(done, AttemptResult::failed("x", "y"), 10)
            .await,
        Err(ServiceError::Conflict(_))
    );
}

#[tokio::test]
async fn repeated_declines_from_one_ip() {
    let app = TestCore::new().await;
    let (_, payment) = app.donation_with_payment(dec!(10), "pi_fraud").await;
    for _ in 0..3 {
        failed_attempt(&app, &payment, "198.51.100.1", "card_declined").await;
    }

    let indicators = app.core.audit.get_fraud_risk_indicators(payment.id).await.unwrap();
    let failures = &indicators[&IndicatorKind::MultipleFailures];
    assert_eq!(failures.severity, Severity::High);
    assert_eq!(failures.metric, IndicatorMetric::Count(3));
    assert!(!indicators.contains_key(&IndicatorKind::MultipleIps));
    // one distinct code is not a pattern
    assert!(!indicators.contains_key(&IndicatorKind::SuspiciousErrorPattern));
    assert!(indicators.contains_key(&IndicatorKind::RapidAttempts));
}

#[tokio::test]
async fn declines_from_two_ips() {
    let app = TestCore::new().await;
    let (_, payment) = app.donation_with_payment(dec!(10), "pi_fraud_ips").await;
    failed_attempt(&app, &payment, "198.51.100.1", "card_declined").await;
    failed_attempt(&app, &payment, "198.51.100.1", "card_declined").await;
    failed_attempt(&app, &payment, "192.0.2.44", "card_declined").await;

    let indicators = app.core.audit.get_fraud_risk_indicators(payment.id).await.unwrap();
    assert_eq!(
        indicators[&IndicatorKind::MultipleFailures].metric,
        IndicatorMetric::Count(3)
    );
    let ips = &indicators[&IndicatorKind::MultipleIps];
    assert_eq!(ips.severity, Severity::Medium);
    assert_eq!(ips.metric, IndicatorMetric::Count(2));
}

#[tokio::test]
async fn clean_payment_has_no_indicators() {
    let app = TestCore::new().await;
    let (_, payment) = app.donation_with_payment(dec!(10), "pi_clean").await;
    let attempt = app
        .core
        .trail
        .log_attempt_start(&payment, "charge", None, &TestCore::caller())
        .await
        .unwrap();
    app.core
        .trail
        .log_attempt_completion(
            attempt,
            AttemptResult::Succeeded {
                transaction_id: Some("ch_1".into()),
                response: None,
            },
            80,
        )
        .await
        .unwrap();

    assert!(app
        .core
        .audit
        .get_fraud_risk_indicators(payment.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn compliance_report_summarizes_window() {
    let app = TestCore::new().await;
    let (_, flagged) = app.donation_with_payment(dec!(10), "pi_report_1").await;
    for code in ["card_declined", "insufficient_funds", "card_declined"] {
        failed_attempt(&app, &flagged, "198.51.100.1", code).await;
    }

    let from = Utc::now() - Duration::hours(1);
    let to = Utc::now() + Duration::hours(1);
    let report = app.core.audit.get_compliance_report(from, to).await.unwrap();

    assert_eq!(report.report.totals.total, 3);
    assert_eq!(report.report.totals.failed, 3);
    assert_eq!(report.report.totals.success_rate, 0.0);
    assert_eq!(report.report.top_error_codes[0].code, "card_declined");
    assert_eq!(report.report.top_error_codes[0].count, 2);

    let stripe = &report.gateway_performance["stripe"];
    assert_eq!(stripe.stats.total, 3);
    assert_eq!(stripe.failure_reasons.len(), 2);

    let fraud = &report.fraud_summary;
    assert_eq!(fraud.flagged_payments, 1);
    assert_eq!(fraud.by_indicator[&IndicatorKind::SuspiciousErrorPattern], 1);
    assert_eq!(fraud.by_error_code["card_declined"], 1);
    assert_eq!(fraud.by_error_code["insufficient_funds"], 1);

    assert_matches!(
        app.core.audit.generate_audit_report(to, from).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn purge_removes_only_expired_attempts() {
    let app = TestCore::new().await;
    let (_, payment) = app.donation_with_payment(dec!(10), "pi_purge").await;
    let caller = CallerContext::system();
    let mut old = app
        .core
        .trail
        .log_attempt_start(&payment, "charge", None, &caller)
        .await
        .unwrap();
    app.core
        .trail
        .log_attempt_start(&payment, "charge", None, &caller)
        .await
        .unwrap();

    old.attempted_at = Utc::now() - Duration::days(400);
    app.core.stores.attempts.update_attempt(&old).await.unwrap();

    assert_matches!(
        app.core.trail.purge_older_than(0).await,
        Err(ServiceError::ValidationError(_))
    );
    assert_eq!(app.core.trail.purge_expired().await.unwrap(), 1);

    let remaining = app.core.trail.get_payment_audit_trail(payment.id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].attempt_number, 2);

    let events = app.events().await;
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::AttemptsPurged { removed: 1, .. })));
}
