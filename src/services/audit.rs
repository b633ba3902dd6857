use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::config::AuditConfig;
use crate::errors::ServiceError;
use crate::models::{AttemptStatus, PaymentAttempt};
use crate::repositories::AttemptStore;

const TOP_ERROR_CODES: usize = 10;
const UNKNOWN_ERROR_CODE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    MultipleFailures,
    RapidAttempts,
    MultipleIps,
    SuspiciousErrorPattern,
}

impl IndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultipleFailures => "multiple_failures",
            Self::RapidAttempts => "rapid_attempts",
            Self::MultipleIps => "multiple_ips",
            Self::SuspiciousErrorPattern => "suspicious_error_pattern",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// The number behind an indicator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorMetric {
    Count(usize),
    Seconds(f64),
    Codes(Vec<String>),
}

/// A derived risk signal. Indicators inform review; they never block a payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FraudIndicator {
    pub kind: IndicatorKind,
    pub severity: Severity,
    pub message: String,
    pub metric: IndicatorMetric,
}

pub type FraudIndicators = BTreeMap<IndicatorKind, FraudIndicator>;

/// Scores one payment's attempt trail. An empty map means no signal.
pub fn assess_attempts(attempts: &[PaymentAttempt], config: &AuditConfig) -> FraudIndicators {
    let mut indicators = FraudIndicators::new();

    let failed: Vec<&PaymentAttempt> = attempts.iter().filter(|a| a.is_failed()).collect();
    if failed.len() > config.failed_attempts_threshold {
        indicators.insert(
            IndicatorKind::MultipleFailures,
            FraudIndicator {
                kind: IndicatorKind::MultipleFailures,
                severity: Severity::High,
                message: format!("{} failed payment attempts", failed.len()),
                metric: IndicatorMetric::Count(failed.len()),
            },
        );
    }

    if attempts.len() >= 2 {
        let mut times: Vec<DateTime<Utc>> = attempts.iter().map(|a| a.attempted_at).collect();
        times.sort();
        let total_ms: i64 = times
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).num_milliseconds())
            .sum();
        let mean_secs = total_ms as f64 / 1000.0 / (times.len() - 1) as f64;
        if mean_secs < config.rapid_attempts_window_secs as f64 {
            indicators.insert(
                IndicatorKind::RapidAttempts,
                FraudIndicator {
                    kind: IndicatorKind::RapidAttempts,
                    severity: Severity::Medium,
                    message: format!(
                        "Attempts made on average {:.1}s apart",
                        mean_secs
                    ),
                    metric: IndicatorMetric::Seconds(mean_secs),
                },
            );
        }
    }

    let ips: BTreeSet<&str> = attempts
        .iter()
        .filter_map(|a| a.ip_address.as_deref())
        .collect();
    if ips.len() > config.distinct_ip_threshold {
        indicators.insert(
            IndicatorKind::MultipleIps,
            FraudIndicator {
                kind: IndicatorKind::MultipleIps,
                severity: Severity::Medium,
                message: format!("Attempts from {} different IP addresses", ips.len()),
                metric: IndicatorMetric::Count(ips.len()),
            },
        );
    }

    let suspicious: BTreeSet<String> = failed
        .iter()
        .filter_map(|a| a.error_code.as_deref())
        .filter(|code| config.is_suspicious_error(code))
        .map(str::to_ascii_lowercase)
        .collect();
    if suspicious.len() > 1 {
        let codes: Vec<String> = suspicious.into_iter().collect();
        indicators.insert(
            IndicatorKind::SuspiciousErrorPattern,
            FraudIndicator {
                kind: IndicatorKind::SuspiciousErrorPattern,
                severity: Severity::Low,
                message: format!("Suspicious decline pattern: {}", codes.join(", ")),
                metric: IndicatorMetric::Codes(codes),
            },
        );
    }

    indicators
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttemptStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub pending: usize,
    /// Percentage of all attempts that succeeded, two decimals.
    pub success_rate: f64,
    pub average_response_time_ms: Option<f64>,
}

impl AttemptStats {
    fn from_attempts<'a>(attempts: impl IntoIterator<Item = &'a PaymentAttempt>) -> Self {
        let mut stats = Self::default();
        let mut timed = 0usize;
        let mut total_ms = 0i64;
        for attempt in attempts {
            stats.total += 1;
            match attempt.status {
                AttemptStatus::Successful => stats.successful += 1,
                AttemptStatus::Failed => stats.failed += 1,
                AttemptStatus::Pending => stats.pending += 1,
            }
            if let Some(ms) = attempt.response_time_ms {
                timed += 1;
                total_ms += ms;
            }
        }
        if stats.total > 0 {
            stats.success_rate = round2(stats.successful as f64 * 100.0 / stats.total as f64);
        }
        if timed > 0 {
            stats.average_response_time_ms = Some(round2(total_ms as f64 / timed as f64));
        }
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCodeCount {
    pub code: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub payments: usize,
    pub totals: AttemptStats,
    pub by_gateway: BTreeMap<String, AttemptStats>,
    pub by_action: BTreeMap<String, AttemptStats>,
    pub top_error_codes: Vec<ErrorCodeCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayPerformance {
    #[serde(flatten)]
    pub stats: AttemptStats,
    pub failure_reasons: Vec<ErrorCodeCount>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FraudSummary {
    /// Payments in the window with at least one indicator.
    pub flagged_payments: usize,
    pub by_indicator: BTreeMap<IndicatorKind, usize>,
    /// Flagged payments per failure code seen on them.
    pub by_error_code: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceReport {
    pub report: AuditReport,
    pub gateway_performance: BTreeMap<String, GatewayPerformance>,
    pub fraud_summary: FraudSummary,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn error_code_counts<'a>(attempts: impl IntoIterator<Item = &'a PaymentAttempt>) -> Vec<ErrorCodeCount> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for attempt in attempts.into_iter().filter(|a| a.is_failed()) {
        let code = attempt.error_code.as_deref().unwrap_or(UNKNOWN_ERROR_CODE);
        *counts.entry(code).or_default() += 1;
    }
    let mut counts: Vec<ErrorCodeCount> = counts
        .into_iter()
        .map(|(code, count)| ErrorCodeCount {
            code: code.to_string(),
            count,
        })
        .collect();
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.code.cmp(&b.code)));
    counts
}

fn group_by<'a, K, F>(attempts: &'a [PaymentAttempt], key: F) -> BTreeMap<K, Vec<&'a PaymentAttempt>>
where
    K: Ord,
    F: Fn(&'a PaymentAttempt) -> K,
{
    let mut groups: BTreeMap<K, Vec<&'a PaymentAttempt>> = BTreeMap::new();
    for attempt in attempts {
        groups.entry(key(attempt)).or_default().push(attempt);
    }
    groups
}

/// Builds the window report from a set of attempts.
pub fn build_audit_report(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    attempts: &[PaymentAttempt],
) -> AuditReport {
    let payments: BTreeSet<i64> = attempts.iter().map(|a| a.payment_id).collect();
    let mut top_error_codes = error_code_counts(attempts);
    top_error_codes.truncate(TOP_ERROR_CODES);

    AuditReport {
        from,
        to,
        payments: payments.len(),
        totals: AttemptStats::from_attempts(attempts),
        by_gateway: group_by(attempts, |a| a.gateway_name.clone())
            .into_iter()
            .map(|(k, v)| (k, AttemptStats::from_attempts(v)))
            .collect(),
        by_action: group_by(attempts, |a| a.gateway_action.clone())
            .into_iter()
            .map(|(k, v)| (k, AttemptStats::from_attempts(v)))
            .collect(),
        top_error_codes,
    }
}

/// Fraud summary over attempts grouped per payment.
pub fn summarize_fraud(attempts: &[PaymentAttempt], config: &AuditConfig) -> FraudSummary {
    let mut summary = FraudSummary::default();
    for (_, trail) in group_by(attempts, |a| a.payment_id) {
        let trail: Vec<PaymentAttempt> = trail.into_iter().cloned().collect();
        let indicators = assess_attempts(&trail, config);
        if indicators.is_empty() {
            continue;
        }
        summary.flagged_payments += 1;
        for kind in indicators.keys() {
            *summary.by_indicator.entry(*kind).or_default() += 1;
        }
        let codes: BTreeSet<&str> = trail
            .iter()
            .filter(|a| a.is_failed())
            .map(|a| a.error_code.as_deref().unwrap_or(UNKNOWN_ERROR_CODE))
            .collect();
        for code in codes {
            *summary.by_error_code.entry(code.to_string()).or_default() += 1;
        }
    }
    summary
}

/// Read-only risk scoring and reporting over the attempt trail.
#[derive(Clone)]
pub struct AuditService {
    attempts: Arc<dyn AttemptStore>,
    config: AuditConfig,
}

impl AuditService {
    pub fn new(attempts: Arc<dyn AttemptStore>, config: AuditConfig) -> Self {
        Self { attempts, config }
    }

    pub async fn get_payment_audit_trail(&self, payment_id: i64) -> Result<Vec<PaymentAttempt>, ServiceError> {
        self.attempts.list_attempts_for_payment(payment_id).await
    }

    #[instrument(skip(self))]
    pub async fn get_fraud_risk_indicators(&self, payment_id: i64) -> Result<FraudIndicators, ServiceError> {
        let attempts = self.attempts.list_attempts_for_payment(payment_id).await?;
        let indicators = assess_attempts(&attempts, &self.config);
        if !indicators.is_empty() {
            let kinds: Vec<&str> = indicators.keys().map(IndicatorKind::as_str).collect();
            info!(payment_id, indicators = ?kinds, "Fraud indicators raised");
        }
        Ok(indicators)
    }

    async fn attempts_in_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PaymentAttempt>, ServiceError> {
        if from > to {
            return Err(ServiceError::ValidationError(
                "Report window start must not be after its end".to_string(),
            ));
        }
        self.attempts.list_attempts_between(from, to).await
    }

    #[instrument(skip(self))]
    pub async fn generate_audit_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<AuditReport, ServiceError> {
        let attempts = self.attempts_in_window(from, to).await?;
        Ok(build_audit_report(from, to, &attempts))
    }

    #[instrument(skip(self))]
    pub async fn get_compliance_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ComplianceReport, ServiceError> {
        let attempts = self.attempts_in_window(from, to).await?;

        let gateway_performance = group_by(&attempts, |a| a.gateway_name.clone())
            .into_iter()
            .map(|(gateway, trail)| {
                let perf = GatewayPerformance {
                    stats: AttemptStats::from_attempts(trail.iter().copied()),
                    failure_reasons: error_code_counts(trail),
                };
                (gateway, perf)
            })
            .collect();

        let report = ComplianceReport {
            report: build_audit_report(from, to, &attempts),
            gateway_performance,
            fraud_summary: summarize_fraud(&attempts, &self.config),
        };
        info!(
            attempts = report.report.totals.total,
            flagged_payments = report.fraud_summary.flagged_payments,
            "Compliance report generated"
        );
        Ok(report)
    }
}
