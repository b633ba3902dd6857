use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::crypto::FieldCipher;
use crate::errors::ServiceError;
use crate::models::GatewayProvider;
use crate::repositories::GatewayStore;
use crate::services::{PaymentProcessor, WebhookOutcome};

type HmacSha256 = Hmac<Sha256>;

const TIMESTAMP_HEADER: &str = "x-timestamp";
const SIGNATURE_HEADER: &str = "x-signature";
const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Clone)]
pub struct WebhookState {
    pub processor: PaymentProcessor,
    pub gateways: Arc<dyn GatewayStore>,
    pub cipher: Arc<FieldCipher>,
    pub tolerance_secs: u64,
}

// POST /webhooks/:gateway
pub async fn gateway_webhook(
    State(state): State<WebhookState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let provider = GatewayProvider::from_str(&gateway)
        .map_err(|_| ServiceError::NotFound(format!("Unknown gateway '{}'", gateway)))?;

    let secrets = match webhook_secrets(&state, provider).await {
        Ok(secrets) => secrets,
        Err(err) => {
            error!(gateway = provider.as_str(), error = %err, "Could not load webhook secrets");
            return Ok((
                StatusCode::OK,
                Json(WebhookOutcome::Failed {
                    reason: "webhook secrets unavailable".to_string(),
                }),
            ));
        }
    };
    if !secrets.is_empty() {
        let now = chrono::Utc::now().timestamp();
        let verified = secrets
            .iter()
            .any(|secret| verify_signature(&headers, &body, secret, state.tolerance_secs, now));
        if !verified {
            warn!(gateway = provider.as_str(), "Webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    } else {
        debug!(gateway = provider.as_str(), "No webhook secret configured, accepting unsigned");
    }

    let payload = parse_payload(&body);
    let Some(external_id) = extract_external_id(&payload) else {
        warn!(gateway = provider.as_str(), "Webhook without a resource id, ignoring");
        return Ok((
            StatusCode::OK,
            Json(WebhookOutcome::Failed {
                reason: "missing resource id".to_string(),
            }),
        ));
    };

    let outcome = state
        .processor
        .process_webhook_notification(provider.as_str(), &external_id, &payload)
        .await;
    info!(
        gateway = provider.as_str(),
        external_id = %external_id,
        outcome = ?outcome,
        "Webhook handled"
    );

    // Providers retry on non-2xx; state changes are idempotent so always ack
    Ok((StatusCode::OK, Json(outcome)))
}

async fn webhook_secrets(
    state: &WebhookState,
    provider: GatewayProvider,
) -> Result<Vec<String>, ServiceError> {
    Ok(state
        .gateways
        .list_gateway_profiles(false)
        .await?
        .into_iter()
        .filter(|p| p.gateway.provider == provider)
        .filter_map(|p| p.gateway.credentials(&state.cipher).webhook_secret)
        .collect())
}

/// JSON body, or a form-encoded one (Mollie posts `id=tr_...`).
pub fn parse_payload(body: &[u8]) -> Value {
    if let Ok(json) = serde_json::from_slice::<Value>(body) {
        return json;
    }
    let fields: Map<String, Value> = url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect();
    Value::Object(fields)
}

/// The gateway-side id of the resource a notification is about.
pub fn extract_external_id(payload: &Value) -> Option<String> {
    ["/data/object/id", "/resource/id", "/id"]
        .iter()
        .filter_map(|pointer| payload.pointer(pointer))
        .filter_map(Value::as_str)
        .find(|id| !id.is_empty())
        .map(str::to_string)
}

fn signature_matches(secret: &str, timestamp: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

fn within_tolerance(timestamp: &str, tolerance_secs: u64, now: i64) -> bool {
    timestamp
        .parse::<i64>()
        .map(|ts| (now - ts).unsigned_abs() <= tolerance_secs)
        .unwrap_or(false)
}

/// Accepts either `x-timestamp` + `x-signature` headers or a Stripe style
/// `t=...,v1=...` header, both HMAC-SHA256 over `"{timestamp}.{body}"`.
pub fn verify_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> bool {
    let header = |name: &str| headers.get(name).and_then(|h| h.to_str().ok());

    if let (Some(ts), Some(sig)) = (header(TIMESTAMP_HEADER), header(SIGNATURE_HEADER)) {
        return within_tolerance(ts, tolerance_secs, now)
            && signature_matches(secret, ts, payload, sig);
    }

    if let Some(sig) = header(STRIPE_SIGNATURE_HEADER) {
        let mut ts = None;
        let mut candidates = Vec::new();
        for part in sig.split(',') {
            match part.trim().split_once('=') {
                Some(("t", val)) => ts = Some(val),
                Some(("v1", val)) => candidates.push(val),
                _ => {}
            }
        }
        if let Some(ts) = ts {
            return within_tolerance(ts, tolerance_secs, now)
                && candidates
                    .iter()
                    .any(|v1| signature_matches(secret, ts, payload, v1));
        }
    }
    false
}

/// Signs a payload the way [`verify_signature`] expects. Used by tests and
/// the admin tool to craft deliveries.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
