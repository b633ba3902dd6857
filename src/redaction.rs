//! Masking of sensitive fields in gateway request/response payloads before
//! they are persisted in the attempt trail.

use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

/// Keys whose values never reach storage. Matched case-insensitively.
const SENSITIVE_KEYS: &[&str] = &[
    "card_number",
    "cardnumber",
    "cvv",
    "cvc",
    "cvv2",
    "card_cvc",
    "password",
    "secret",
    "secret_key",
    "private_key",
    "access_key",
    "access_token",
    "api_key",
    "client_secret",
    "webhook_secret",
];

pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key))
}

/// Returns a copy of `value` with every sensitive key masked, at any depth.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = if is_sensitive_key(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(v)
                    };
                    (k.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

pub fn redact_opt(value: Option<&Value>) -> Option<Value> {
    value.map(redact)
}
