use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::status::PaymentStatus;
use crate::errors::ServiceError;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub donation_id: i64,
    /// Provider tag of the gateway collecting this payment (e.g. "stripe")
    pub gateway_name: String,
    pub intent_id: String,
    pub transaction_id: Option<String>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: Option<String>,
    pub status: PaymentStatus,
    pub gateway_customer_id: Option<String>,
    pub gateway_payment_method_id: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub decline_code: Option<String>,
    /// Accumulated gateway payloads, merged on every transition
    #[sea_orm(column_type = "Json")]
    pub gateway_data: Json,
    #[sea_orm(column_type = "Json", nullable)]
    pub metadata: Option<Json>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::donation::Entity",
        from = "Column::DonationId",
        to = "super::donation::Column::Id"
    )]
    Donation,
    #[sea_orm(has_many = "super::payment_attempt::Entity")]
    Attempts,
}

impl Related<super::donation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Donation.def()
    }
}

impl Related<super::payment_attempt::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Attempts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Failure detail recorded by [`Model::fail`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub message: String,
    pub code: Option<String>,
    pub decline_code: Option<String>,
}

impl FailureDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_decline_code(mut self, code: impl Into<String>) -> Self {
        self.decline_code = Some(code.into());
        self
    }
}

/// Deep-merges `patch` into `target`. Objects merge key by key, anything
/// else replaces. A non-object patch on the root is kept under `raw`.
pub fn merge_gateway_data(target: &mut Value, patch: Value) {
    if patch.is_null() {
        return;
    }
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    match patch {
        Value::Object(entries) => merge_objects(target, entries),
        other => {
            if let Some(map) = target.as_object_mut() {
                map.insert("raw".to_string(), other);
            }
        }
    }
}

fn merge_objects(target: &mut Value, patch: serde_json::Map<String, Value>) {
    let Some(map) = target.as_object_mut() else {
        return;
    };
    for (key, value) in patch {
        let nested = matches!(map.get(&key), Some(Value::Object(_))) && value.is_object();
        match (nested, value) {
            (true, Value::Object(inner)) => {
                if let Some(existing) = map.get_mut(&key) {
                    merge_objects(existing, inner);
                }
            }
            (_, value) => {
                map.insert(key, value);
            }
        }
    }
}

impl Model {
    pub fn new(
        donation_id: i64,
        gateway_name: impl Into<String>,
        intent_id: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            donation_id,
            gateway_name: gateway_name.into(),
            intent_id: intent_id.into(),
            transaction_id: None,
            amount,
            currency: currency.into(),
            payment_method: None,
            status: PaymentStatus::Pending,
            gateway_customer_id: None,
            gateway_payment_method_id: None,
            failure_code: None,
            failure_message: None,
            decline_code: None,
            gateway_data: Value::Object(serde_json::Map::new()),
            metadata: None,
            authorized_at: None,
            captured_at: None,
            failed_at: None,
            cancelled_at: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn guard(&self, allowed: bool, action: &'static str) -> Result<(), ServiceError> {
        if allowed {
            Ok(())
        } else {
            Err(ServiceError::invalid_transition(
                "payment",
                self.status.as_str(),
                action,
            ))
        }
    }

    fn touch(&mut self, gateway_data: Option<Value>) -> DateTime<Utc> {
        if let Some(data) = gateway_data {
            merge_gateway_data(&mut self.gateway_data, data);
        }
        let now = Utc::now();
        self.updated_at = now;
        now
    }

    pub fn authorize(
        &mut self,
        transaction_id: impl Into<String>,
        gateway_data: Option<Value>,
    ) -> Result<(), ServiceError> {
        self.guard(self.status.can_authorize(), "authorize")?;
        let now = self.touch(gateway_data);
        self.status = PaymentStatus::Processing;
        self.transaction_id = Some(transaction_id.into());
        self.authorized_at = Some(now);
        Ok(())
    }

    pub fn capture(&mut self, gateway_data: Option<Value>) -> Result<(), ServiceError> {
        self.guard(self.status.can_capture(), "capture")?;
        let now = self.touch(gateway_data);
        self.status = PaymentStatus::Completed;
        self.captured_at = Some(now);
        Ok(())
    }

    pub fn fail(
        &mut self,
        detail: FailureDetail,
        gateway_data: Option<Value>,
    ) -> Result<(), ServiceError> {
        self.guard(self.status.can_fail(), "fail")?;
        let now = self.touch(gateway_data);
        self.status = PaymentStatus::Failed;
        self.failed_at = Some(now);
        self.failure_message = Some(detail.message);
        self.failure_code = detail.code;
        self.decline_code = detail.decline_code;
        Ok(())
    }

    pub fn cancel(&mut self, gateway_data: Option<Value>) -> Result<(), ServiceError> {
        self.guard(self.status.can_cancel(), "cancel")?;
        let now = self.touch(gateway_data);
        self.status = PaymentStatus::Cancelled;
        self.cancelled_at = Some(now);
        Ok(())
    }

    /// Overwrites the status with what the gateway reports. Timestamps are
    /// only set the first time a status is reached and an existing
    /// transaction id is never replaced, so repeating the call is harmless.
    /// Returns the previous status.
    pub fn update_from_gateway(
        &mut self,
        status: PaymentStatus,
        transaction_id: Option<String>,
        gateway_data: Option<Value>,
    ) -> PaymentStatus {
        let previous = self.status;
        let now = self.touch(gateway_data);
        self.status = status;

        match status {
            PaymentStatus::Processing => {
                self.authorized_at.get_or_insert(now);
            }
            PaymentStatus::Completed => {
                self.captured_at.get_or_insert(now);
            }
            PaymentStatus::Failed => {
                self.failed_at.get_or_insert(now);
            }
            PaymentStatus::Cancelled => {
                self.cancelled_at.get_or_insert(now);
            }
            _ => {}
        }

        if self.transaction_id.is_none() {
            self.transaction_id = transaction_id;
        }

        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn payment() -> Model {
        Model::new(1, "stripe", "pi_123", dec!(50), "EUR")
    }

    #[test]
    fn authorize_then_capture() {
        let mut p = payment();
        p.authorize("ch_1", Some(json!({"step": "auth"}))).unwrap();
        assert_eq!(p.status, PaymentStatus::Processing);
        assert_eq!(p.transaction_id.as_deref(), Some("ch_1"));
        assert!(p.authorized_at.is_some());

        p.capture(Some(json!({"captured": true}))).unwrap();
        assert_eq!(p.status, PaymentStatus::Completed);
        assert!(p.captured_at.is_some());
        assert_eq!(p.gateway_data, json!({"step": "auth", "captured": true}));
    }

    #[test]
    fn authorize_requires_pending() {
        let mut p = payment();
        p.authorize("ch_1", None).unwrap();
        assert_matches!(
            p.authorize("ch_2", None),
            Err(ServiceError::InvalidStateTransition { action: "authorize", .. })
        );
        assert_eq!(p.transaction_id.as_deref(), Some("ch_1"));
    }

    #[test]
    fn terminal_payments_reject_transitions() {
        let mut p = payment();
        p.cancel(None).unwrap();
        assert!(p.capture(None).is_err());
        assert!(p.fail(FailureDetail::new("late"), None).is_err());
        assert!(p.cancel(None).is_err());
        assert_eq!(p.status, PaymentStatus::Cancelled);
    }

    #[test]
    fn processing_payment_can_fail_with_detail() {
        let mut p = payment();
        p.authorize("ch_1", None).unwrap();
        p.fail(
            FailureDetail::new("Your card was declined")
                .with_code("card_declined")
                .with_decline_code("generic_decline"),
            Some(json!({"error": {"type": "card_error"}})),
        )
        .unwrap();
        assert_eq!(p.status, PaymentStatus::Failed);
        assert_eq!(p.failure_code.as_deref(), Some("card_declined"));
        assert_eq!(p.decline_code.as_deref(), Some("generic_decline"));
        assert!(p.failed_at.is_some());
    }

    #[test]
    fn update_from_gateway_is_idempotent() {
        let mut p = payment();
        p.update_from_gateway(PaymentStatus::Completed, Some("ch_9".into()), None);
        let captured = p.captured_at;
        assert!(captured.is_some());

        let previous = p.update_from_gateway(PaymentStatus::Completed, Some("ch_other".into()), None);
        assert_eq!(previous, PaymentStatus::Completed);
        assert_eq!(p.captured_at, captured);
        assert_eq!(p.transaction_id.as_deref(), Some("ch_9"));
    }

    #[test]
    fn gateway_data_merges_deeply() {
        let mut data = json!({"a": {"x": 1, "y": 2}, "b": 1});
        merge_gateway_data(&mut data, json!({"a": {"y": 3, "z": 4}}));
        assert_eq!(data, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": 1}));

        merge_gateway_data(&mut data, Value::Null);
        assert_eq!(data["b"], json!(1));

        merge_gateway_data(&mut data, json!("plain text body"));
        assert_eq!(data["raw"], json!("plain text body"));
        assert_eq!(data["b"], json!(1));
    }
}
