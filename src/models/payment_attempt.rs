use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::status::AttemptStatus;
use crate::errors::ServiceError;
use crate::redaction::redact_opt;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_attempts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub payment_id: i64,
    /// 1-based, gap-free per payment
    pub attempt_number: i32,
    pub gateway_name: String,
    pub gateway_action: String,
    pub gateway_request_id: String,
    #[sea_orm(column_type = "Json", nullable)]
    pub request_data: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub response_data: Option<Json>,
    pub status: AttemptStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub response_time_ms: Option<i64>,
    pub gateway_transaction_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::payment::Entity",
        from = "Column::PaymentId",
        to = "super::payment::Column::Id"
    )]
    Payment,
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payment.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Fields of an attempt known before its number is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub payment_id: i64,
    pub gateway_name: String,
    pub gateway_action: String,
    pub request_data: Option<Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewAttempt {
    /// Builds the persisted row. Request data is redacted here so the raw
    /// payload never reaches a store.
    pub fn into_model(self, attempt_number: i32, attempted_at: DateTime<Utc>) -> Model {
        Model {
            id: 0,
            payment_id: self.payment_id,
            attempt_number,
            gateway_name: self.gateway_name,
            gateway_action: self.gateway_action,
            gateway_request_id: uuid::Uuid::new_v4().to_string(),
            request_data: redact_opt(self.request_data.as_ref()),
            response_data: None,
            status: AttemptStatus::Pending,
            error_code: None,
            error_message: None,
            response_time_ms: None,
            gateway_transaction_id: None,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            attempted_at,
            completed_at: None,
        }
    }
}

impl Model {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_successful(&self) -> bool {
        self.status == AttemptStatus::Successful
    }

    pub fn is_failed(&self) -> bool {
        self.status == AttemptStatus::Failed
    }

    fn complete(
        &mut self,
        status: AttemptStatus,
        response: Option<&Value>,
        response_time_ms: i64,
    ) -> Result<(), ServiceError> {
        if self.completed_at.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Attempt {} of payment {} is already completed",
                self.attempt_number, self.payment_id
            )));
        }
        self.status = status;
        self.response_data = redact_opt(response);
        self.response_time_ms = Some(response_time_ms.max(0));
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_successful(
        &mut self,
        transaction_id: Option<String>,
        response: Option<&Value>,
        response_time_ms: i64,
    ) -> Result<(), ServiceError> {
        self.complete(AttemptStatus::Successful, response, response_time_ms)?;
        self.gateway_transaction_id = transaction_id;
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        error_code: Option<String>,
        error_message: Option<String>,
        response: Option<&Value>,
        response_time_ms: i64,
    ) -> Result<(), ServiceError> {
        self.complete(AttemptStatus::Failed, response, response_time_ms)?;
        self.error_code = error_code;
        self.error_message = error_message;
        Ok(())
    }

    /// Closes the call while the outcome is still resolving on the gateway
    /// side (3-D Secure, bank redirect).
    pub fn mark_pending(
        &mut self,
        response: Option<&Value>,
        response_time_ms: i64,
    ) -> Result<(), ServiceError> {
        self.complete(AttemptStatus::Pending, response, response_time_ms)
    }

    /// Failed with a code outside the permanent set.
    pub fn is_retryable(&self, permanent_codes: &[String]) -> bool {
        if !self.is_failed() {
            return false;
        }
        match &self.error_code {
            Some(code) => !permanent_codes.iter().any(|c| c.eq_ignore_ascii_case(code)),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redaction::REDACTED;
    use serde_json::json;

    fn attempt() -> Model {
        NewAttempt {
            payment_id: 3,
            gateway_name: "stripe".into(),
            gateway_action: "create_intent".into(),
            request_data: Some(json!({"amount": 500, "card": {"cvc": "999"}})),
            ip_address: Some("10.0.0.1".into()),
            user_agent: None,
        }
        .into_model(1, Utc::now())
    }

    fn permanent() -> Vec<String> {
        vec!["card_declined".into(), "expired_card".into()]
    }

    #[test]
    fn request_data_is_redacted_on_creation() {
        let a = attempt();
        assert_eq!(a.status, AttemptStatus::Pending);
        assert_eq!(a.request_data.unwrap()["card"]["cvc"], json!(REDACTED));
        assert!(!a.gateway_request_id.is_empty());
    }

    #[test]
    fn completion_happens_once() {
        let mut a = attempt();
        a.mark_successful(
            Some("ch_1".into()),
            Some(&json!({"id": "ch_1", "client_secret": "pi_secret"})),
            120,
        )
        .unwrap();
        assert!(a.is_successful());
        assert_eq!(a.response_time_ms, Some(120));
        assert_eq!(a.response_data.as_ref().unwrap()["client_secret"], json!(REDACTED));

        let again = a.mark_failed(Some("card_declined".into()), None, None, 5);
        assert!(again.is_err());
        assert!(a.is_successful());
    }

    #[test]
    fn retryability_depends_on_error_code() {
        let mut declined = attempt();
        declined
            .mark_failed(Some("card_declined".into()), Some("declined".into()), None, 80)
            .unwrap();
        assert!(!declined.is_retryable(&permanent()));

        let mut timeout = attempt();
        timeout
            .mark_failed(Some("timeout".into()), None, None, 20_000)
            .unwrap();
        assert!(timeout.is_retryable(&permanent()));

        let mut pending = attempt();
        pending.mark_pending(None, 40).unwrap();
        assert!(!pending.is_retryable(&permanent()));
    }
}
