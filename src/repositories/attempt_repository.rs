use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, SqlErr,
};
use std::sync::Arc;
use tracing::warn;

use super::{AttemptStore, BaseRepository, KeyedLocks, Repository};
use crate::errors::ServiceError;
use crate::models::{payment_attempt, NewAttempt, PaymentAttempt};

const MAX_NUMBERING_RETRIES: usize = 3;

/// Repository for the attempt trail. Numbering is serialized per payment in
/// process and backed by the unique (payment_id, attempt_number) index
/// across processes.
#[derive(Debug, Clone)]
pub struct AttemptRepository {
    base: BaseRepository,
    locks: KeyedLocks,
}

impl AttemptRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
            locks: KeyedLocks::new(),
        }
    }

    async fn last_attempt_number(&self, payment_id: i64) -> Result<i32, ServiceError> {
        let last = payment_attempt::Entity::find()
            .filter(payment_attempt::Column::PaymentId.eq(payment_id))
            .order_by_desc(payment_attempt::Column::AttemptNumber)
            .one(self.get_db())
            .await?;
        Ok(last.map_or(0, |a| a.attempt_number))
    }
}

impl Repository for AttemptRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}

#[async_trait]
impl AttemptStore for AttemptRepository {
    async fn create_attempt(&self, attempt: NewAttempt) -> Result<PaymentAttempt, ServiceError> {
        let payment_id = attempt.payment_id;
        let _guard = self.locks.lock(payment_id).await;

        for _ in 0..MAX_NUMBERING_RETRIES {
            let number = self.last_attempt_number(payment_id).await? + 1;
            let mut active = attempt
                .clone()
                .into_model(number, Utc::now())
                .into_active_model()
                .reset_all();
            active.id = NotSet;

            match active.insert(self.get_db()).await {
                Ok(model) => return Ok(model),
                Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                    warn!(payment_id, attempt_number = number, "Attempt number taken, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(ServiceError::Conflict(format!(
            "Could not assign an attempt number for payment {}",
            payment_id
        )))
    }

    async fn find_attempt(&self, id: i64) -> Result<Option<PaymentAttempt>, ServiceError> {
        Ok(payment_attempt::Entity::find_by_id(id).one(self.get_db()).await?)
    }

    async fn update_attempt(&self, attempt: &PaymentAttempt) -> Result<PaymentAttempt, ServiceError> {
        let active = attempt.clone().into_active_model().reset_all();
        Ok(active.update(self.get_db()).await?)
    }

    async fn list_attempts_for_payment(&self, payment_id: i64) -> Result<Vec<PaymentAttempt>, ServiceError> {
        Ok(payment_attempt::Entity::find()
            .filter(payment_attempt::Column::PaymentId.eq(payment_id))
            .order_by_asc(payment_attempt::Column::AttemptNumber)
            .all(self.get_db())
            .await?)
    }

    async fn list_attempts_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PaymentAttempt>, ServiceError> {
        Ok(payment_attempt::Entity::find()
            .filter(payment_attempt::Column::AttemptedAt.gte(from))
            .filter(payment_attempt::Column::AttemptedAt.lte(to))
            .order_by_asc(payment_attempt::Column::AttemptedAt)
            .order_by_asc(payment_attempt::Column::Id)
            .all(self.get_db())
            .await?)
    }

    async fn purge_attempts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, ServiceError> {
        let result = payment_attempt::Entity::delete_many()
            .filter(payment_attempt::Column::AttemptedAt.lt(cutoff))
            .exec(self.get_db())
            .await?;
        Ok(result.rows_affected)
    }
}
