use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder,
};
use std::sync::Arc;

use super::{BaseRepository, PaymentStore, Repository};
use crate::errors::ServiceError;
use crate::models::{payment, Payment};

/// Repository for payments. Payments are financial records and are never deleted.
#[derive(Debug, Clone)]
pub struct PaymentRepository {
    base: BaseRepository,
}

impl PaymentRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }
}

impl Repository for PaymentRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}

#[async_trait]
impl PaymentStore for PaymentRepository {
    async fn insert_payment(&self, payment: Payment) -> Result<Payment, ServiceError> {
        let mut active = payment.into_active_model().reset_all();
        active.id = NotSet;
        Ok(active.insert(self.get_db()).await?)
    }

    async fn find_payment(&self, id: i64) -> Result<Option<Payment>, ServiceError> {
        Ok(payment::Entity::find_by_id(id).one(self.get_db()).await?)
    }

    async fn find_payment_by_intent(
        &self,
        gateway_name: &str,
        intent_id: &str,
    ) -> Result<Option<Payment>, ServiceError> {
        Ok(payment::Entity::find()
            .filter(payment::Column::GatewayName.eq(gateway_name))
            .filter(payment::Column::IntentId.eq(intent_id))
            .order_by_desc(payment::Column::Id)
            .one(self.get_db())
            .await?)
    }

    async fn list_payments_for_donation(&self, donation_id: i64) -> Result<Vec<Payment>, ServiceError> {
        Ok(payment::Entity::find()
            .filter(payment::Column::DonationId.eq(donation_id))
            .order_by_asc(payment::Column::Id)
            .all(self.get_db())
            .await?)
    }

    async fn save_payment(&self, payment: &Payment) -> Result<Payment, ServiceError> {
        let active = payment.clone().into_active_model().reset_all();
        Ok(active.update(self.get_db()).await?)
    }
}
