use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, ConnectionTrait,
    DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, TransactionTrait,
};
use std::collections::HashMap;
use std::sync::Arc;

use super::{BaseRepository, GatewayStore, Repository};
use crate::errors::ServiceError;
use crate::models::{
    gateway_currency, payment_gateway, CurrencySupport, GatewayCurrency, GatewayProfile,
    GatewayProvider, PaymentGateway,
};

/// Repository for gateway configuration and currency support rows
#[derive(Debug, Clone)]
pub struct GatewayRepository {
    base: BaseRepository,
}

impl GatewayRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    async fn insert_currencies<C: ConnectionTrait>(
        conn: &C,
        gateway_id: i64,
        currencies: Vec<CurrencySupport>,
    ) -> Result<Vec<GatewayCurrency>, ServiceError> {
        let mut rows = Vec::with_capacity(currencies.len());
        for support in currencies {
            let mut active = support.into_model(gateway_id).into_active_model().reset_all();
            active.id = NotSet;
            rows.push(active.insert(conn).await?);
        }
        Ok(rows)
    }

    async fn attach_currencies(
        &self,
        gateways: Vec<PaymentGateway>,
    ) -> Result<Vec<GatewayProfile>, ServiceError> {
        if gateways.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = gateways.iter().map(|g| g.id).collect();
        let mut by_gateway: HashMap<i64, Vec<GatewayCurrency>> = HashMap::new();
        for row in gateway_currency::Entity::find()
            .filter(gateway_currency::Column::GatewayId.is_in(ids))
            .order_by_asc(gateway_currency::Column::Id)
            .all(self.get_db())
            .await?
        {
            by_gateway.entry(row.gateway_id).or_default().push(row);
        }

        Ok(gateways
            .into_iter()
            .map(|g| {
                let currencies = by_gateway.remove(&g.id).unwrap_or_default();
                GatewayProfile::new(g, currencies)
            })
            .collect())
    }
}

impl Repository for GatewayRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}

#[async_trait]
impl GatewayStore for GatewayRepository {
    async fn insert_gateway(
        &self,
        gateway: PaymentGateway,
        currencies: Vec<CurrencySupport>,
    ) -> Result<GatewayProfile, ServiceError> {
        let txn = self.get_db().begin().await?;
        let mut active = gateway.into_active_model().reset_all();
        active.id = NotSet;
        let gateway = active.insert(&txn).await?;
        let rows = Self::insert_currencies(&txn, gateway.id, currencies).await?;
        txn.commit().await?;
        Ok(GatewayProfile::new(gateway, rows))
    }

    async fn find_gateway_profile(&self, id: i64) -> Result<Option<GatewayProfile>, ServiceError> {
        let Some(gateway) = payment_gateway::Entity::find_by_id(id)
            .one(self.get_db())
            .await?
        else {
            return Ok(None);
        };
        Ok(self.attach_currencies(vec![gateway]).await?.pop())
    }

    async fn find_gateway_by_provider_mode(
        &self,
        provider: GatewayProvider,
        test_mode: bool,
    ) -> Result<Option<GatewayProfile>, ServiceError> {
        let Some(gateway) = payment_gateway::Entity::find()
            .filter(payment_gateway::Column::Provider.eq(provider))
            .filter(payment_gateway::Column::TestMode.eq(test_mode))
            .filter(payment_gateway::Column::DeletedAt.is_null())
            .order_by_asc(payment_gateway::Column::Id)
            .one(self.get_db())
            .await?
        else {
            return Ok(None);
        };
        Ok(self.attach_currencies(vec![gateway]).await?.pop())
    }

    async fn list_gateway_profiles(&self, active_only: bool) -> Result<Vec<GatewayProfile>, ServiceError> {
        let mut query = payment_gateway::Entity::find()
            .filter(payment_gateway::Column::DeletedAt.is_null())
            .order_by_asc(payment_gateway::Column::Id);
        if active_only {
            query = query.filter(payment_gateway::Column::IsActive.eq(true));
        }
        let gateways = query.all(self.get_db()).await?;
        self.attach_currencies(gateways).await
    }

    async fn update_gateway(&self, gateway: &PaymentGateway) -> Result<PaymentGateway, ServiceError> {
        let mut updated = gateway.clone();
        updated.lock_version += 1;
        updated.updated_at = Utc::now();

        let mut active = updated.clone().into_active_model().reset_all();
        active.id = NotSet;
        active.lock_version = Set(updated.lock_version);

        let result = payment_gateway::Entity::update_many()
            .set(active)
            .filter(payment_gateway::Column::Id.eq(gateway.id))
            .filter(payment_gateway::Column::LockVersion.eq(gateway.lock_version))
            .exec(self.get_db())
            .await?;

        if result.rows_affected == 0 {
            let exists = payment_gateway::Entity::find_by_id(gateway.id)
                .one(self.get_db())
                .await?
                .is_some();
            return Err(if exists {
                ServiceError::ConcurrentModification(gateway.id)
            } else {
                ServiceError::NotFound(format!("Gateway {} not found", gateway.id))
            });
        }

        Ok(updated)
    }

    async fn replace_currencies(
        &self,
        gateway_id: i64,
        currencies: Vec<CurrencySupport>,
    ) -> Result<Vec<GatewayCurrency>, ServiceError> {
        let txn = self.get_db().begin().await?;
        gateway_currency::Entity::delete_many()
            .filter(gateway_currency::Column::GatewayId.eq(gateway_id))
            .exec(&txn)
            .await?;
        let rows = Self::insert_currencies(&txn, gateway_id, currencies).await?;
        txn.commit().await?;
        Ok(rows)
    }
}
