use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, DatabaseConnection,
    EntityTrait, IntoActiveModel, QueryFilter, TransactionTrait,
};
use std::sync::Arc;
use tracing::debug;

use super::{BaseRepository, CampaignStore, DonationStore, Repository};
use crate::errors::ServiceError;
use crate::models::{campaign, donation, Campaign, CounterDelta, Donation, DonationStatus};

/// Repository for campaigns
#[derive(Debug, Clone)]
pub struct CampaignRepository {
    base: BaseRepository,
}

impl CampaignRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }
}

impl Repository for CampaignRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}

#[async_trait]
impl CampaignStore for CampaignRepository {
    async fn insert_campaign(&self, campaign: Campaign) -> Result<Campaign, ServiceError> {
        let mut active = campaign.into_active_model().reset_all();
        active.id = NotSet;
        Ok(active.insert(self.get_db()).await?)
    }

    async fn find_campaign(&self, id: i64) -> Result<Option<Campaign>, ServiceError> {
        Ok(campaign::Entity::find_by_id(id).one(self.get_db()).await?)
    }
}

/// Repository for donations; status writes carry the campaign counter update.
#[derive(Debug, Clone)]
pub struct DonationRepository {
    base: BaseRepository,
}

impl DonationRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }
}

impl Repository for DonationRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}

#[async_trait]
impl DonationStore for DonationRepository {
    async fn insert_donation(&self, donation: Donation) -> Result<Donation, ServiceError> {
        let mut active = donation.into_active_model().reset_all();
        active.id = NotSet;
        Ok(active.insert(self.get_db()).await?)
    }

    async fn find_donation(&self, id: i64) -> Result<Option<Donation>, ServiceError> {
        Ok(donation::Entity::find_by_id(id).one(self.get_db()).await?)
    }

    async fn find_by_payment_intent(&self, intent_id: &str) -> Result<Option<Donation>, ServiceError> {
        Ok(donation::Entity::find()
            .filter(donation::Column::PaymentIntentId.eq(intent_id))
            .filter(donation::Column::DeletedAt.is_null())
            .one(self.get_db())
            .await?)
    }

    async fn save_with_counter(
        &self,
        donation: &Donation,
        expected_status: DonationStatus,
        delta: CounterDelta,
    ) -> Result<Donation, ServiceError> {
        let txn = self.get_db().begin().await?;

        let mut active = donation.clone().into_active_model().reset_all();
        active.id = NotSet;
        let result = donation::Entity::update_many()
            .set(active)
            .filter(donation::Column::Id.eq(donation.id))
            .filter(donation::Column::Status.eq(expected_status))
            .filter(donation::Column::DeletedAt.is_null())
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            let stored = donation::Entity::find_by_id(donation.id).one(&txn).await?;
            txn.rollback().await?;
            return Err(match stored {
                Some(row) if !row.is_deleted() => ServiceError::ConcurrentModification(donation.id),
                Some(_) => ServiceError::NotFound(format!("Donation {} is deleted", donation.id)),
                None => ServiceError::NotFound(format!("Donation {} not found", donation.id)),
            });
        }

        if !delta.is_zero() {
            let updated = campaign::Entity::update_many()
                .col_expr(
                    campaign::Column::DonationsCount,
                    Expr::col(campaign::Column::DonationsCount).add(delta.count),
                )
                .col_expr(
                    campaign::Column::AmountRaised,
                    Expr::col(campaign::Column::AmountRaised).add(delta.amount),
                )
                .col_expr(campaign::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(campaign::Column::Id.eq(donation.campaign_id))
                .exec(&txn)
                .await?;
            if updated.rows_affected == 0 {
                txn.rollback().await?;
                return Err(ServiceError::NotFound(format!(
                    "Campaign {} not found",
                    donation.campaign_id
                )));
            }
            debug!(
                donation_id = donation.id,
                campaign_id = donation.campaign_id,
                count = delta.count,
                "Applied campaign counter delta"
            );
        }

        txn.commit().await?;
        Ok(donation.clone())
    }
}
