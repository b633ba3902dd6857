use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::status::DonationStatus;
use crate::errors::ServiceError;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "donations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub campaign_id: i64,
    /// None for anonymous or guest donors
    pub donor_id: Option<i64>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    /// Gateway intent id of the payment currently collecting this donation
    pub payment_intent_id: Option<String>,
    pub status: DonationStatus,
    pub is_anonymous: bool,
    pub is_recurring: bool,
    pub recurring_frequency: Option<String>,
    pub donated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub refund_reason: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub metadata: Option<Json>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::campaign::Entity",
        from = "Column::CampaignId",
        to = "super::campaign::Column::Id"
    )]
    Campaign,
    #[sea_orm(has_many = "super::payment::Entity")]
    Payments,
}

impl Related<super::campaign::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Campaign.def()
    }
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Adjustment to a campaign's completed-donation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CounterDelta {
    pub count: i64,
    pub amount: Decimal,
}

impl CounterDelta {
    pub fn is_zero(&self) -> bool {
        self.count == 0
    }
}

/// Counter movement implied by a donation status change: +1 when entering
/// COMPLETED, -1 when leaving it, 0 otherwise.
pub fn counter_delta(old: DonationStatus, new: DonationStatus) -> i64 {
    match (old.is_completed(), new.is_completed()) {
        (false, true) => 1,
        (true, false) => -1,
        _ => 0,
    }
}

/// Result of applying a status to a donation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: DonationStatus,
    pub to: DonationStatus,
    pub delta: CounterDelta,
}

impl StatusChange {
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

impl Model {
    pub fn new(
        campaign_id: i64,
        amount: Decimal,
        currency: impl Into<String>,
        payment_method: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            campaign_id,
            donor_id: None,
            amount,
            currency: currency.into(),
            payment_method: payment_method.into(),
            payment_intent_id: None,
            status: DonationStatus::Pending,
            is_anonymous: false,
            is_recurring: false,
            recurring_frequency: None,
            donated_at: now,
            processed_at: None,
            completed_at: None,
            cancelled_at: None,
            refunded_at: None,
            failed_at: None,
            failure_reason: None,
            refund_reason: None,
            metadata: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Moves the donation to `new`, maintaining the timestamp invariants and
    /// returning the counter delta the caller must persist with it.
    /// Re-applying the current status changes nothing.
    pub fn apply_status(
        &mut self,
        new: DonationStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> StatusChange {
        let old = self.status;
        if old == new {
            return StatusChange {
                from: old,
                to: new,
                delta: CounterDelta::default(),
            };
        }

        let count = counter_delta(old, new);
        self.status = new;
        self.updated_at = now;

        if old == DonationStatus::Completed {
            self.completed_at = None;
        }
        if old == DonationStatus::Failed {
            self.failed_at = None;
            self.failure_reason = None;
        }

        match new {
            DonationStatus::Pending => {}
            DonationStatus::Processing => {
                self.processed_at.get_or_insert(now);
            }
            DonationStatus::Completed => {
                self.processed_at.get_or_insert(now);
                self.completed_at = Some(now);
            }
            DonationStatus::Failed => {
                self.failed_at = Some(now);
                self.failure_reason = reason;
            }
            DonationStatus::Cancelled => {
                self.cancelled_at.get_or_insert(now);
            }
            DonationStatus::Refunded => {
                self.refunded_at.get_or_insert(now);
                if reason.is_some() {
                    self.refund_reason = reason;
                }
            }
        }

        StatusChange {
            from: old,
            to: new,
            delta: CounterDelta {
                count,
                amount: self.amount * Decimal::from(count),
            },
        }
    }

    /// Amount is frozen once the donation leaves PENDING.
    pub fn set_amount(&mut self, amount: Decimal) -> Result<(), ServiceError> {
        if self.status != DonationStatus::Pending {
            return Err(ServiceError::invalid_transition(
                "donation",
                self.status.as_str(),
                "change amount of",
            ));
        }
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Donation amount must be positive".to_string(),
            ));
        }
        self.amount = amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Marks the donation deleted and returns the counter delta to apply.
    /// A second call is a no-op.
    pub fn soft_delete(&mut self, now: DateTime<Utc>) -> CounterDelta {
        if self.deleted_at.is_some() {
            return CounterDelta::default();
        }
        self.deleted_at = Some(now);
        self.updated_at = now;
        if self.status.is_completed() {
            CounterDelta {
                count: -1,
                amount: -self.amount,
            }
        } else {
            CounterDelta::default()
        }
    }
}
