use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::SubscriptionError;
use crate::models::subscription::{Subscription, SubscriptionHistory, SubscriptionStatus};

/// One subscription write plus the audit row documenting it. Stores apply both
/// atomically or neither.
#[derive(Debug, Clone)]
pub enum SubscriptionChange {
    Insert {
        subscription: Subscription,
        history: SubscriptionHistory,
    },
    Update {
        previous_status: SubscriptionStatus,
        subscription: Subscription,
        history: SubscriptionHistory,
    },
}

impl SubscriptionChange {
    pub fn insert(subscription: Subscription, history: SubscriptionHistory) -> Self {
        SubscriptionChange::Insert {
            subscription,
            history,
        }
    }

    pub fn update(
        previous_status: SubscriptionStatus,
        subscription: Subscription,
        history: SubscriptionHistory,
    ) -> Self {
        SubscriptionChange::Update {
            previous_status,
            subscription,
            history,
        }
    }

    pub fn subscription(&self) -> &Subscription {
        match self {
            SubscriptionChange::Insert { subscription, .. }
            | SubscriptionChange::Update { subscription, .. } => subscription,
        }
    }

    pub fn history(&self) -> &SubscriptionHistory {
        match self {
            SubscriptionChange::Insert { history, .. }
            | SubscriptionChange::Update { history, .. } => history,
        }
    }
}

/// Persisted subscription state and its history ledger.
///
/// `commit` must reject an insert, or a transition into ACTIVE, when the user already
/// owns a different ACTIVE row; the rejection is reported as [`SubscriptionError::Conflict`].
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_active(&self, user_id: i64) -> Result<Option<Subscription>, SubscriptionError>;

    /// ACTIVE row whose `end_date` is still in the future.
    async fn find_entitled(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, SubscriptionError>;

    /// ACTIVE row whose `end_date` has passed but which nobody has marked EXPIRED yet.
    async fn find_lapsed(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, SubscriptionError>;

    /// Most recent row carrying `purchase_token`, optionally restricted to ACTIVE rows.
    async fn find_by_purchase_token(
        &self,
        purchase_token: &str,
        active_only: bool,
    ) -> Result<Option<Subscription>, SubscriptionError>;

    async fn subscriptions_for_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<Subscription>, SubscriptionError>;

    /// Ledger rows for one subscription, oldest first.
    async fn history(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionHistory>, SubscriptionError>;

    async fn commit(&self, change: SubscriptionChange) -> Result<Subscription, SubscriptionError>;

    async fn health_check(&self) -> Result<(), SubscriptionError>;
}
