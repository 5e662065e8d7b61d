use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::errors::SubscriptionError;
use crate::models::subscription::{Subscription, SubscriptionHistory, SubscriptionStatus};
use crate::services::auth::UserDirectory;
use crate::services::store::{SubscriptionChange, SubscriptionStore};

#[derive(Debug, Clone, Default)]
struct Tables {
    subscriptions: Vec<Subscription>,
    history: Vec<SubscriptionHistory>,
    fail_history_writes: bool,
}

impl Tables {
    fn active_conflict(&self, candidate: &Subscription) -> Option<&Subscription> {
        if candidate.status != SubscriptionStatus::Active {
            return None;
        }
        self.subscriptions.iter().find(|s| {
            s.user_id == candidate.user_id
                && s.status == SubscriptionStatus::Active
                && s.id != candidate.id
        })
    }

    fn append_history(&mut self, entry: SubscriptionHistory) -> Result<(), SubscriptionError> {
        if self.fail_history_writes {
            return Err(SubscriptionError::Store(
                "history table unavailable".to_string(),
            ));
        }
        self.history.push(entry);
        Ok(())
    }
}

/// Store kept entirely in process memory. Commits stage a copy of the tables and
/// swap it in only when every write succeeded.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    tokens: Arc<Mutex<HashMap<String, i64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_token(&self, token: &str, user_id: i64) {
        lock(&self.tokens).insert(token.to_string(), user_id);
    }

    /// Writes the row as-is, without a ledger entry. Used to seed fixtures.
    pub fn seed(&self, subscription: Subscription) {
        lock(&self.tables).subscriptions.push(subscription);
    }

    pub fn history_len(&self) -> usize {
        lock(&self.tables).history.len()
    }

    /// Makes every subsequent history append fail, to exercise rollback.
    pub fn fail_history_writes(&self, fail: bool) {
        lock(&self.tables).fail_history_writes = fail;
    }

    fn newest<F>(&self, predicate: F) -> Option<Subscription>
    where
        F: Fn(&Subscription) -> bool,
    {
        lock(&self.tables)
            .subscriptions
            .iter()
            .filter(|s| predicate(s))
            .max_by_key(|s| s.created_at)
            .cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn find_active(&self, user_id: i64) -> Result<Option<Subscription>, SubscriptionError> {
        Ok(self.newest(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active))
    }

    async fn find_entitled(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        Ok(self.newest(|s| {
            s.user_id == user_id && s.status == SubscriptionStatus::Active && s.end_date > now
        }))
    }

    async fn find_lapsed(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        Ok(self.newest(|s| {
            s.user_id == user_id && s.status == SubscriptionStatus::Active && s.end_date <= now
        }))
    }

    async fn find_by_purchase_token(
        &self,
        purchase_token: &str,
        active_only: bool,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        Ok(self.newest(|s| {
            s.purchase_token.as_deref() == Some(purchase_token)
                && (!active_only || s.status == SubscriptionStatus::Active)
        }))
    }

    async fn subscriptions_for_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<Subscription>, SubscriptionError> {
        let mut rows: Vec<Subscription> = lock(&self.tables)
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn history(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionHistory>, SubscriptionError> {
        Ok(lock(&self.tables)
            .history
            .iter()
            .filter(|h| h.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn commit(&self, change: SubscriptionChange) -> Result<Subscription, SubscriptionError> {
        let mut tables = lock(&self.tables);
        let mut staged = tables.clone();

        let subscription = match change {
            SubscriptionChange::Insert {
                subscription,
                history,
            } => {
                if let Some(existing) = staged.active_conflict(&subscription) {
                    return Err(SubscriptionError::Conflict(format!(
                        "user {} already has active subscription {}",
                        subscription.user_id, existing.external_id
                    )));
                }
                if staged.subscriptions.iter().any(|s| s.id == subscription.id) {
                    return Err(SubscriptionError::Conflict(format!(
                        "subscription {} already exists",
                        subscription.id
                    )));
                }
                staged.subscriptions.push(subscription.clone());
                staged.append_history(history)?;
                subscription
            }
            SubscriptionChange::Update {
                previous_status,
                subscription,
                history,
            } => {
                if let Some(existing) = staged.active_conflict(&subscription) {
                    return Err(SubscriptionError::Conflict(format!(
                        "user {} already has active subscription {}",
                        subscription.user_id, existing.external_id
                    )));
                }
                let row = staged
                    .subscriptions
                    .iter_mut()
                    .find(|s| s.id == subscription.id)
                    .ok_or_else(|| {
                        SubscriptionError::Store(format!(
                            "subscription {} does not exist",
                            subscription.id
                        ))
                    })?;
                if row.status != previous_status {
                    return Err(SubscriptionError::Conflict(format!(
                        "subscription {} is {}, expected {}",
                        subscription.external_id, row.status, previous_status
                    )));
                }
                *row = subscription.clone();
                staged.append_history(history)?;
                subscription
            }
        };

        *tables = staged;
        Ok(subscription)
    }

    async fn health_check(&self) -> Result<(), SubscriptionError> {
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn user_id_for_token(&self, token: &str) -> Result<Option<i64>, SubscriptionError> {
        Ok(lock(&self.tokens).get(token).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::subscription::{Grant, Provider, SubscriptionAction, Tier};
    use chrono::Duration;

    fn subscription(user_id: i64, token: &str) -> Subscription {
        Subscription::new(
            user_id,
            Grant {
                tier: Tier::Pro,
                product_id: "pro_plan_monthly".to_string(),
                provider: Provider::GooglePlay,
                receipt_data: None,
                purchase_token: Some(token.to_string()),
                end_date: Utc::now() + Duration::days(30),
                auto_renew: true,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = MemoryStore::new();
        let row = subscription(42, "tok-1");
        let history =
            SubscriptionHistory::new(row.id, SubscriptionAction::Created, "created", Utc::now());

        store
            .commit(SubscriptionChange::insert(row.clone(), history))
            .await
            .unwrap();

        let found = store.find_by_purchase_token("tok-1", true).await.unwrap();
        assert_eq!(found.map(|s| s.id), Some(row.id));
        assert!(store.find_by_purchase_token("tok", false).await.unwrap().is_none());
        assert_eq!(store.history(row.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_active_insert_conflicts() {
        let store = MemoryStore::new();
        let first = subscription(42, "tok-1");
        let second = subscription(42, "tok-2");

        store
            .commit(SubscriptionChange::insert(
                first.clone(),
                SubscriptionHistory::new(first.id, SubscriptionAction::Created, "", Utc::now()),
            ))
            .await
            .unwrap();

        let result = store
            .commit(SubscriptionChange::insert(
                second.clone(),
                SubscriptionHistory::new(second.id, SubscriptionAction::Created, "", Utc::now()),
            ))
            .await;

        assert!(matches!(result, Err(SubscriptionError::Conflict(_))));
        assert_eq!(store.subscriptions_for_user(42).await.unwrap().len(), 1);
        assert_eq!(store.history_len(), 1);
    }

    #[tokio::test]
    async fn test_failed_history_write_rolls_back_subscription() {
        let store = MemoryStore::new();
        store.fail_history_writes(true);
        let row = subscription(7, "tok-7");

        let result = store
            .commit(SubscriptionChange::insert(
                row.clone(),
                SubscriptionHistory::new(row.id, SubscriptionAction::Created, "", Utc::now()),
            ))
            .await;

        assert!(matches!(result, Err(SubscriptionError::Store(_))));
        assert!(store.find_active(7).await.unwrap().is_none());
        assert_eq!(store.history_len(), 0);
    }

    #[tokio::test]
    async fn test_update_from_stale_read_conflicts() {
        let store = MemoryStore::new();
        let row = subscription(42, "tok-1");
        store
            .commit(SubscriptionChange::insert(
                row.clone(),
                SubscriptionHistory::new(row.id, SubscriptionAction::Created, "", Utc::now()),
            ))
            .await
            .unwrap();

        let stale = store.find_active(42).await.unwrap().unwrap();

        let mut cancelled = stale.clone();
        cancelled.cancel(Utc::now());
        store
            .commit(SubscriptionChange::update(
                SubscriptionStatus::Active,
                cancelled,
                SubscriptionHistory::new(row.id, SubscriptionAction::Cancelled, "", Utc::now()),
            ))
            .await
            .unwrap();

        let result = store
            .commit(SubscriptionChange::update(
                stale.status,
                stale.clone(),
                SubscriptionHistory::new(row.id, SubscriptionAction::Updated, "", Utc::now()),
            ))
            .await;

        assert!(matches!(result, Err(SubscriptionError::Conflict(_))));
        let stored = store.find_by_purchase_token("tok-1", false).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);
        assert_eq!(store.history_len(), 2);
    }

    #[tokio::test]
    async fn test_token_directory() {
        let store = MemoryStore::new();
        store.register_token("session-abc", 42);
        assert_eq!(store.user_id_for_token("session-abc").await.unwrap(), Some(42));
        assert_eq!(store.user_id_for_token("other").await.unwrap(), None);
    }
}
