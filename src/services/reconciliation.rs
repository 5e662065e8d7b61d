use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::config::AppConfig;
use crate::errors::SubscriptionError;
use crate::models::notification::{
    BillingNotification, DirectPurchase, NotificationOutcome, SubscriptionEvent, Transition,
    VoidedPurchase,
};
use crate::models::receipt::{Receipt, VerificationResult};
use crate::models::subscription::{
    CancellationResult, EntitlementResult, Grant, Provider, Subscription, SubscriptionAction,
    SubscriptionHistory,
};
use crate::services::store::{SubscriptionChange, SubscriptionStore};
use crate::services::tier;
use crate::services::verifier::ReceiptVerifier;

/// Converges stored entitlement with what clients and billing providers report.
///
/// Every mutation recomputes the full target state from its input and commits the
/// subscription row together with exactly one history row.
#[derive(Clone)]
pub struct ReconciliationService {
    store: Arc<dyn SubscriptionStore>,
    verifier: Arc<dyn ReceiptVerifier>,
    settings: AppConfig,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        verifier: Arc<dyn ReceiptVerifier>,
        settings: AppConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            settings,
        }
    }

    pub async fn health_check(&self) -> Result<(), SubscriptionError> {
        self.store_call(self.store.health_check()).await
    }

    pub async fn subscriptions_for_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<Subscription>, SubscriptionError> {
        self.store_call(self.store.subscriptions_for_user(user_id))
            .await
    }

    /// Grants `product_id` to the user, verifying `receipt` first when one is given.
    pub async fn create_or_update_subscription(
        &self,
        user_id: i64,
        product_id: &str,
        provider: &str,
        receipt: Option<Receipt>,
        auto_renew: bool,
    ) -> Result<Subscription, SubscriptionError> {
        let provider = Provider::parse(provider)?;
        let product_id = product_id.trim();
        if product_id.is_empty() {
            return Err(SubscriptionError::BadRequest(
                "product_id is required".to_string(),
            ));
        }

        let now = Utc::now();
        let mut grant = Grant {
            tier: tier::resolve(product_id),
            product_id: product_id.to_string(),
            provider,
            receipt_data: None,
            purchase_token: None,
            end_date: self.default_end_date(now),
            auto_renew,
        };

        if let Some(receipt) = receipt {
            let verification = self.verify_receipt(provider, &receipt).await?;
            if !verification.verified {
                log::warn!(
                    "Receipt for user {} product {} was not confirmed by {}",
                    user_id,
                    product_id,
                    provider
                );
                return Err(SubscriptionError::ReceiptRejected(format!(
                    "purchase of {} is not in a paid state",
                    product_id
                )));
            }

            if verification.product_id != product_id {
                log::warn!(
                    "Receipt for user {} names {} instead of requested {}",
                    user_id,
                    verification.product_id,
                    product_id
                );
            }
            grant.tier = verification.tier;
            grant.product_id = verification.product_id;
            if let Some(expiry) = verification.expiry.or_else(|| receipt.expiry()) {
                grant.end_date = expiry;
            }
            grant.purchase_token = Some(verification.purchase_token);
            grant.receipt_data = Some(receipt.to_json_string());
        }

        self.upsert_active(user_id, grant, now).await
    }

    /// Answers whether the user is entitled right now, expiring a lapsed ACTIVE row on sight.
    pub async fn verify_entitlement(
        &self,
        user_id: i64,
    ) -> Result<EntitlementResult, SubscriptionError> {
        let now = Utc::now();

        if let Some(subscription) = self
            .store_call(self.store.find_entitled(user_id, now))
            .await?
        {
            return Ok(EntitlementResult::entitled(&subscription));
        }

        let Some(mut lapsed) = self.store_call(self.store.find_lapsed(user_id, now)).await? else {
            return Ok(EntitlementResult::none("No active subscription found"));
        };

        let previous_status = lapsed.status;
        lapsed.expire(now);
        let history = SubscriptionHistory::new(
            lapsed.id,
            SubscriptionAction::Expired,
            format!("Expired on entitlement check; end date {}", lapsed.end_date.to_rfc3339()),
            now,
        );
        let expired = self
            .commit(SubscriptionChange::update(previous_status, lapsed, history))
            .await?;

        log::info!(
            "Expired subscription {} for user {} (ended {})",
            expired.external_id,
            user_id,
            expired.end_date
        );
        Ok(EntitlementResult::lapsed(&expired))
    }

    pub async fn cancel_subscription(
        &self,
        user_id: i64,
    ) -> Result<CancellationResult, SubscriptionError> {
        let now = Utc::now();
        let mut subscription = self
            .store_call(self.store.find_active(user_id))
            .await?
            .ok_or_else(|| SubscriptionError::NotFound("No active subscription found".to_string()))?;

        let previous_status = subscription.status;
        subscription.cancel(now);
        let history = SubscriptionHistory::new(
            subscription.id,
            SubscriptionAction::Cancelled,
            "Cancelled by user",
            now,
        );
        let cancelled = self
            .commit(SubscriptionChange::update(previous_status, subscription, history))
            .await?;

        log::info!(
            "Cancelled subscription {} for user {}",
            cancelled.external_id,
            user_id
        );
        Ok(CancellationResult {
            message: "Subscription cancelled successfully".to_string(),
            subscription_id: cancelled.external_id,
            end_date: cancelled.end_date,
        })
    }

    /// Applies one provider notification. Safe to call repeatedly with the same payload.
    ///
    /// `Err` means the notification may succeed on redelivery; every `Ok` outcome is final.
    pub async fn process_notification(
        &self,
        payload: &Value,
    ) -> Result<NotificationOutcome, SubscriptionError> {
        let notification = BillingNotification::classify(payload);
        log::debug!("Classified billing notification: {:?}", notification);

        match notification {
            BillingNotification::SubscriptionEvent(event) => {
                self.apply_subscription_event(event).await
            }
            BillingNotification::Refund(voided) => self.apply_refund(voided).await,
            BillingNotification::DirectPurchase(purchase) => {
                self.apply_direct_purchase(purchase).await
            }
            BillingNotification::Test => {
                log::info!("Received test notification");
                Ok(NotificationOutcome::ignored(None, "Test notification acknowledged"))
            }
            BillingNotification::Incomplete(reason) => {
                log::warn!("Rejected billing notification: {}", reason);
                Ok(NotificationOutcome::rejected(reason))
            }
            BillingNotification::Unrecognized => {
                log::warn!("Rejected unrecognized billing notification");
                Ok(NotificationOutcome::rejected(
                    "Unrecognized notification payload",
                ))
            }
        }
    }

    async fn apply_subscription_event(
        &self,
        event: SubscriptionEvent,
    ) -> Result<NotificationOutcome, SubscriptionError> {
        let Some(mut subscription) = self
            .store_call(self.store.find_by_purchase_token(&event.purchase_token, true))
            .await?
        else {
            log::warn!(
                "No active subscription matches {:?} notification for {}",
                event.notification_type,
                event.product_id
            );
            return Ok(NotificationOutcome::unmatched(
                "No active subscription matches the purchase token",
            ));
        };

        let Some(transition) = event.notification_type.transition() else {
            log::info!(
                "Notification {:?} for subscription {} requires no action",
                event.notification_type,
                subscription.external_id
            );
            return Ok(NotificationOutcome::ignored(
                Some(&subscription.external_id),
                format!("Notification type {:?} requires no action", event.notification_type),
            ));
        };

        let now = Utc::now();
        let previous_status = subscription.status;
        let history = match transition {
            Transition::Reactivate(action) => {
                let grant = Grant {
                    tier: tier::resolve(&event.product_id),
                    product_id: event.product_id.clone(),
                    provider: subscription.provider,
                    receipt_data: None,
                    purchase_token: Some(event.purchase_token.clone()),
                    end_date: match (event.expiry, event.event_time) {
                        (Some(expiry), _) => expiry,
                        (None, Some(event_time)) => self.default_end_date(event_time),
                        (None, None) => self.current_period_end(&subscription, now),
                    },
                    auto_renew: true,
                };
                subscription.apply_grant(grant, now);
                SubscriptionHistory::new(
                    subscription.id,
                    action,
                    format!(
                        "{:?} notification: tier {}, ends {}",
                        event.notification_type,
                        subscription.tier,
                        subscription.end_date.to_rfc3339()
                    ),
                    now,
                )
            }
            Transition::Cancel => {
                subscription.cancel(now);
                SubscriptionHistory::new(
                    subscription.id,
                    SubscriptionAction::Cancelled,
                    "Cancelled by provider notification",
                    now,
                )
            }
            Transition::Expire => {
                subscription.expire(now);
                SubscriptionHistory::new(
                    subscription.id,
                    SubscriptionAction::Expired,
                    "Expired by provider notification",
                    now,
                )
            }
        };

        let updated = self
            .commit(SubscriptionChange::update(previous_status, subscription, history))
            .await?;

        log::info!(
            "Applied {:?} to subscription {} (user {}): {} {}",
            event.notification_type,
            updated.external_id,
            updated.user_id,
            updated.tier,
            updated.status
        );
        Ok(NotificationOutcome::applied(
            &updated.external_id,
            format!("Subscription is {}", updated.status),
        ))
    }

    async fn apply_refund(
        &self,
        voided: VoidedPurchase,
    ) -> Result<NotificationOutcome, SubscriptionError> {
        let Some(mut subscription) = self
            .store_call(self.store.find_by_purchase_token(&voided.purchase_token, false))
            .await?
        else {
            log::warn!(
                "No subscription matches voided purchase (order {})",
                voided.order_id.as_deref().unwrap_or("unknown")
            );
            return Ok(NotificationOutcome::unmatched(
                "No subscription matches the voided purchase token",
            ));
        };

        let now = Utc::now();
        let previous_status = subscription.status;
        if !previous_status.is_terminal() {
            subscription.cancel(now);
        }

        let details = format!(
            "Purchase voided (order {}, refund type {})",
            voided.order_id.as_deref().unwrap_or("unknown"),
            voided
                .refund_type
                .map(|t| t.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        let history =
            SubscriptionHistory::new(subscription.id, SubscriptionAction::Cancelled, details, now);
        let updated = self
            .commit(SubscriptionChange::update(previous_status, subscription, history))
            .await?;

        log::info!(
            "Refund recorded for subscription {} (user {}), status {}",
            updated.external_id,
            updated.user_id,
            updated.status
        );
        Ok(NotificationOutcome::applied(
            &updated.external_id,
            "Subscription cancelled after refund",
        ))
    }

    async fn apply_direct_purchase(
        &self,
        purchase: DirectPurchase,
    ) -> Result<NotificationOutcome, SubscriptionError> {
        let now = Utc::now();
        let end_date = match (purchase.expiry, purchase.event_time) {
            (Some(expiry), _) => expiry,
            (None, Some(event_time)) => self.default_end_date(event_time),
            (None, None) => match self
                .store_call(self.store.find_by_purchase_token(&purchase.purchase_token, true))
                .await?
            {
                Some(current) if current.user_id == purchase.user_id => {
                    self.current_period_end(&current, now)
                }
                _ => self.default_end_date(now),
            },
        };
        let receipt_data = json!({
            "purchaseToken": purchase.purchase_token,
            "subscriptionId": purchase.product_id,
            "packageName": purchase.package_name,
        });
        let grant = Grant {
            tier: tier::resolve(&purchase.product_id),
            product_id: purchase.product_id.clone(),
            provider: Provider::GooglePlay,
            receipt_data: Some(receipt_data.to_string()),
            purchase_token: Some(purchase.purchase_token.clone()),
            end_date,
            auto_renew: true,
        };

        let subscription = self.upsert_active(purchase.user_id, grant, now).await?;
        Ok(NotificationOutcome::applied(
            &subscription.external_id,
            "Subscription updated from purchase notification",
        ))
    }

    /// Updates the user's ACTIVE row in place, or inserts one when there is none.
    ///
    /// A `Conflict` means another writer changed the user's rows between our read and
    /// commit; the write is recomputed once against fresh state.
    async fn upsert_active(
        &self,
        user_id: i64,
        grant: Grant,
        now: DateTime<Utc>,
    ) -> Result<Subscription, SubscriptionError> {
        match self.write_active(user_id, grant.clone(), now).await {
            Err(SubscriptionError::Conflict(reason)) => {
                log::warn!(
                    "Concurrent write for user {} ({}); retrying against fresh state",
                    user_id,
                    reason
                );
                self.write_active(user_id, grant, now).await
            }
            result => result,
        }
    }

    async fn write_active(
        &self,
        user_id: i64,
        grant: Grant,
        now: DateTime<Utc>,
    ) -> Result<Subscription, SubscriptionError> {
        if let Some(current) = self.store_call(self.store.find_active(user_id)).await? {
            return self.update_active(current, grant, now).await;
        }

        let subscription = Subscription::new(user_id, grant.clone(), now);
        let history = SubscriptionHistory::new(
            subscription.id,
            SubscriptionAction::Created,
            describe_grant(&grant),
            now,
        );

        let created = self
            .commit(SubscriptionChange::insert(subscription, history))
            .await?;
        log::info!(
            "Created subscription {} for user {}: {} until {}",
            created.external_id,
            user_id,
            created.tier,
            created.end_date
        );
        Ok(created)
    }

    async fn update_active(
        &self,
        mut current: Subscription,
        grant: Grant,
        now: DateTime<Utc>,
    ) -> Result<Subscription, SubscriptionError> {
        let previous_status = current.status;
        let details = describe_grant(&grant);
        current.apply_grant(grant, now);
        let history =
            SubscriptionHistory::new(current.id, SubscriptionAction::Updated, details, now);

        let updated = self
            .commit(SubscriptionChange::update(previous_status, current, history))
            .await?;
        log::info!(
            "Updated subscription {} for user {}: {} until {}",
            updated.external_id,
            updated.user_id,
            updated.tier,
            updated.end_date
        );
        Ok(updated)
    }

    async fn verify_receipt(
        &self,
        provider: Provider,
        receipt: &Receipt,
    ) -> Result<VerificationResult, SubscriptionError> {
        let timeout = self.settings.verification_timeout();
        tokio::time::timeout(timeout, self.verifier.verify(provider, receipt))
            .await
            .map_err(|_| SubscriptionError::Timeout("receipt verification", timeout))?
    }

    async fn commit(&self, change: SubscriptionChange) -> Result<Subscription, SubscriptionError> {
        self.store_call(self.store.commit(change)).await
    }

    async fn store_call<T, F>(&self, call: F) -> Result<T, SubscriptionError>
    where
        F: Future<Output = Result<T, SubscriptionError>>,
    {
        let timeout: StdDuration = self.settings.store_timeout();
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| SubscriptionError::Timeout("store", timeout))?
    }

    fn default_end_date(&self, anchor: DateTime<Utc>) -> DateTime<Utc> {
        anchor + Duration::days(self.settings.default_entitlement_days)
    }

    /// End of the default-length period containing `now`, counted from the row's
    /// `start_date`. Never earlier than the row's current `end_date`, so repeated
    /// deliveries within one period land on the same value.
    fn current_period_end(&self, subscription: &Subscription, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = Duration::days(self.settings.default_entitlement_days.max(1));
        let elapsed = (now - subscription.start_date).num_seconds().max(0);
        let periods = elapsed / window.num_seconds() + 1;
        let boundary = subscription.start_date + Duration::seconds(window.num_seconds() * periods);
        boundary.max(subscription.end_date)
    }
}

fn describe_grant(grant: &Grant) -> String {
    format!(
        "Tier {} via {} ({}), ends {}",
        grant.tier,
        grant.provider,
        grant.product_id,
        grant.end_date.to_rfc3339()
    )
}
