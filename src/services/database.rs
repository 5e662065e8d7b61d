use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use surrealdb::sql::Datetime;
use surrealdb::Surreal;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::errors::SubscriptionError;
use crate::models::subscription::{
    Provider, Subscription, SubscriptionAction, SubscriptionHistory, SubscriptionStatus, Tier,
};
use crate::services::auth::UserDirectory;
use crate::services::store::{SubscriptionChange, SubscriptionStore};

const SUBSCRIPTION_FIELDS: &str = "internal_id, external_id, user_id, tier, status, platform, \
     provider, product_id, receipt_data, purchase_token, start_date, end_date, auto_renew, \
     created_at, updated_at";

const HISTORY_FIELDS: &str = "internal_id, subscription_id, action, details, created_at";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubscriptionRecord {
    internal_id: String,
    external_id: String,
    user_id: i64,
    tier: String,
    status: String,
    platform: String,
    provider: String,
    product_id: String,
    receipt_data: Option<String>,
    purchase_token: Option<String>,
    start_date: Datetime,
    end_date: Datetime,
    auto_renew: bool,
    created_at: Datetime,
    updated_at: Datetime,
}

impl From<&Subscription> for SubscriptionRecord {
    fn from(subscription: &Subscription) -> Self {
        Self {
            internal_id: subscription.id.to_string(),
            external_id: subscription.external_id.clone(),
            user_id: subscription.user_id,
            tier: subscription.tier.as_str().to_string(),
            status: subscription.status.as_str().to_string(),
            platform: subscription.platform.clone(),
            provider: subscription.provider.as_str().to_string(),
            product_id: subscription.product_id.clone(),
            receipt_data: subscription.receipt_data.clone(),
            purchase_token: subscription.purchase_token.clone(),
            start_date: subscription.start_date.into(),
            end_date: subscription.end_date.into(),
            auto_renew: subscription.auto_renew,
            created_at: subscription.created_at.into(),
            updated_at: subscription.updated_at.into(),
        }
    }
}

impl TryFrom<SubscriptionRecord> for Subscription {
    type Error = SubscriptionError;

    fn try_from(record: SubscriptionRecord) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: parse_uuid(&record.internal_id)?,
            external_id: record.external_id,
            user_id: record.user_id,
            tier: Tier::from_name(&record.tier),
            status: record
                .status
                .parse::<SubscriptionStatus>()
                .map_err(SubscriptionError::Store)?,
            platform: record.platform,
            provider: Provider::parse(&record.provider)
                .map_err(|e| SubscriptionError::Store(e.to_string()))?,
            product_id: record.product_id,
            receipt_data: record.receipt_data,
            purchase_token: record.purchase_token,
            start_date: record.start_date.0,
            end_date: record.end_date.0,
            auto_renew: record.auto_renew,
            created_at: record.created_at.0,
            updated_at: record.updated_at.0,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryRecord {
    internal_id: String,
    subscription_id: String,
    action: String,
    details: String,
    created_at: Datetime,
}

impl From<&SubscriptionHistory> for HistoryRecord {
    fn from(entry: &SubscriptionHistory) -> Self {
        Self {
            internal_id: entry.id.to_string(),
            subscription_id: entry.subscription_id.to_string(),
            action: entry.action.as_str().to_string(),
            details: entry.details.clone(),
            created_at: entry.created_at.into(),
        }
    }
}

impl TryFrom<HistoryRecord> for SubscriptionHistory {
    type Error = SubscriptionError;

    fn try_from(record: HistoryRecord) -> Result<Self, Self::Error> {
        Ok(SubscriptionHistory {
            id: parse_uuid(&record.internal_id)?,
            subscription_id: parse_uuid(&record.subscription_id)?,
            action: record
                .action
                .parse::<SubscriptionAction>()
                .map_err(SubscriptionError::Store)?,
            details: record.details,
            created_at: record.created_at.0,
        })
    }
}

#[derive(Debug, Deserialize)]
struct UserRecord {
    user_id: i64,
}

fn parse_uuid(value: &str) -> Result<Uuid, SubscriptionError> {
    Uuid::parse_str(value)
        .map_err(|e| SubscriptionError::Store(format!("invalid stored id {}: {}", value, e)))
}

/// How a commit touches the per-user ACTIVE guard record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardOp {
    Claim,
    Release,
    Keep,
}

impl GuardOp {
    fn for_change(change: &SubscriptionChange) -> GuardOp {
        let now_active = change.subscription().status == SubscriptionStatus::Active;
        match change {
            SubscriptionChange::Insert { .. } if now_active => GuardOp::Claim,
            SubscriptionChange::Insert { .. } => GuardOp::Keep,
            SubscriptionChange::Update {
                previous_status, ..
            } => match (*previous_status == SubscriptionStatus::Active, now_active) {
                (false, true) => GuardOp::Claim,
                (true, false) => GuardOp::Release,
                _ => GuardOp::Keep,
            },
        }
    }

    fn statement(&self) -> &'static str {
        match self {
            GuardOp::Claim => {
                "CREATE type::thing('active_subscription', $user_id) \
                 CONTENT { subscription_id: $internal_id };"
            }
            GuardOp::Release => "DELETE type::thing('active_subscription', $user_id);",
            GuardOp::Keep => "",
        }
    }
}

const STALE_WRITE: &str = "stale subscription write";

/// Aborts an update whose stored status no longer matches the status it was read with.
const STATUS_PRECONDITION: &str = "\
    LET $current = (SELECT VALUE status FROM type::thing('subscriptions', $internal_id))[0];\n\
    IF $current != $previous_status { THROW 'stale subscription write' };";

fn is_uniqueness_violation(message: &str) -> bool {
    message.contains("already exists") || message.contains("already contains")
}

/// SurrealDB-backed subscription store and user directory.
#[derive(Clone)]
pub struct DatabaseService {
    db: Surreal<Any>,
}

impl DatabaseService {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, SubscriptionError> {
        let endpoint = match config.url.strip_prefix("memory://") {
            Some(_) => "mem://".to_string(),
            None => config.url.clone(),
        };

        let db = any::connect(endpoint).await?;

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            db.signin(Root {
                username: username.as_str(),
                password: password.as_str(),
            })
            .await?;
        }

        db.use_ns(config.namespace.as_str())
            .use_db(config.database.as_str())
            .await?;

        let service = Self { db };
        service.initialize_schema().await?;

        log::info!(
            "Connected to subscription store at {} ({}/{})",
            config.url,
            config.namespace,
            config.database
        );
        Ok(service)
    }

    async fn initialize_schema(&self) -> Result<(), SubscriptionError> {
        self.db
            .query(
                "
            DEFINE TABLE subscriptions SCHEMAFULL;
            DEFINE FIELD internal_id ON subscriptions TYPE string;
            DEFINE FIELD external_id ON subscriptions TYPE string;
            DEFINE FIELD user_id ON subscriptions TYPE int;
            DEFINE FIELD tier ON subscriptions TYPE string;
            DEFINE FIELD status ON subscriptions TYPE string;
            DEFINE FIELD platform ON subscriptions TYPE string;
            DEFINE FIELD provider ON subscriptions TYPE string;
            DEFINE FIELD product_id ON subscriptions TYPE string;
            DEFINE FIELD receipt_data ON subscriptions TYPE option<string>;
            DEFINE FIELD purchase_token ON subscriptions TYPE option<string>;
            DEFINE FIELD start_date ON subscriptions TYPE datetime;
            DEFINE FIELD end_date ON subscriptions TYPE datetime;
            DEFINE FIELD auto_renew ON subscriptions TYPE bool DEFAULT true;
            DEFINE FIELD created_at ON subscriptions TYPE datetime;
            DEFINE FIELD updated_at ON subscriptions TYPE datetime;
            DEFINE INDEX unique_external_id ON subscriptions COLUMNS external_id UNIQUE;
            DEFINE INDEX user_status ON subscriptions COLUMNS user_id, status;
            DEFINE INDEX purchase_token ON subscriptions COLUMNS purchase_token;
        ",
            )
            .await?
            .check()?;

        self.db
            .query(
                "
            DEFINE TABLE subscription_history SCHEMAFULL;
            DEFINE FIELD internal_id ON subscription_history TYPE string;
            DEFINE FIELD subscription_id ON subscription_history TYPE string;
            DEFINE FIELD action ON subscription_history TYPE string;
            DEFINE FIELD details ON subscription_history TYPE string;
            DEFINE FIELD created_at ON subscription_history TYPE datetime;
            DEFINE INDEX history_subscription ON subscription_history COLUMNS subscription_id;

            DEFINE TABLE active_subscription SCHEMAFULL;
            DEFINE FIELD subscription_id ON active_subscription TYPE string;

            DEFINE TABLE users SCHEMAFULL;
            DEFINE FIELD user_id ON users TYPE int;
            DEFINE FIELD auth_token ON users TYPE string;
            DEFINE INDEX unique_auth_token ON users COLUMNS auth_token UNIQUE;
        ",
            )
            .await?
            .check()?;

        log::info!("Database schema initialized successfully");
        Ok(())
    }

    /// Associates an authentication token with a user.
    pub async fn register_user(&self, user_id: i64, auth_token: &str) -> Result<(), SubscriptionError> {
        self.db
            .query("CREATE users CONTENT { user_id: $user_id, auth_token: $auth_token }")
            .bind(("user_id", user_id))
            .bind(("auth_token", auth_token.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    async fn select_one(
        &self,
        condition: &str,
        bindings: Vec<(&'static str, surrealdb::sql::Value)>,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE {} ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_FIELDS, condition
        );
        let mut query = self.db.query(sql);
        for binding in bindings {
            query = query.bind(binding);
        }
        let records: Vec<SubscriptionRecord> = query.await?.take(0)?;
        records.into_iter().next().map(Subscription::try_from).transpose()
    }
}

#[async_trait]
impl SubscriptionStore for DatabaseService {
    async fn find_active(&self, user_id: i64) -> Result<Option<Subscription>, SubscriptionError> {
        self.select_one(
            "user_id = $user_id AND status = 'ACTIVE'",
            vec![("user_id", user_id.into())],
        )
        .await
    }

    async fn find_entitled(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        self.select_one(
            "user_id = $user_id AND status = 'ACTIVE' AND end_date > $now",
            vec![("user_id", user_id.into()), ("now", Datetime::from(now).into())],
        )
        .await
    }

    async fn find_lapsed(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        self.select_one(
            "user_id = $user_id AND status = 'ACTIVE' AND end_date <= $now",
            vec![("user_id", user_id.into()), ("now", Datetime::from(now).into())],
        )
        .await
    }

    async fn find_by_purchase_token(
        &self,
        purchase_token: &str,
        active_only: bool,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let condition = if active_only {
            "purchase_token = $purchase_token AND status = 'ACTIVE'"
        } else {
            "purchase_token = $purchase_token"
        };
        self.select_one(condition, vec![("purchase_token", purchase_token.into())])
            .await
    }

    async fn subscriptions_for_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<Subscription>, SubscriptionError> {
        let records: Vec<SubscriptionRecord> = self
            .db
            .query(format!(
                "SELECT {} FROM subscriptions WHERE user_id = $user_id ORDER BY created_at DESC",
                SUBSCRIPTION_FIELDS
            ))
            .bind(("user_id", user_id))
            .await?
            .take(0)?;
        records.into_iter().map(Subscription::try_from).collect()
    }

    async fn history(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionHistory>, SubscriptionError> {
        let records: Vec<HistoryRecord> = self
            .db
            .query(format!(
                "SELECT {} FROM subscription_history WHERE subscription_id = $subscription_id \
                 ORDER BY created_at ASC",
                HISTORY_FIELDS
            ))
            .bind(("subscription_id", subscription_id.to_string()))
            .await?
            .take(0)?;
        records.into_iter().map(SubscriptionHistory::try_from).collect()
    }

    async fn commit(&self, change: SubscriptionChange) -> Result<Subscription, SubscriptionError> {
        let guard = GuardOp::for_change(&change);
        let (precondition, write, previous_status) = match &change {
            SubscriptionChange::Insert { .. } => (
                "",
                "CREATE type::thing('subscriptions', $internal_id) CONTENT $record;",
                None,
            ),
            SubscriptionChange::Update {
                previous_status, ..
            } => (
                STATUS_PRECONDITION,
                "UPDATE type::thing('subscriptions', $internal_id) CONTENT $record;",
                Some(previous_status.as_str()),
            ),
        };

        let sql = format!(
            "BEGIN TRANSACTION;\n{}\n{}\n{}\n\
             CREATE type::thing('subscription_history', $history_id) CONTENT $history;\n\
             COMMIT TRANSACTION;",
            precondition,
            guard.statement(),
            write
        );

        let subscription = change.subscription().clone();
        let history = change.history();

        let mut response = self
            .db
            .query(sql)
            .bind(("user_id", subscription.user_id))
            .bind(("internal_id", subscription.id.to_string()))
            .bind(("record", SubscriptionRecord::from(&subscription)))
            .bind(("history_id", history.id.to_string()))
            .bind(("history", HistoryRecord::from(history)))
            .bind(("previous_status", previous_status.unwrap_or_default()))
            .await?;

        let errors = response.take_errors();
        if errors.is_empty() {
            return Ok(subscription);
        }

        let messages: Vec<String> = errors.into_values().map(|e| e.to_string()).collect();
        if messages.iter().any(|m| m.contains(STALE_WRITE)) {
            return Err(SubscriptionError::Conflict(format!(
                "subscription {} changed since it was read",
                subscription.external_id
            )));
        }
        if messages.iter().any(|m| is_uniqueness_violation(m)) {
            return Err(SubscriptionError::Conflict(format!(
                "user {} already has an active subscription",
                subscription.user_id
            )));
        }
        Err(SubscriptionError::Store(messages.join("; ")))
    }

    async fn health_check(&self) -> Result<(), SubscriptionError> {
        self.db.health().await?;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for DatabaseService {
    async fn user_id_for_token(&self, token: &str) -> Result<Option<i64>, SubscriptionError> {
        let users: Vec<UserRecord> = self
            .db
            .query("SELECT user_id FROM users WHERE auth_token = $token LIMIT 1")
            .bind(("token", token.to_string()))
            .await?
            .take(0)?;
        Ok(users.first().map(|u| u.user_id))
    }
}
