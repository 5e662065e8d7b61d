use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

use crate::errors::SubscriptionError;

/// Entitlement level granted by a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Free,
    Pro,
    Analyst,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Pro, Tier::Analyst];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "FREE",
            Tier::Pro => "PRO",
            Tier::Analyst => "ANALYST",
        }
    }

    /// Case-insensitive name lookup. Anything unrecognised is `Free`.
    pub fn from_name(value: &str) -> Tier {
        let value = value.trim();
        Tier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(value))
            .unwrap_or(Tier::Free)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
    Pending,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Cancelled => "CANCELLED",
            SubscriptionStatus::Expired => "EXPIRED",
            SubscriptionStatus::Pending => "PENDING",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled | SubscriptionStatus::Expired)
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "CANCELLED" => Ok(SubscriptionStatus::Cancelled),
            "EXPIRED" => Ok(SubscriptionStatus::Expired),
            "PENDING" => Ok(SubscriptionStatus::Pending),
            other => Err(format!("unknown subscription status: {}", other)),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionAction {
    Created,
    Updated,
    Cancelled,
    Expired,
    Renewed,
}

impl SubscriptionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionAction::Created => "CREATED",
            SubscriptionAction::Updated => "UPDATED",
            SubscriptionAction::Cancelled => "CANCELLED",
            SubscriptionAction::Expired => "EXPIRED",
            SubscriptionAction::Renewed => "RENEWED",
        }
    }
}

impl FromStr for SubscriptionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(SubscriptionAction::Created),
            "UPDATED" => Ok(SubscriptionAction::Updated),
            "CANCELLED" => Ok(SubscriptionAction::Cancelled),
            "EXPIRED" => Ok(SubscriptionAction::Expired),
            "RENEWED" => Ok(SubscriptionAction::Renewed),
            other => Err(format!("unknown history action: {}", other)),
        }
    }
}

/// Billing channel that issued a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    GooglePlay,
    Apple,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GooglePlay => "google_play",
            Provider::Apple => "apple",
        }
    }

    pub fn platform(&self) -> &'static str {
        match self {
            Provider::GooglePlay => "android",
            Provider::Apple => "ios",
        }
    }

    /// Accepts provider names as well as the client platform aliases.
    pub fn parse(value: &str) -> Result<Provider, SubscriptionError> {
        match value.trim().to_lowercase().as_str() {
            "google_play" | "android" => Ok(Provider::GooglePlay),
            "apple" | "app_store" | "ios" => Ok(Provider::Apple),
            other => Err(SubscriptionError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target state computed from a verified receipt or a billing notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub tier: Tier,
    pub product_id: String,
    pub provider: Provider,
    pub receipt_data: Option<String>,
    pub purchase_token: Option<String>,
    pub end_date: DateTime<Utc>,
    pub auto_renew: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub external_id: String,
    pub user_id: i64,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub platform: String,
    pub provider: Provider,
    pub product_id: String,
    pub receipt_data: Option<String>,
    pub purchase_token: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub auto_renew: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(user_id: i64, grant: Grant, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: format!("sub_{}", Uuid::new_v4().simple()),
            user_id,
            tier: grant.tier,
            status: SubscriptionStatus::Active,
            platform: grant.provider.platform().to_string(),
            provider: grant.provider,
            product_id: grant.product_id,
            receipt_data: grant.receipt_data,
            purchase_token: grant.purchase_token,
            start_date: now,
            end_date: grant.end_date,
            auto_renew: grant.auto_renew,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrites the entitlement fields with the grant and marks the row active.
    /// Correlation data is only replaced when the grant carries some.
    pub fn apply_grant(&mut self, grant: Grant, now: DateTime<Utc>) {
        self.tier = grant.tier;
        self.status = SubscriptionStatus::Active;
        self.platform = grant.provider.platform().to_string();
        self.provider = grant.provider;
        self.product_id = grant.product_id;
        if grant.receipt_data.is_some() {
            self.receipt_data = grant.receipt_data;
        }
        if grant.purchase_token.is_some() {
            self.purchase_token = grant.purchase_token;
        }
        self.end_date = grant.end_date;
        self.auto_renew = grant.auto_renew;
        self.updated_at = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = SubscriptionStatus::Cancelled;
        self.auto_renew = false;
        self.updated_at = now;
    }

    pub fn expire(&mut self, now: DateTime<Utc>) {
        self.status = SubscriptionStatus::Expired;
        self.updated_at = now;
    }

    pub fn is_entitled(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.end_date > now
    }

    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        self.end_date.signed_duration_since(now).num_days()
    }

    pub fn to_status_response(&self, now: DateTime<Utc>) -> SubscriptionStatusResponse {
        SubscriptionStatusResponse {
            subscription_id: self.external_id.clone(),
            user_id: self.user_id,
            tier: self.tier,
            status: self.status,
            platform: self.platform.clone(),
            provider: self.provider,
            product_id: self.product_id.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            days_until_expiry: self.days_until_expiry(now),
            auto_renew: self.auto_renew,
            updated_at: self.updated_at,
        }
    }
}

/// Append-only audit row; one per state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionHistory {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub action: SubscriptionAction,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionHistory {
    pub fn new(
        subscription_id: Uuid,
        action: SubscriptionAction,
        details: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            action,
            details: details.into(),
            created_at: now,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubscriptionRequest {
    #[validate(length(min = 1, max = 255, message = "product_id must not be empty"))]
    pub product_id: String,

    #[validate(length(min = 1, max = 50, message = "platform must not be empty"))]
    pub platform: String,

    pub receipt_data: Option<serde_json::Map<String, serde_json::Value>>,
    pub auto_renew: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionCreatedResponse {
    pub message: String,
    pub subscription_id: String,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ReceiptVerificationResponse {
    pub verified: bool,
    pub subscription_id: String,
    pub tier: Tier,
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitlementResult {
    pub has_subscription: bool,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_renew: Option<bool>,
}

impl EntitlementResult {
    pub fn entitled(subscription: &Subscription) -> Self {
        Self {
            has_subscription: true,
            tier: subscription.tier,
            message: None,
            subscription_id: Some(subscription.external_id.clone()),
            platform: Some(subscription.platform.clone()),
            start_date: Some(subscription.start_date),
            end_date: Some(subscription.end_date),
            expired_date: None,
            auto_renew: Some(subscription.auto_renew),
        }
    }

    pub fn lapsed(subscription: &Subscription) -> Self {
        Self {
            expired_date: Some(subscription.end_date),
            ..Self::none("Subscription has expired")
        }
    }

    pub fn none(message: &str) -> Self {
        Self {
            has_subscription: false,
            tier: Tier::Free,
            message: Some(message.to_string()),
            subscription_id: None,
            platform: None,
            start_date: None,
            end_date: None,
            expired_date: None,
            auto_renew: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancellationResult {
    pub message: String,
    pub subscription_id: String,
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionStatusResponse {
    pub subscription_id: String,
    pub user_id: i64,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub platform: String,
    pub provider: Provider,
    pub product_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub days_until_expiry: i64,
    pub auto_renew: bool,
    pub updated_at: DateTime<Utc>,
}
