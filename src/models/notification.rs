use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::receipt::{expiry_from_fields, parse_millis};
use crate::models::subscription::SubscriptionAction;

/// Provider notification-type codes for subscription events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    Recovered,
    Renewed,
    Canceled,
    Purchased,
    OnHold,
    InGracePeriod,
    Restarted,
    PriceChangeConfirmed,
    Deferred,
    Paused,
    PauseScheduleChanged,
    Revoked,
    Expired,
    Unknown(i64),
}

impl From<i64> for NotificationType {
    fn from(code: i64) -> Self {
        match code {
            1 => NotificationType::Recovered,
            2 => NotificationType::Renewed,
            3 => NotificationType::Canceled,
            4 => NotificationType::Purchased,
            5 => NotificationType::OnHold,
            6 => NotificationType::InGracePeriod,
            7 => NotificationType::Restarted,
            8 => NotificationType::PriceChangeConfirmed,
            9 => NotificationType::Deferred,
            10 => NotificationType::Paused,
            11 => NotificationType::PauseScheduleChanged,
            12 => NotificationType::Revoked,
            13 => NotificationType::Expired,
            other => NotificationType::Unknown(other),
        }
    }
}

/// State change a notification type asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Back to ACTIVE with tier and end date recomputed; the action is what the ledger records.
    Reactivate(SubscriptionAction),
    Cancel,
    Expire,
}

impl NotificationType {
    /// `None` means acknowledge without touching the subscription.
    pub fn transition(&self) -> Option<Transition> {
        match self {
            NotificationType::Recovered => Some(Transition::Reactivate(SubscriptionAction::Updated)),
            NotificationType::Renewed => Some(Transition::Reactivate(SubscriptionAction::Renewed)),
            NotificationType::Purchased => Some(Transition::Reactivate(SubscriptionAction::Created)),
            NotificationType::Restarted => Some(Transition::Reactivate(SubscriptionAction::Updated)),
            NotificationType::Canceled => Some(Transition::Cancel),
            NotificationType::Expired => Some(Transition::Expire),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub purchase_token: String,
    pub product_id: String,
    pub notification_type: NotificationType,
    pub package_name: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    /// Explicit entitlement expiry carried by the payload, if any.
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoidedPurchase {
    pub purchase_token: String,
    pub order_id: Option<String>,
    pub refund_type: Option<i64>,
    pub event_time: Option<DateTime<Utc>>,
}

/// Flat envelope that names the owning user directly.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectPurchase {
    pub user_id: i64,
    pub purchase_token: String,
    pub product_id: String,
    pub package_name: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillingNotification {
    Refund(VoidedPurchase),
    SubscriptionEvent(SubscriptionEvent),
    DirectPurchase(DirectPurchase),
    Test,
    /// Recognised envelope missing the fields needed to act on it.
    Incomplete(String),
    Unrecognized,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    package_name: Option<Value>,
    event_time_millis: Option<Value>,
    subscription_notification: Option<RawSubscriptionNotification>,
    voided_purchase_notification: Option<RawVoidedNotification>,
    voided_subscription_notification: Option<RawVoidedNotification>,
    test_notification: Option<Value>,
    purchase_token: Option<Value>,
    subscription_id: Option<Value>,
    user_id: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSubscriptionNotification {
    purchase_token: Option<Value>,
    subscription_id: Option<Value>,
    notification_type: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVoidedNotification {
    purchase_token: Option<Value>,
    order_id: Option<Value>,
    refund_type: Option<Value>,
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn integer(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl BillingNotification {
    pub fn classify(payload: &Value) -> BillingNotification {
        if !payload.is_object() {
            return BillingNotification::Unrecognized;
        }
        let envelope: RawEnvelope = match serde_json::from_value(payload.clone()) {
            Ok(envelope) => envelope,
            Err(_) => return BillingNotification::Unrecognized,
        };

        let package_name = text(envelope.package_name.as_ref());
        let event_time = envelope.event_time_millis.as_ref().and_then(parse_millis);
        let top_level_expiry = payload.as_object().and_then(expiry_from_fields);

        if let Some(voided) = envelope
            .voided_purchase_notification
            .or(envelope.voided_subscription_notification)
        {
            return match text(voided.purchase_token.as_ref()) {
                Some(purchase_token) => BillingNotification::Refund(VoidedPurchase {
                    purchase_token,
                    order_id: text(voided.order_id.as_ref()),
                    refund_type: integer(voided.refund_type.as_ref()),
                    event_time,
                }),
                None => BillingNotification::Incomplete(
                    "voided purchase notification without purchaseToken".to_string(),
                ),
            };
        }

        if let Some(event) = envelope.subscription_notification {
            let expiry = payload
                .get("subscriptionNotification")
                .and_then(Value::as_object)
                .and_then(expiry_from_fields)
                .or(top_level_expiry);
            let purchase_token = text(event.purchase_token.as_ref());
            let product_id = text(event.subscription_id.as_ref());
            return match (purchase_token, product_id) {
                (Some(purchase_token), Some(product_id)) => {
                    BillingNotification::SubscriptionEvent(SubscriptionEvent {
                        purchase_token,
                        product_id,
                        notification_type: integer(event.notification_type.as_ref())
                            .map(NotificationType::from)
                            .unwrap_or(NotificationType::Unknown(0)),
                        package_name,
                        event_time,
                        expiry,
                    })
                }
                _ => BillingNotification::Incomplete(
                    "subscription notification without purchaseToken or subscriptionId"
                        .to_string(),
                ),
            };
        }

        if envelope.test_notification.is_some() {
            return BillingNotification::Test;
        }

        let purchase_token = text(envelope.purchase_token.as_ref());
        let product_id = text(envelope.subscription_id.as_ref());
        let user_id = integer(envelope.user_id.as_ref());
        match (purchase_token, product_id, user_id) {
            (Some(purchase_token), Some(product_id), Some(user_id)) => {
                BillingNotification::DirectPurchase(DirectPurchase {
                    user_id,
                    purchase_token,
                    product_id,
                    package_name,
                    event_time,
                    expiry: top_level_expiry,
                })
            }
            (None, None, None) => BillingNotification::Unrecognized,
            _ => BillingNotification::Incomplete(
                "purchase notification requires purchaseToken, subscriptionId and userId"
                    .to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Applied,
    Ignored,
    Unmatched,
    Rejected,
}

/// Result of processing one notification. Only `Applied` and `Ignored` count as success;
/// every outcome is terminal for the transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationOutcome {
    pub success: bool,
    pub kind: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    pub message: String,
}

impl NotificationOutcome {
    pub fn applied(subscription_id: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            kind: OutcomeKind::Applied,
            subscription_id: Some(subscription_id.to_string()),
            message: message.into(),
        }
    }

    pub fn ignored(subscription_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            kind: OutcomeKind::Ignored,
            subscription_id: subscription_id.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn unmatched(message: impl Into<String>) -> Self {
        Self {
            success: false,
            kind: OutcomeKind::Unmatched,
            subscription_id: None,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            kind: OutcomeKind::Rejected,
            subscription_id: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("wrapped payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Parses a transport message body, unwrapping a `{"message": {"data": <base64>}}` envelope.
pub fn decode_payload(body: &[u8]) -> Result<Value, DecodeError> {
    let outer: Value = serde_json::from_slice(body)?;
    match outer
        .get("message")
        .and_then(|message| message.get("data"))
        .and_then(Value::as_str)
    {
        Some(encoded) => {
            let inner = general_purpose::STANDARD.decode(encoded.trim())?;
            Ok(serde_json::from_slice(&inner)?)
        }
        None => Ok(outer),
    }
}
