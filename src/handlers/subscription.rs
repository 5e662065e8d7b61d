use actix_web::web::{Data, Json, Query};
use actix_web::{get, post, HttpResponse};
use chrono::Utc;
use validator::Validate;

use crate::errors::SubscriptionError;
use crate::models::common::ApiResponse;
use crate::models::receipt::Receipt;
use crate::models::subscription::{
    CreateSubscriptionRequest, ReceiptVerificationResponse, SubscriptionCreatedResponse,
    SubscriptionStatusResponse, TokenQuery,
};
use crate::services::auth::{require_user, UserDirectory};
use crate::services::reconciliation::ReconciliationService;

#[post("")]
pub async fn create_subscription(
    service: Data<ReconciliationService>,
    users: Data<dyn UserDirectory>,
    query: Query<TokenQuery>,
    payload: Json<CreateSubscriptionRequest>,
) -> Result<HttpResponse, SubscriptionError> {
    let user_id = require_user(users.get_ref(), &query.token).await?;
    payload
        .validate()
        .map_err(|e| SubscriptionError::BadRequest(e.to_string()))?;

    let request = payload.into_inner();
    let subscription = service
        .create_or_update_subscription(
            user_id,
            &request.product_id,
            &request.platform,
            request.receipt_data.map(Receipt::new),
            request.auto_renew.unwrap_or(true),
        )
        .await?;

    Ok(HttpResponse::Created().json(SubscriptionCreatedResponse {
        message: "Subscription created successfully".to_string(),
        subscription_id: subscription.external_id,
        tier: subscription.tier,
        status: subscription.status,
        end_date: subscription.end_date,
    }))
}

#[get("")]
pub async fn list_subscriptions(
    service: Data<ReconciliationService>,
    users: Data<dyn UserDirectory>,
    query: Query<TokenQuery>,
) -> Result<HttpResponse, SubscriptionError> {
    let user_id = require_user(users.get_ref(), &query.token).await?;
    let now = Utc::now();
    let subscriptions: Vec<SubscriptionStatusResponse> = service
        .subscriptions_for_user(user_id)
        .await?
        .iter()
        .map(|s| s.to_status_response(now))
        .collect();

    Ok(HttpResponse::Ok().json(ApiResponse::success(subscriptions)))
}

#[get("/verify")]
pub async fn verify_subscription(
    service: Data<ReconciliationService>,
    users: Data<dyn UserDirectory>,
    query: Query<TokenQuery>,
) -> Result<HttpResponse, SubscriptionError> {
    let user_id = require_user(users.get_ref(), &query.token).await?;
    let entitlement = service.verify_entitlement(user_id).await?;
    Ok(HttpResponse::Ok().json(entitlement))
}

#[post("/verify")]
pub async fn verify_subscription_post(
    service: Data<ReconciliationService>,
    users: Data<dyn UserDirectory>,
    payload: Json<TokenQuery>,
) -> Result<HttpResponse, SubscriptionError> {
    let user_id = require_user(users.get_ref(), &payload.token).await?;
    let entitlement = service.verify_entitlement(user_id).await?;
    Ok(HttpResponse::Ok().json(entitlement))
}

#[post("/cancel")]
pub async fn cancel_subscription(
    service: Data<ReconciliationService>,
    users: Data<dyn UserDirectory>,
    query: Query<TokenQuery>,
) -> Result<HttpResponse, SubscriptionError> {
    let user_id = require_user(users.get_ref(), &query.token).await?;
    let cancelled = service.cancel_subscription(user_id).await?;
    Ok(HttpResponse::Ok().json(cancelled))
}

/// Verifies a raw store receipt and applies it. The receipt names its own `platform`.
#[post("/verify-receipt")]
pub async fn verify_receipt(
    service: Data<ReconciliationService>,
    users: Data<dyn UserDirectory>,
    query: Query<TokenQuery>,
    payload: Json<Receipt>,
) -> Result<HttpResponse, SubscriptionError> {
    let user_id = require_user(users.get_ref(), &query.token).await?;
    let receipt = payload.into_inner();

    let platform = receipt
        .platform()
        .ok_or_else(|| SubscriptionError::BadRequest("platform is required".to_string()))?
        .to_string();
    let product_id = receipt
        .product_id()
        .ok_or_else(|| SubscriptionError::MalformedReceipt("productId is required".to_string()))?
        .to_string();

    let subscription = service
        .create_or_update_subscription(user_id, &product_id, &platform, Some(receipt), true)
        .await?;

    Ok(HttpResponse::Ok().json(ReceiptVerificationResponse {
        verified: true,
        subscription_id: subscription.external_id,
        tier: subscription.tier,
        end_date: subscription.end_date,
    }))
}
