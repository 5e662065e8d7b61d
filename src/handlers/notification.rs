use actix_web::web::{Bytes, Data};
use actix_web::{post, HttpResponse};

use crate::models::notification::{decode_payload, NotificationOutcome};
use crate::services::reconciliation::ReconciliationService;

/// Pub/Sub push delivery. Any 2xx acknowledges the message; a 5xx asks for redelivery.
#[post("/pubsub")]
pub async fn pubsub_push(service: Data<ReconciliationService>, body: Bytes) -> HttpResponse {
    let payload = match decode_payload(&body) {
        Ok(payload) => payload,
        Err(e) => {
            log::error!("Dropping undecodable push message: {}", e);
            return HttpResponse::Ok().json(NotificationOutcome::rejected(e.to_string()));
        }
    };

    match service.process_notification(&payload).await {
        Ok(outcome) => {
            if !outcome.success {
                log::warn!("Push notification not applied: {}", outcome.message);
            }
            HttpResponse::Ok().json(outcome)
        }
        Err(e) => {
            log::error!("Push notification failed, requesting redelivery: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Notification processing failed",
                "message": e.to_string()
            }))
        }
    }
}
