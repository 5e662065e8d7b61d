use actix_web::web::Data;
use actix_web::HttpResponse;
use chrono::Utc;
use serde::Serialize;

use crate::models::common::ApiResponse;
use crate::services::reconciliation::ReconciliationService;
use crate::tasks::notification_listener::NotificationListener;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub store: &'static str,
    pub listener: &'static str,
    pub timestamp: String,
}

pub async fn health_check(
    service: Data<ReconciliationService>,
    listener: Option<Data<NotificationListener>>,
) -> HttpResponse {
    let store_up = match service.health_check().await {
        Ok(()) => true,
        Err(e) => {
            log::error!("Store health check failed: {}", e);
            false
        }
    };

    let status = HealthStatus {
        store: if store_up { "up" } else { "down" },
        listener: match listener {
            Some(listener) if listener.is_running() => "running",
            Some(_) => "stopped",
            None => "disabled",
        },
        timestamp: Utc::now().to_rfc3339(),
    };

    if store_up {
        HttpResponse::Ok().json(ApiResponse::success_with_message(status, "healthy"))
    } else {
        HttpResponse::ServiceUnavailable().json(ApiResponse::failure(status, "unhealthy"))
    }
}
