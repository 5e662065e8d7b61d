pub mod health;
pub mod notification;
pub mod subscription;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::scope("/subscriptions")
                    .service(subscription::create_subscription)
                    .service(subscription::list_subscriptions)
                    .service(subscription::verify_subscription)
                    .service(subscription::verify_subscription_post)
                    .service(subscription::cancel_subscription)
                    .service(subscription::verify_receipt),
            )
            .service(web::scope("/notifications").service(notification::pubsub_push))
            .route("/health", web::get().to(health::health_check)),
    );
}
