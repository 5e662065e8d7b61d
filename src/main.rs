use actix_cors::Cors;
use actix_web::{middleware::Logger, web::Data, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use reqwest::Client;
use std::sync::Arc;

use newsfeed_billing::config::Config;
use newsfeed_billing::handlers;
use newsfeed_billing::services::{
    auth::UserDirectory,
    database::DatabaseService,
    google_auth::GoogleTokenSource,
    reconciliation::ReconciliationService,
    store::SubscriptionStore,
    verifier::{GooglePlayVerifier, ProviderVerifier},
};
use newsfeed_billing::tasks::{notification_listener::NotificationListener, transport::PubSubTransport};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let database = Arc::new(
        DatabaseService::new(&config.database)
            .await
            .context("Failed to initialize database")?,
    );

    let verification_client = Client::builder()
        .timeout(config.app.verification_timeout())
        .build()
        .context("Failed to build HTTP client")?;
    let tokens = GoogleTokenSource::new(verification_client.clone(), config.google.clone());
    let verifier = ProviderVerifier::new(GooglePlayVerifier::new(
        verification_client,
        config.google_play.clone(),
        tokens.clone(),
        config.app.verification_timeout(),
    ));

    let store: Arc<dyn SubscriptionStore> = database.clone();
    let users: Arc<dyn UserDirectory> = database;
    let service = Arc::new(ReconciliationService::new(
        store,
        Arc::new(verifier),
        config.app.clone(),
    ));

    let listener = match &config.pubsub {
        Some(pubsub) => {
            let pubsub_client = Client::builder()
                .timeout(pubsub.request_timeout())
                .build()
                .context("Failed to build Pub/Sub HTTP client")?;
            let transport = PubSubTransport::new(pubsub_client, pubsub.clone(), tokens.clone());
            let listener = Arc::new(NotificationListener::new(
                service.clone(),
                Arc::new(transport),
                pubsub.max_messages,
                pubsub.poll_interval(),
            ));
            listener.start();
            Some(listener)
        }
        None => {
            log::info!("Pub/Sub subscription not configured; notification listener disabled");
            None
        }
    };

    let service_data = Data::from(service);
    let users_data: Data<dyn UserDirectory> = Data::from(users);
    let listener_data = listener.clone().map(Data::from);

    let bind_address = format!("0.0.0.0:{}", config.port);
    log::info!("Starting subscription billing server on {}", bind_address);

    HttpServer::new(move || {
        let mut app = App::new()
            .wrap(Logger::default())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header(),
            )
            .app_data(service_data.clone())
            .app_data(users_data.clone());
        if let Some(listener) = &listener_data {
            app = app.app_data(listener.clone());
        }
        app.configure(handlers::configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    if let Some(listener) = listener {
        listener.stop(config.app.listener_shutdown_grace()).await;
    }

    log::info!("Server stopped");
    Ok(())
}
