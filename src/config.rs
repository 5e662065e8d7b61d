use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

const DEFAULT_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database: DatabaseConfig,
    pub google: GoogleConfig,
    pub google_play: GooglePlayConfig,
    pub pubsub: Option<PubSubConfig>,
    pub app: AppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleConfig {
    pub access_token: Option<String>,
    pub token_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationMode {
    Live,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GooglePlayConfig {
    pub package_name: String,
    pub api_url: String,
    pub mode: VerificationMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubConfig {
    pub project_id: String,
    pub subscription: String,
    pub api_url: String,
    pub max_messages: usize,
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub default_entitlement_days: i64,
    pub verification_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub listener_shutdown_grace_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let pubsub = match (env::var("PUBSUB_PROJECT_ID"), env::var("PUBSUB_SUBSCRIPTION")) {
            (Ok(project_id), Ok(subscription)) => Some(PubSubConfig {
                project_id,
                subscription,
                api_url: env::var("PUBSUB_API_URL")
                    .unwrap_or_else(|_| "https://pubsub.googleapis.com".to_string()),
                max_messages: parse_var("PUBSUB_MAX_MESSAGES", 10),
                poll_interval_ms: parse_var("PUBSUB_POLL_INTERVAL_MS", 1000),
                request_timeout_secs: parse_var("PUBSUB_REQUEST_TIMEOUT_SECS", 30),
            }),
            _ => None,
        };

        let mode = match env::var("GOOGLE_PLAY_VERIFICATION")
            .unwrap_or_else(|_| "offline".to_string())
            .to_lowercase()
            .as_str()
        {
            "live" => VerificationMode::Live,
            _ => VerificationMode::Offline,
        };

        Ok(Config {
            port: parse_var("PORT", 8080),

            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "memory://".to_string()),
                namespace: env::var("DATABASE_NAMESPACE")
                    .unwrap_or_else(|_| "newsfeed".to_string()),
                database: env::var("DATABASE_NAME").unwrap_or_else(|_| "billing".to_string()),
                username: env::var("DATABASE_USER").ok(),
                password: env::var("DATABASE_PASSWORD").ok(),
            },

            google: GoogleConfig {
                access_token: env::var("GOOGLE_ACCESS_TOKEN")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
                token_url: env::var("GOOGLE_TOKEN_URL")
                    .unwrap_or_else(|_| DEFAULT_TOKEN_URL.to_string()),
            },

            google_play: GooglePlayConfig {
                package_name: env::var("GOOGLE_PLAY_PACKAGE_NAME").unwrap_or_default(),
                api_url: env::var("GOOGLE_PLAY_API_URL")
                    .unwrap_or_else(|_| "https://androidpublisher.googleapis.com".to_string()),
                mode,
            },

            pubsub,

            app: AppConfig {
                default_entitlement_days: parse_var("DEFAULT_ENTITLEMENT_DAYS", 30),
                verification_timeout_secs: parse_var("VERIFICATION_TIMEOUT_SECS", 10),
                store_timeout_secs: parse_var("STORE_TIMEOUT_SECS", 5),
                listener_shutdown_grace_secs: parse_var("LISTENER_SHUTDOWN_GRACE_SECS", 5),
            },
        })
    }
}

impl AppConfig {
    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn listener_shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.listener_shutdown_grace_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_entitlement_days: 30,
            verification_timeout_secs: 10,
            store_timeout_secs: 5,
            listener_shutdown_grace_secs: 5,
        }
    }
}

impl PubSubConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Upper bound for one pull, acknowledge or deadline call.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
