use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::GoogleConfig;

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: chrono::DateTime<Utc>,
}

/// Supplies OAuth bearer tokens for Google APIs, either a fixed token from
/// configuration or one fetched from the metadata server and cached until
/// shortly before it expires.
#[derive(Clone)]
pub struct GoogleTokenSource {
    client: Client,
    config: GoogleConfig,
    access_token: Arc<RwLock<Option<AccessToken>>>,
}

impl GoogleTokenSource {
    pub fn new(client: Client, config: GoogleConfig) -> Self {
        Self {
            client,
            config,
            access_token: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn access_token(&self) -> Result<String> {
        if let Some(token) = &self.config.access_token {
            return Ok(token.clone());
        }

        {
            let token_guard = self.access_token.read().await;
            if let Some(token) = &*token_guard {
                if token.expires_at > Utc::now() + Duration::minutes(5) {
                    return Ok(token.token.clone());
                }
            }
        }

        log::info!("Requesting new Google access token");

        let response = self
            .client
            .get(&self.config.token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Token request failed with {}: {}",
                status,
                error_text
            ));
        }

        let auth_response: Value = response.json().await?;

        let access_token = auth_response["access_token"]
            .as_str()
            .ok_or_else(|| anyhow!("No access_token in response"))?;

        let expires_in = auth_response["expires_in"].as_i64().unwrap_or(3600);

        {
            let mut token_guard = self.access_token.write().await;
            *token_guard = Some(AccessToken {
                token: access_token.to_string(),
                expires_at: Utc::now() + Duration::seconds(expires_in),
            });
        }

        log::info!("Successfully obtained Google access token");
        Ok(access_token.to_string())
    }
}
