use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::PubSubConfig;
use crate::services::google_auth::GoogleTokenSource;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport authentication failed: {0}")]
    Auth(String),

    #[error("transport request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("transport returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// One delivered message. `data` is the raw body as the publisher sent it, or empty
/// when the transport could not unwrap it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub ack_id: String,
    pub message_id: String,
    pub data: Vec<u8>,
}

/// At-least-once message source with explicit settlement. A message that is neither
/// acked nor nacked is redelivered once its lease runs out.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn pull(&self, max_messages: usize) -> Result<Vec<TransportMessage>, TransportError>;

    async fn ack(&self, ack_id: &str) -> Result<(), TransportError>;

    /// Releases the message for immediate redelivery.
    async fn nack(&self, ack_id: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubSubMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubSubMessage {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    message_id: String,
}

/// Google Cloud Pub/Sub pull subscription over the REST API.
pub struct PubSubTransport {
    client: Client,
    config: PubSubConfig,
    tokens: GoogleTokenSource,
}

impl PubSubTransport {
    pub fn new(client: Client, config: PubSubConfig, tokens: GoogleTokenSource) -> Self {
        Self {
            client,
            config,
            tokens,
        }
    }

    fn subscription_url(&self, verb: &str) -> String {
        format!(
            "{}/v1/projects/{}/subscriptions/{}:{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.project_id,
            self.config.subscription,
            verb
        )
    }

    async fn post(&self, verb: &str, body: serde_json::Value) -> Result<reqwest::Response, TransportError> {
        let access_token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| TransportError::Auth(e.to_string()))?;

        let response = self
            .client
            .post(self.subscription_url(verb))
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl NotificationTransport for PubSubTransport {
    async fn pull(&self, max_messages: usize) -> Result<Vec<TransportMessage>, TransportError> {
        let response = self
            .post("pull", json!({ "maxMessages": max_messages }))
            .await?;
        let pulled: PullResponse = response.json().await?;

        Ok(pulled
            .received_messages
            .into_iter()
            .map(|received| {
                let message_id = received.message.message_id;
                let data = match received.message.data {
                    Some(encoded) => match general_purpose::STANDARD.decode(encoded.as_bytes()) {
                        Ok(data) => data,
                        Err(e) => {
                            // An empty body fails payload decoding, so the listener drops it.
                            log::warn!("Message {} carries invalid base64 data: {}", message_id, e);
                            Vec::new()
                        }
                    },
                    None => Vec::new(),
                };
                TransportMessage {
                    ack_id: received.ack_id,
                    message_id,
                    data,
                }
            })
            .collect())
    }

    async fn ack(&self, ack_id: &str) -> Result<(), TransportError> {
        self.post("acknowledge", json!({ "ackIds": [ack_id] })).await?;
        Ok(())
    }

    async fn nack(&self, ack_id: &str) -> Result<(), TransportError> {
        self.post(
            "modifyAckDeadline",
            json!({ "ackIds": [ack_id], "ackDeadlineSeconds": 0 }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GoogleConfig;
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(api_url: String) -> PubSubTransport {
        let client = Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        let tokens = GoogleTokenSource::new(
            client.clone(),
            GoogleConfig {
                access_token: Some("pubsub-token".to_string()),
                token_url: "http://127.0.0.1:9/token".to_string(),
            },
        );
        PubSubTransport::new(
            client,
            PubSubConfig {
                project_id: "newsfeed".to_string(),
                subscription: "billing-events".to_string(),
                api_url,
                max_messages: 10,
                poll_interval_ms: 100,
                request_timeout_secs: 1,
            },
            tokens,
        )
    }

    #[tokio::test]
    async fn test_pull_decodes_message_data() {
        let server = MockServer::start().await;
        let encoded = general_purpose::STANDARD.encode(r#"{"testNotification":{}}"#);
        Mock::given(method("POST"))
            .and(path("/v1/projects/newsfeed/subscriptions/billing-events:pull"))
            .and(header("authorization", "Bearer pubsub-token"))
            .and(body_json(json!({"maxMessages": 5})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "receivedMessages": [{
                    "ackId": "ack-1",
                    "message": {"data": encoded, "messageId": "m-1", "publishTime": "2024-01-01T00:00:00Z"}
                }]
            })))
            .mount(&server)
            .await;

        let messages = transport(server.uri()).pull(5).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].ack_id, "ack-1");
        assert_eq!(messages[0].message_id, "m-1");
        assert_eq!(messages[0].data, br#"{"testNotification":{}}"#.to_vec());
    }

    #[tokio::test]
    async fn test_invalid_data_does_not_drop_the_batch() {
        let server = MockServer::start().await;
        let encoded = general_purpose::STANDARD.encode(r#"{"testNotification":{}}"#);
        Mock::given(method("POST"))
            .and(path("/v1/projects/newsfeed/subscriptions/billing-events:pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "receivedMessages": [
                    {"ackId": "ack-1", "message": {"data": encoded, "messageId": "m-1"}},
                    {"ackId": "ack-2", "message": {"data": "%%%not-base64", "messageId": "m-2"}}
                ]
            })))
            .mount(&server)
            .await;

        let messages = transport(server.uri()).pull(10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].data, br#"{"testNotification":{}}"#.to_vec());
        assert_eq!(messages[1].ack_id, "ack-2");
        assert!(messages[1].data.is_empty());
    }

    #[tokio::test]
    async fn test_hung_acknowledge_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/newsfeed/subscriptions/billing-events:acknowledge"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let result = transport(server.uri()).ack("ack-1").await;
        assert!(matches!(result, Err(TransportError::Request(e)) if e.is_timeout()));
    }

    #[tokio::test]
    async fn test_empty_pull() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        assert!(transport(server.uri()).pull(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_and_nack_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/newsfeed/subscriptions/billing-events:acknowledge"))
            .and(body_json(json!({"ackIds": ["ack-1"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/newsfeed/subscriptions/billing-events:modifyAckDeadline"))
            .and(body_json(json!({"ackIds": ["ack-2"], "ackDeadlineSeconds": 0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport(server.uri());
        transport.ack("ack-1").await.unwrap();
        transport.nack("ack-2").await.unwrap();
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("subscription not found"))
            .mount(&server)
            .await;

        match transport(server.uri()).pull(1).await {
            Err(TransportError::Status { status, body }) => {
                assert_eq!(status, 404);
                assert!(body.contains("not found"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
