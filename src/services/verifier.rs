use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::time::Duration;

use crate::config::{GooglePlayConfig, VerificationMode};
use crate::errors::SubscriptionError;
use crate::models::receipt::{parse_millis, Receipt, VerificationResult};
use crate::models::subscription::{Provider, Tier};
use crate::services::google_auth::GoogleTokenSource;
use crate::services::tier;

/// Single-attempt receipt check against a billing provider. Implementations must not
/// retry internally or touch the subscription store.
#[async_trait]
pub trait ReceiptVerifier: Send + Sync {
    async fn verify(
        &self,
        provider: Provider,
        receipt: &Receipt,
    ) -> Result<VerificationResult, SubscriptionError>;
}

/// Routes each receipt to the verifier for its provider.
pub struct ProviderVerifier {
    google_play: GooglePlayVerifier,
}

impl ProviderVerifier {
    pub fn new(google_play: GooglePlayVerifier) -> Self {
        Self { google_play }
    }
}

#[async_trait]
impl ReceiptVerifier for ProviderVerifier {
    async fn verify(
        &self,
        provider: Provider,
        receipt: &Receipt,
    ) -> Result<VerificationResult, SubscriptionError> {
        match provider {
            Provider::GooglePlay => self.google_play.verify(receipt).await,
            Provider::Apple => Err(SubscriptionError::UnsupportedProvider(
                "apple receipts cannot be verified".to_string(),
            )),
        }
    }
}

pub struct GooglePlayVerifier {
    client: Client,
    config: GooglePlayConfig,
    tokens: GoogleTokenSource,
    timeout: Duration,
}

impl GooglePlayVerifier {
    /// `client` should carry `timeout` as its request timeout.
    pub fn new(
        client: Client,
        config: GooglePlayConfig,
        tokens: GoogleTokenSource,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            config,
            tokens,
            timeout,
        }
    }

    pub async fn verify(&self, receipt: &Receipt) -> Result<VerificationResult, SubscriptionError> {
        let purchase_token = receipt.purchase_token().ok_or_else(|| {
            SubscriptionError::MalformedReceipt("purchaseToken is required".to_string())
        })?;
        let product_id = receipt.product_id().ok_or_else(|| {
            SubscriptionError::MalformedReceipt("productId is required".to_string())
        })?;

        if self.config.mode == VerificationMode::Offline {
            log::debug!(
                "Offline verification accepted purchase token for {}",
                product_id
            );
            return Ok(VerificationResult {
                verified: true,
                tier: tier::resolve(product_id),
                expiry: receipt.expiry(),
                purchase_token: purchase_token.to_string(),
                product_id: product_id.to_string(),
            });
        }

        let package_name = receipt
            .package_name()
            .or_else(|| Some(self.config.package_name.trim()).filter(|p| !p.is_empty()))
            .ok_or_else(|| {
                SubscriptionError::MalformedReceipt("packageName is required".to_string())
            })?;

        let access_token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| SubscriptionError::Verification(e.to_string()))?;

        let url = self.purchase_url(package_name, product_id, purchase_token)?;

        log::info!("Verifying Google Play purchase for {}", product_id);

        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            log::error!("Google Play verification failed with {}: {}", status, error_text);
            return Err(SubscriptionError::Verification(format!(
                "Google Play returned {}: {}",
                status, error_text
            )));
        }

        let purchase: Value = response.json().await.map_err(|e| self.request_error(e))?;

        // paymentState 0 is a pending payment; a missing field means a free trial or
        // an already-settled purchase.
        let verified = purchase.get("paymentState").and_then(Value::as_i64) != Some(0);

        Ok(VerificationResult {
            verified,
            tier: tier_hint(&purchase).unwrap_or_else(|| tier::resolve(product_id)),
            expiry: purchase
                .get("expiryTimeMillis")
                .and_then(parse_millis)
                .or_else(|| receipt.expiry()),
            purchase_token: purchase_token.to_string(),
            product_id: product_id.to_string(),
        })
    }

    /// Subscription purchase resource, with every caller-supplied part encoded as
    /// its own path segment.
    fn purchase_url(
        &self,
        package_name: &str,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<Url, SubscriptionError> {
        let mut url = Url::parse(&self.config.api_url).map_err(|e| {
            SubscriptionError::Verification(format!("invalid Google Play API url: {}", e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                SubscriptionError::Verification("Google Play API url cannot carry a path".into())
            })?
            .pop_if_empty()
            .extend([
                "androidpublisher",
                "v3",
                "applications",
                package_name,
                "purchases",
                "subscriptions",
                product_id,
                "tokens",
                purchase_token,
            ]);
        Ok(url)
    }

    fn request_error(&self, err: reqwest::Error) -> SubscriptionError {
        if err.is_timeout() {
            SubscriptionError::Timeout("receipt verification", self.timeout)
        } else {
            SubscriptionError::Verification(err.to_string())
        }
    }
}

fn tier_hint(purchase: &Value) -> Option<Tier> {
    let hint = purchase.get("tier").and_then(Value::as_str)?;
    Tier::ALL
        .into_iter()
        .find(|tier| tier.as_str().eq_ignore_ascii_case(hint.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GoogleConfig;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PURCHASE_PATH: &str = "/androidpublisher/v3/applications/com.newsfeed.app/purchases/subscriptions/pro_plan_monthly/tokens/tok-1";

    fn verifier(api_url: String, mode: VerificationMode) -> GooglePlayVerifier {
        let client = Client::new();
        let tokens = GoogleTokenSource::new(
            client.clone(),
            GoogleConfig {
                access_token: Some("test-token".to_string()),
                token_url: "http://127.0.0.1:9/token".to_string(),
            },
        );
        GooglePlayVerifier::new(
            client,
            GooglePlayConfig {
                package_name: "com.newsfeed.app".to_string(),
                api_url,
                mode,
            },
            tokens,
            Duration::from_secs(5),
        )
    }

    fn receipt(value: Value) -> Receipt {
        match value {
            Value::Object(map) => Receipt::new(map),
            _ => panic!("receipt must be an object"),
        }
    }

    #[test]
    fn test_purchase_url_encodes_each_segment() {
        let verifier = verifier("http://play.test/".to_string(), VerificationMode::Live);
        let url = verifier
            .purchase_url("com.newsfeed.app", "pro_plan_monthly", "tok/1 2?x")
            .unwrap();

        assert_eq!(
            url.path(),
            "/androidpublisher/v3/applications/com.newsfeed.app/purchases/subscriptions/pro_plan_monthly/tokens/tok%2F1%202%3Fx"
        );
        assert!(url.query().is_none());
    }

    #[tokio::test]
    async fn test_missing_fields_fail_before_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let verifier = verifier(server.uri(), VerificationMode::Live);

        let missing_token = verifier
            .verify(&receipt(json!({"productId": "pro_plan_monthly"})))
            .await;
        assert!(matches!(
            missing_token,
            Err(SubscriptionError::MalformedReceipt(_))
        ));

        let missing_product = verifier
            .verify(&receipt(json!({"purchaseToken": "tok-1", "productId": "  "})))
            .await;
        assert!(matches!(
            missing_product,
            Err(SubscriptionError::MalformedReceipt(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_mode_resolves_tier_locally() {
        let verifier = verifier("http://127.0.0.1:9".to_string(), VerificationMode::Offline);
        let result = verifier
            .verify(&receipt(json!({
                "purchaseToken": "tok-1",
                "productId": "analyst_plan_yearly"
            })))
            .await
            .unwrap();

        assert!(result.verified);
        assert_eq!(result.tier, Tier::Analyst);
        assert_eq!(result.expiry, None);
        assert_eq!(result.purchase_token, "tok-1");
    }

    #[tokio::test]
    async fn test_live_verification_reads_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PURCHASE_PATH))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kind": "androidpublisher#subscriptionPurchase",
                "expiryTimeMillis": "1893456000000",
                "paymentState": 1,
                "autoRenewing": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = verifier(server.uri(), VerificationMode::Live)
            .verify(&receipt(json!({
                "purchaseToken": "tok-1",
                "productId": "pro_plan_monthly"
            })))
            .await
            .unwrap();

        assert!(result.verified);
        assert_eq!(result.tier, Tier::Pro);
        assert_eq!(result.expiry.map(|e| e.timestamp_millis()), Some(1_893_456_000_000));
    }

    #[tokio::test]
    async fn test_pending_payment_is_not_verified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PURCHASE_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"paymentState": 0, "tier": "analyst"})),
            )
            .mount(&server)
            .await;

        let result = verifier(server.uri(), VerificationMode::Live)
            .verify(&receipt(json!({
                "purchaseToken": "tok-1",
                "productId": "pro_plan_monthly"
            })))
            .await
            .unwrap();

        assert!(!result.verified);
        assert_eq!(result.tier, Tier::Analyst);
    }

    #[tokio::test]
    async fn test_provider_error_is_verification_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PURCHASE_PATH))
            .respond_with(ResponseTemplate::new(410).set_body_string("purchase expired"))
            .mount(&server)
            .await;

        let result = verifier(server.uri(), VerificationMode::Live)
            .verify(&receipt(json!({
                "purchaseToken": "tok-1",
                "productId": "pro_plan_monthly"
            })))
            .await;

        match result {
            Err(SubscriptionError::Verification(message)) => assert!(message.contains("410")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_apple_is_unsupported() {
        let dispatch = ProviderVerifier::new(verifier(
            "http://127.0.0.1:9".to_string(),
            VerificationMode::Offline,
        ));
        let result = dispatch
            .verify(
                Provider::Apple,
                &receipt(json!({"purchaseToken": "tok-1", "productId": "pro_plan_monthly"})),
            )
            .await;
        assert!(matches!(
            result,
            Err(SubscriptionError::UnsupportedProvider(_))
        ));
    }
}
