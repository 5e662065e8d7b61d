use async_trait::async_trait;

use crate::errors::SubscriptionError;

/// Resolves an already-issued authentication token to the owning user.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_id_for_token(&self, token: &str) -> Result<Option<i64>, SubscriptionError>;
}

/// Like [`UserDirectory::user_id_for_token`] but treats an unknown token as unauthorized.
pub async fn require_user(
    directory: &dyn UserDirectory,
    token: &str,
) -> Result<i64, SubscriptionError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(SubscriptionError::Unauthorized(
            "Missing authentication token".to_string(),
        ));
    }

    directory.user_id_for_token(token).await?.ok_or_else(|| {
        SubscriptionError::Unauthorized("Invalid or expired token".to_string())
    })
}
