//! Bearer-token verification and user-metadata writes against the external
//! identity provider.
//!
//! The provider sits behind the [`IdentityProvider`] trait so the relay
//! server can be tested without network access; [`HttpIdentityProvider`] is
//! the production implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::IdentityError;

/// Claims extracted from a verified session token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Claims {
    /// The subject (user id). Guaranteed non-empty by [`IdentityProvider::verify_token`].
    pub sub: String,
}

/// The external identity platform, reduced to the two operations the relay
/// needs: verifying session tokens and writing user metadata.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verifies a bearer token and returns its claims.
    ///
    /// # Errors
    ///
    /// `IdentityError::InvalidToken` when the provider rejects the token,
    /// `IdentityError::EmptySubject` when it verifies but carries no
    /// subject.
    async fn verify_token(&self, token: &str) -> Result<Claims, IdentityError>;

    /// Writes the provisioned voice configuration id into the user's public
    /// metadata so clients can discover it.
    async fn update_config_metadata(
        &self,
        user_id: &str,
        config_id: &str,
    ) -> Result<(), IdentityError>;
}

/// HTTP client for the identity provider's backend API.
pub struct HttpIdentityProvider {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl HttpIdentityProvider {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            secret_key: secret_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn verify_token(&self, token: &str) -> Result<Claims, IdentityError> {
        let response = self
            .http
            .post(self.url("/v1/tokens/verify"))
            .bearer_auth(&self.secret_key)
            .json(&json!({ "token": token }))
            .send()
            .await
            .map_err(|e| IdentityError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(IdentityError::InvalidToken(format!(
                "provider returned status {}",
                response.status()
            )));
        }

        let claims: Claims = response
            .json()
            .await
            .map_err(|e| IdentityError::InvalidResponse(e.to_string()))?;

        if claims.sub.is_empty() {
            return Err(IdentityError::EmptySubject);
        }
        Ok(claims)
    }

    async fn update_config_metadata(
        &self,
        user_id: &str,
        config_id: &str,
    ) -> Result<(), IdentityError> {
        let response = self
            .http
            .patch(self.url(&format!("/v1/users/{user_id}/metadata")))
            .bearer_auth(&self.secret_key)
            .json(&json!({
                "public_metadata": { "voice_config_id": config_id }
            }))
            .send()
            .await
            .map_err(|e| IdentityError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(IdentityError::InvalidResponse(format!(
                "metadata update returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}
