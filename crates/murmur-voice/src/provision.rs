//! Voice-AI provider configuration provisioning.
//!
//! Each user gets one provider-side configuration, created when the
//! identity platform reports `user.created` and removed on `user.deleted`.
//! The provider sits behind the [`VoiceProvider`] trait so the webhook
//! handler can be tested without network access.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::VoiceError;

/// The default system prompt attached to every newly provisioned user.
pub const BASE_SYSTEM_PROMPT: &str = "You are a warm, attentive voice companion. \
Listen closely, answer briefly, and ask one clarifying question when the \
user's intent is unclear.";

/// An externally provisioned voice configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VoiceConfig {
    pub id: String,
    pub name: String,
    pub version: u32,
}

/// The external voice-AI platform, reduced to configuration lifecycle.
#[async_trait]
pub trait VoiceProvider: Send + Sync {
    /// Creates a basic configuration keyed by the user's email.
    async fn create_basic_config(&self, email: &str) -> Result<VoiceConfig, VoiceError>;

    /// Deletes a configuration. Deleting an already-removed configuration
    /// succeeds, so webhook retries stay idempotent.
    async fn delete_config(&self, config_id: &str) -> Result<(), VoiceError>;
}

/// HTTP client for the voice provider's configuration API.
pub struct HttpVoiceProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpVoiceProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl VoiceProvider for HttpVoiceProvider {
    async fn create_basic_config(&self, email: &str) -> Result<VoiceConfig, VoiceError> {
        let response = self
            .http
            .post(self.url("/v0/evi/configs"))
            .header("X-Api-Key", &self.api_key)
            .json(&json!({
                "name": format!("basic-config-{email}"),
                "prompt": { "text": BASE_SYSTEM_PROMPT },
            }))
            .send()
            .await
            .map_err(|e| VoiceError::Provisioning(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VoiceError::Provisioning(format!(
                "config create for {email} returned status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| VoiceError::Provisioning(e.to_string()))
    }

    async fn delete_config(&self, config_id: &str) -> Result<(), VoiceError> {
        let response = self
            .http
            .delete(self.url(&format!("/v0/evi/configs/{config_id}")))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| VoiceError::Provisioning(e.to_string()))?;

        // A missing configuration means a previous delete already landed.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::warn!(config_id, "voice config already absent on delete");
            return Ok(());
        }

        if !response.status().is_success() {
            return Err(VoiceError::Provisioning(format!(
                "config delete for {config_id} returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}
