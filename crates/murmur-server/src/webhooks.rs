//! Identity-platform webhook endpoint: signature verification, delivery
//! de-duplication, and the user provisioning lifecycle.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use murmur_identity::{verify_webhook_signature, IdentityError, IdentityProvider, SignatureHeaders};
use murmur_types::User;
use murmur_voice::{VoiceError, BASE_SYSTEM_PROMPT};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::AppState;

/// Resident capacity of the delivery-id set.
pub const DEDUP_CAPACITY: usize = 1000;

/// How many of the oldest ids are evicted once capacity is exceeded.
pub const DEDUP_EVICT_BATCH: usize = 100;

/// How often the config-id propagation task retries, and how many times.
const METADATA_PROPAGATION_INTERVAL: Duration = Duration::from_secs(2);
const METADATA_PROPAGATION_ATTEMPTS: u32 = 5;

/// Insertion-ordered set of processed webhook delivery ids.
///
/// Purely in-memory: a restart forgets history, which is acceptable because
/// the handlers themselves are idempotent. When the set grows past
/// [`DEDUP_CAPACITY`], the oldest [`DEDUP_EVICT_BATCH`] ids are dropped.
#[derive(Clone, Default)]
pub struct ProcessedWebhookIds {
    inner: Arc<Mutex<DedupState>>,
}

#[derive(Default)]
struct DedupState {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl ProcessedWebhookIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a delivery id. Returns `false` if the id was already
    /// resident (a duplicate delivery).
    pub fn insert(&self, id: &str) -> bool {
        let mut state = self.inner.lock().expect("dedup lock");
        if state.seen.contains(id) {
            return false;
        }
        state.seen.insert(id.to_string());
        state.order.push_back(id.to_string());

        if state.order.len() > DEDUP_CAPACITY {
            for _ in 0..DEDUP_EVICT_BATCH {
                if let Some(oldest) = state.order.pop_front() {
                    state.seen.remove(&oldest);
                }
            }
        }
        true
    }

    /// Number of resident delivery ids.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup lock").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Failures the webhook endpoint reports to the caller.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing svix headers")]
    MissingHeaders,

    #[error("signature verification failed: {0}")]
    Signature(#[from] IdentityError),

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("webhook payload missing field: {0}")]
    MissingField(&'static str),

    #[error("voice provisioning failed: {0}")]
    Provisioning(#[from] VoiceError),

    #[error("user {0} has no voice configuration")]
    MissingConfig(String),
}

impl WebhookError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingHeaders
            | Self::Signature(_)
            | Self::MalformedPayload(_)
            | Self::MissingField(_) => StatusCode::BAD_REQUEST,
            Self::Provisioning(_) | Self::MissingConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        tracing::warn!("webhook rejected: {}", self);
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// The envelope of an identity-platform event.
#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// `POST /api/webhooks` — receives identity-platform lifecycle events.
///
/// The three `svix-*` headers are mandatory and the signature is verified
/// before anything else runs; only then is the delivery id checked against
/// the dedup set, so an attacker cannot poison the set with forged ids.
/// Duplicate deliveries return `200 {"status":"duplicate"}` with no side
/// effects.
pub async fn webhook_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, WebhookError> {
    let (id, timestamp, signature) = match (
        header_str(&headers, "svix-id"),
        header_str(&headers, "svix-timestamp"),
        header_str(&headers, "svix-signature"),
    ) {
        (Some(id), Some(timestamp), Some(signature)) => (id, timestamp, signature),
        _ => return Err(WebhookError::MissingHeaders),
    };

    verify_webhook_signature(
        &state.webhook_secret,
        &SignatureHeaders {
            id,
            timestamp,
            signature,
        },
        body.as_bytes(),
    )?;

    if !state.webhook_ids.insert(id) {
        tracing::info!(delivery_id = %id, "duplicate webhook delivery ignored");
        return Ok(Json(json!({ "status": "duplicate" })));
    }

    let event: WebhookEvent =
        serde_json::from_str(&body).map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

    match event.kind.as_str() {
        "user.created" => handle_user_created(&state, &event.data).await?,
        "user.deleted" => handle_user_deleted(&state, &event.data).await?,
        other => {
            tracing::debug!(event_type = %other, "ignoring unhandled webhook event type");
        }
    }

    Ok(Json(json!({ "status": "processed" })))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Payload fields of a `user.created` event.
#[derive(Debug, Deserialize)]
struct UserCreatedData {
    id: String,
    #[serde(default)]
    email_addresses: Vec<EmailAddress>,
    first_name: Option<String>,
    last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    email_address: String,
}

/// Provisions a voice configuration for the new user, persists the user
/// row, and kicks off asynchronous config-id propagation back into the
/// identity provider's user metadata.
async fn handle_user_created(
    state: &AppState,
    data: &serde_json::Value,
) -> Result<(), WebhookError> {
    let data: UserCreatedData = serde_json::from_value(data.clone())
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
    let email = data
        .email_addresses
        .first()
        .map(|e| e.email_address.clone())
        .ok_or(WebhookError::MissingField("email_addresses"))?;

    let config = state.voice.create_basic_config(&email).await?;
    tracing::info!(user_id = %data.id, config_id = %config.id, "provisioned voice config");

    state
        .store
        .create_user(&User {
            id: data.id.clone(),
            email: Some(email),
            first_name: data.first_name,
            last_name: data.last_name,
            config_id: Some(config.id.clone()),
            system_prompt: Some(BASE_SYSTEM_PROMPT.to_string()),
        })
        .await;

    // Propagation is off the request path: the identity provider may not
    // see the new user immediately, so a spawned task retries until the
    // metadata write is accepted. Its failures are logged, never surfaced.
    tokio::spawn(propagate_config_metadata(
        state.identity.clone(),
        data.id,
        config.id,
    ));

    Ok(())
}

/// Deletes the user's external voice configuration, then the local row.
///
/// An absent local row means the delete was already applied (or the user
/// was never provisioned); that case succeeds without touching the
/// provider. A row without a config id is a hard error.
async fn handle_user_deleted(
    state: &AppState,
    data: &serde_json::Value,
) -> Result<(), WebhookError> {
    let user_id = data
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or(WebhookError::MissingField("id"))?;

    let Some(user) = state.store.get_user(user_id).await else {
        tracing::info!(user_id = %user_id, "delete for unknown user, already applied");
        return Ok(());
    };

    let config_id = user
        .config_id
        .ok_or_else(|| WebhookError::MissingConfig(user_id.to_string()))?;

    state.voice.delete_config(&config_id).await?;
    state.store.delete_user(user_id).await;
    tracing::info!(user_id = %user_id, config_id = %config_id, "user deprovisioned");
    Ok(())
}

/// Writes the provisioned config id into the identity provider's user
/// metadata, retrying on a fixed interval until the write is accepted or
/// the attempt budget runs out.
async fn propagate_config_metadata(
    identity: Arc<dyn IdentityProvider>,
    user_id: String,
    config_id: String,
) {
    for attempt in 0..METADATA_PROPAGATION_ATTEMPTS {
        match identity.update_config_metadata(&user_id, &config_id).await {
            Ok(()) => {
                tracing::info!(user_id = %user_id, attempt, "config metadata propagated");
                return;
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    attempt,
                    "config metadata propagation attempt failed: {}",
                    e
                );
            }
        }
        tokio::time::sleep(METADATA_PROPAGATION_INTERVAL).await;
    }
    tracing::error!(
        user_id = %user_id,
        attempts = METADATA_PROPAGATION_ATTEMPTS,
        "config metadata propagation gave up"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_are_rejected() {
        let ids = ProcessedWebhookIds::new();
        assert!(ids.insert("evt_1"));
        assert!(!ids.insert("evt_1"));
        assert!(ids.insert("evt_2"));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn eviction_drops_the_oldest_batch() {
        let ids = ProcessedWebhookIds::new();
        for i in 0..=DEDUP_CAPACITY {
            assert!(ids.insert(&format!("evt_{i}")));
        }
        assert_eq!(ids.len(), DEDUP_CAPACITY + 1 - DEDUP_EVICT_BATCH);

        // Evicted ids may be re-processed; recent ids stay deduplicated.
        assert!(ids.insert("evt_0"));
        assert!(!ids.insert(&format!("evt_{DEDUP_CAPACITY}")));
    }

    #[test]
    fn resident_set_never_exceeds_capacity() {
        let ids = ProcessedWebhookIds::new();
        for i in 0..5_000 {
            ids.insert(&format!("evt_{i}"));
            assert!(ids.len() <= DEDUP_CAPACITY, "len {} at i {}", ids.len(), i);
        }
    }

    #[test]
    fn user_created_payload_parses_clerk_shape() {
        let payload = json!({
            "id": "user_abc",
            "email_addresses": [{ "email_address": "a@b.c" }],
            "first_name": "Ada",
            "last_name": null,
        });
        let data: UserCreatedData = serde_json::from_value(payload).expect("valid payload");
        assert_eq!(data.id, "user_abc");
        assert_eq!(data.email_addresses[0].email_address, "a@b.c");
        assert_eq!(data.first_name.as_deref(), Some("Ada"));
        assert!(data.last_name.is_none());
    }
}
