//! Webhook endpoint behavior: signatures, de-duplication, and the user
//! provisioning lifecycle, exercised through the router with mock providers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use murmur_identity::{sign, Claims, IdentityError, IdentityProvider};
use murmur_server::registry::ConnectionRegistry;
use murmur_server::webhooks::ProcessedWebhookIds;
use murmur_server::{app, AppState};
use murmur_store::TableStore;
use murmur_types::User;
use murmur_voice::{VoiceConfig, VoiceError, VoiceProvider, BASE_SYSTEM_PROMPT};
use serde_json::{json, Value};
use tower::ServiceExt;

const SECRET: &str = "whsec_dGVzdC1zZWNyZXQ=";

#[derive(Default)]
struct RecordingIdentity {
    metadata_writes: AtomicU32,
}

#[async_trait]
impl IdentityProvider for RecordingIdentity {
    async fn verify_token(&self, _token: &str) -> Result<Claims, IdentityError> {
        Err(IdentityError::InvalidToken("not under test".to_string()))
    }

    async fn update_config_metadata(
        &self,
        _user_id: &str,
        _config_id: &str,
    ) -> Result<(), IdentityError> {
        self.metadata_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingVoice {
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl VoiceProvider for RecordingVoice {
    async fn create_basic_config(&self, email: &str) -> Result<VoiceConfig, VoiceError> {
        self.created.lock().unwrap().push(email.to_string());
        Ok(VoiceConfig {
            id: format!("cfg_{email}"),
            name: format!("basic-config-{email}"),
            version: 1,
        })
    }

    async fn delete_config(&self, config_id: &str) -> Result<(), VoiceError> {
        self.deleted.lock().unwrap().push(config_id.to_string());
        Ok(())
    }
}

struct Harness {
    router: Router,
    store: Arc<TableStore>,
    identity: Arc<RecordingIdentity>,
    voice: Arc<RecordingVoice>,
}

fn harness() -> Harness {
    let store = Arc::new(TableStore::new());
    let identity = Arc::new(RecordingIdentity::default());
    let voice = Arc::new(RecordingVoice::default());
    let state = Arc::new(AppState {
        store: store.clone(),
        registry: ConnectionRegistry::new(),
        webhook_ids: ProcessedWebhookIds::new(),
        identity: identity.clone(),
        voice: voice.clone(),
        webhook_secret: SECRET.to_string(),
    });
    Harness {
        router: app(state),
        store,
        identity,
        voice,
    }
}

/// Builds a correctly signed webhook request for `body`.
fn signed_request(delivery_id: &str, body: &Value) -> Request<Body> {
    let body = body.to_string();
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let signature =
        sign(SECRET, delivery_id, &timestamp, body.as_bytes()).expect("signing succeeds");
    Request::builder()
        .method("POST")
        .uri("/api/webhooks")
        .header("content-type", "application/json")
        .header("svix-id", delivery_id)
        .header("svix-timestamp", timestamp)
        .header("svix-signature", format!("v1,{signature}"))
        .body(Body::from(body))
        .expect("request builds")
}

async fn response_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    serde_json::from_slice(&body).expect("json body")
}

fn user_created_event(user_id: &str, email: &str) -> Value {
    json!({
        "type": "user.created",
        "data": {
            "id": user_id,
            "email_addresses": [{ "email_address": email }],
            "first_name": "Ada",
            "last_name": "Lovelace",
        }
    })
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let h = harness();
    let body = user_created_event("user_1", "ada@example.com");
    let mut request = signed_request("evt_1", &body);
    request
        .headers_mut()
        .insert("svix-signature", "v1,AAAA".parse().unwrap());

    let response = h.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.voice.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn user_created_provisions_and_persists() {
    let h = harness();
    let body = user_created_event("user_1", "ada@example.com");

    let response = h
        .router
        .clone()
        .oneshot(signed_request("evt_1", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["status"], "processed");

    assert_eq!(
        h.voice.created.lock().unwrap().as_slice(),
        ["ada@example.com"]
    );

    let user = h.store.get_user("user_1").await.expect("user row exists");
    assert_eq!(user.email.as_deref(), Some("ada@example.com"));
    assert_eq!(user.config_id.as_deref(), Some("cfg_ada@example.com"));
    assert_eq!(user.system_prompt.as_deref(), Some(BASE_SYSTEM_PROMPT));

    // Config-id propagation runs on a spawned task; the first attempt is
    // immediate.
    for _ in 0..50 {
        if h.identity.metadata_writes.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(h.identity.metadata_writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_delivery_has_no_side_effects() {
    let h = harness();
    let body = user_created_event("user_1", "ada@example.com");

    let first = h
        .router
        .clone()
        .oneshot(signed_request("evt_dup", &body))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = h
        .router
        .clone()
        .oneshot(signed_request("evt_dup", &body))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(response_json(second).await["status"], "duplicate");

    assert_eq!(
        h.voice.created.lock().unwrap().len(),
        1,
        "provisioning must run exactly once"
    );
}

#[tokio::test]
async fn user_created_without_email_is_rejected() {
    let h = harness();
    let body = json!({
        "type": "user.created",
        "data": { "id": "user_1", "email_addresses": [] }
    });

    let response = h
        .router
        .oneshot(signed_request("evt_1", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.voice.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn user_deleted_removes_config_then_row() {
    let h = harness();
    let mut user = User::new("user_1");
    user.config_id = Some("cfg_1".to_string());
    h.store.create_user(&user).await;

    let body = json!({ "type": "user.deleted", "data": { "id": "user_1" } });
    let response = h
        .router
        .oneshot(signed_request("evt_1", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(h.voice.deleted.lock().unwrap().as_slice(), ["cfg_1"]);
    assert!(h.store.get_user("user_1").await.is_none());
}

#[tokio::test]
async fn user_deleted_for_unknown_user_succeeds_without_provider_calls() {
    let h = harness();
    let body = json!({ "type": "user.deleted", "data": { "id": "ghost" } });

    let response = h
        .router
        .oneshot(signed_request("evt_1", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["status"], "processed");
    assert!(h.voice.deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn user_deleted_without_config_id_is_an_error() {
    let h = harness();
    h.store.create_user(&User::new("user_1")).await;

    let body = json!({ "type": "user.deleted", "data": { "id": "user_1" } });
    let response = h
        .router
        .oneshot(signed_request("evt_1", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(
        h.store.get_user("user_1").await.is_some(),
        "the local row stays until the provider delete succeeds"
    );
}

#[tokio::test]
async fn unknown_event_types_are_acknowledged() {
    let h = harness();
    let body = json!({ "type": "session.revoked", "data": { "id": "sess_1" } });

    let response = h
        .router
        .oneshot(signed_request("evt_1", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["status"], "processed");
}
