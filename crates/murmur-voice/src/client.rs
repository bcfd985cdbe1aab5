//! Client-side connection supervisor for the voice-provider WebSocket.
//!
//! Tracks idle/connecting/connected/error states, retries failed connects
//! with exponential backoff up to a fixed attempt budget, and re-sends the
//! most recent pending outbound frame once reconnected. Teardown is
//! cooperative: every timer checks for cancellation before it fires, and no
//! event callbacks run after [`SessionClient::disconnect`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use murmur_store::TableStore;
use murmur_types::MessageRole;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::VoiceError;

/// Base backoff delay, doubled per attempt.
const BACKOFF_BASE_MS: u64 = 1_000;

/// Ceiling on any single backoff delay.
const BACKOFF_CAP_MS: u64 = 10_000;

/// Retries allowed after the initial attempt of a connect sequence. Once
/// exhausted, the sequence halts until a caller invokes `connect` again.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// How long to let a fresh connection settle before retrying a pending
/// send.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Delay before reconnection attempt `attempt` (0-indexed):
/// `min(1000ms * 2^attempt, 10000ms)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(factor).min(BACKOFF_CAP_MS))
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Error,
}

/// Connects the client to the provider. Production uses [`WsTransport`];
/// tests substitute scripted transports.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Sink: FrameSink;
    type Stream: FrameStream;

    async fn connect(&self) -> Result<(Self::Sink, Self::Stream), VoiceError>;
}

/// Outbound half of a provider connection.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: String) -> Result<(), VoiceError>;
    async fn close(&mut self);
}

/// Inbound half of a provider connection. `None` is a clean close.
#[async_trait]
pub trait FrameStream: Send + 'static {
    async fn next_frame(&mut self) -> Option<Result<String, VoiceError>>;
}

/// Frames the provider sends that the client acts on. Anything else is
/// ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderFrame {
    #[serde(rename = "chat_metadata")]
    ChatMetadata {
        chat_id: String,
        chat_group_id: String,
    },
    #[serde(rename = "user_message")]
    UserMessage {
        message: ChatText,
        #[serde(default)]
        interim: bool,
        chat_id: Option<String>,
    },
    #[serde(rename = "assistant_message")]
    AssistantMessage {
        message: ChatText,
        chat_id: Option<String>,
        models: Option<ModelAnnotations>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatText {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelAnnotations {
    pub prosody: Option<ProsodyScores>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProsodyScores {
    pub scores: serde_json::Value,
}

/// Receives parsed provider frames. The production sink writes them into
/// the local-first store.
#[async_trait]
pub trait ProviderEventSink: Send + Sync {
    async fn on_frame(&self, frame: ProviderFrame);
}

/// Writes provider events into the [`TableStore`]: session metadata becomes
/// a session row, finalized user/assistant messages become message rows
/// (assistant prosody scores land in message metadata).
pub struct StoreEventSink {
    store: Arc<TableStore>,
    user_id: String,
    current_session: Mutex<Option<String>>,
}

impl StoreEventSink {
    pub fn new(store: Arc<TableStore>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
            current_session: Mutex::new(None),
        }
    }

    async fn session_for(&self, frame_chat_id: Option<String>) -> Option<String> {
        match frame_chat_id {
            Some(id) => Some(id),
            None => self.current_session.lock().await.clone(),
        }
    }
}

#[async_trait]
impl ProviderEventSink for StoreEventSink {
    async fn on_frame(&self, frame: ProviderFrame) {
        match frame {
            ProviderFrame::ChatMetadata {
                chat_id,
                chat_group_id,
            } => {
                self.store
                    .record_session(&chat_id, &self.user_id, Some(&chat_group_id))
                    .await;
                *self.current_session.lock().await = Some(chat_id);
            }
            ProviderFrame::UserMessage {
                message,
                interim,
                chat_id,
            } => {
                if interim {
                    return;
                }
                let Some(session_id) = self.session_for(chat_id).await else {
                    tracing::warn!("dropping user message with no known session");
                    return;
                };
                self.store
                    .add_message(&session_id, &message.content, MessageRole::User)
                    .await;
            }
            ProviderFrame::AssistantMessage {
                message,
                chat_id,
                models,
            } => {
                let Some(session_id) = self.session_for(chat_id).await else {
                    tracing::warn!("dropping assistant message with no known session");
                    return;
                };
                let metadata = models
                    .and_then(|m| m.prosody)
                    .map(|p| json!({ "prosody": p.scores }));
                self.store
                    .add_message_with_metadata(
                        &session_id,
                        &message.content,
                        MessageRole::Assistant,
                        metadata,
                    )
                    .await;
            }
            ProviderFrame::Error { message } => {
                tracing::warn!("provider reported error: {}", message);
            }
        }
    }
}

struct ClientInner<T: Transport> {
    transport: T,
    events: Arc<dyn ProviderEventSink>,
    status_tx: watch::Sender<ConnectionStatus>,
    sink: Mutex<Option<T::Sink>>,
    /// Serializes connect sequences so concurrent callers cannot interleave
    /// backoff loops.
    connect_gate: Mutex<()>,
    /// At most one outbound frame waiting for a reconnect.
    pending: std::sync::Mutex<Option<String>>,
    /// Teardown generation. Bumped by `disconnect`; timers and callbacks
    /// from an older generation stop cooperatively.
    generation: watch::Sender<u64>,
}

/// The connection supervisor. Cheap to clone; all clones share one
/// connection.
pub struct SessionClient<T: Transport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Transport> Clone for SessionClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> SessionClient<T> {
    pub fn new(transport: T, events: Arc<dyn ProviderEventSink>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Idle);
        let (generation, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(ClientInner {
                transport,
                events,
                status_tx,
                sink: Mutex::new(None),
                connect_gate: Mutex::new(()),
                pending: std::sync::Mutex::new(None),
                generation,
            }),
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Subscribes to status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Establishes a connection, replacing any existing one.
    ///
    /// On transport failure the sequence retries with
    /// [`backoff_delay`]-spaced attempts, up to [`MAX_RECONNECT_ATTEMPTS`]
    /// retries after the initial try. When the budget is exhausted the
    /// client stays in the error state until `connect` is called again.
    pub async fn connect(&self) -> Result<(), VoiceError> {
        let inner = &self.inner;
        let _gate = inner.connect_gate.lock().await;
        let gen = *inner.generation.borrow();

        if let Some(mut old) = inner.sink.lock().await.take() {
            old.close().await;
        }

        let mut attempt: u32 = 0;
        loop {
            if *inner.generation.borrow() != gen {
                return Err(VoiceError::Cancelled);
            }
            inner.status_tx.send_replace(ConnectionStatus::Connecting);

            match inner.transport.connect().await {
                Ok((sink, stream)) => {
                    *inner.sink.lock().await = Some(sink);
                    inner.status_tx.send_replace(ConnectionStatus::Connected);
                    spawn_recv_loop(Arc::clone(&self.inner), stream, gen);
                    return Ok(());
                }
                Err(e) => {
                    inner.status_tx.send_replace(ConnectionStatus::Error);
                    if attempt >= MAX_RECONNECT_ATTEMPTS {
                        tracing::warn!(
                            attempts = attempt,
                            "reconnect budget exhausted, awaiting manual reconnect: {}",
                            e
                        );
                        return Err(VoiceError::RetriesExhausted { attempts: attempt });
                    }
                    let delay = backoff_delay(attempt);
                    tracing::info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "connect failed, retrying: {}",
                        e
                    );
                    attempt += 1;

                    let mut gen_rx = inner.generation.subscribe();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = gen_rx.changed() => return Err(VoiceError::Cancelled),
                    }
                }
            }
        }
    }

    /// Sends a frame, transparently reconnecting when disconnected.
    ///
    /// While disconnected only the most recent pending frame is kept; after
    /// reconnecting the client waits [`SETTLE_DELAY`], then retries that
    /// frame exactly once.
    pub async fn send(&self, frame: String) -> Result<(), VoiceError> {
        {
            let mut sink = self.inner.sink.lock().await;
            if let Some(conn) = sink.as_mut() {
                return match conn.send(frame).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        sink.take();
                        self.inner.status_tx.send_replace(ConnectionStatus::Error);
                        Err(e)
                    }
                };
            }
        }

        // Disconnected: latest frame wins the single retry slot.
        *self.inner.pending.lock().expect("pending lock") = Some(frame);
        self.connect().await?;

        let gen = *self.inner.generation.borrow();
        let mut gen_rx = self.inner.generation.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(SETTLE_DELAY) => {}
            _ = gen_rx.changed() => return Err(VoiceError::Cancelled),
        }
        if *self.inner.generation.borrow() != gen {
            return Err(VoiceError::Cancelled);
        }

        let Some(frame) = self.inner.pending.lock().expect("pending lock").take() else {
            // Another caller already flushed the slot.
            return Ok(());
        };
        let mut sink = self.inner.sink.lock().await;
        match sink.as_mut() {
            Some(conn) => conn.send(frame).await,
            None => Err(VoiceError::Transport(
                "connection lost before pending send".to_string(),
            )),
        }
    }

    /// Tears the client down: closes the socket if open, cancels any
    /// pending reconnect/resend timer, and drops the pending frame. No
    /// further event callbacks fire afterwards. A subsequent `connect`
    /// starts a fresh generation.
    pub async fn disconnect(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
        if let Some(mut conn) = self.inner.sink.lock().await.take() {
            conn.close().await;
        }
        self.inner.pending.lock().expect("pending lock").take();
        self.inner.status_tx.send_replace(ConnectionStatus::Idle);
    }
}

fn spawn_recv_loop<T: Transport>(
    inner: Arc<ClientInner<T>>,
    mut stream: T::Stream,
    gen: u64,
) {
    tokio::spawn(async move {
        loop {
            if *inner.generation.borrow() != gen {
                return;
            }
            match stream.next_frame().await {
                Some(Ok(text)) => {
                    // Re-check after the await: teardown may have happened
                    // while this frame was in flight.
                    if *inner.generation.borrow() != gen {
                        return;
                    }
                    match serde_json::from_str::<ProviderFrame>(&text) {
                        Ok(frame) => {
                            if matches!(frame, ProviderFrame::Error { .. }) {
                                inner.status_tx.send_replace(ConnectionStatus::Error);
                            }
                            inner.events.on_frame(frame).await;
                        }
                        Err(e) => {
                            tracing::debug!("ignoring unrecognized provider frame: {}", e);
                        }
                    }
                }
                Some(Err(e)) => {
                    if *inner.generation.borrow() != gen {
                        return;
                    }
                    tracing::warn!("provider stream failed: {}", e);
                    inner.sink.lock().await.take();
                    inner.status_tx.send_replace(ConnectionStatus::Error);
                    let client = SessionClient {
                        inner: inner.clone(),
                    };
                    if let Err(e) = client.connect().await {
                        tracing::warn!("reconnect after stream failure gave up: {}", e);
                    }
                    return;
                }
                None => {
                    if *inner.generation.borrow() != gen {
                        return;
                    }
                    inner.sink.lock().await.take();
                    inner.status_tx.send_replace(ConnectionStatus::Idle);
                    return;
                }
            }
        }
    });
}

/// Production transport: a tungstenite WebSocket to the provider URL.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsSink {
    inner: SplitSink<WsSocket, Message>,
}

pub struct WsStream {
    inner: SplitStream<WsSocket>,
}

#[async_trait]
impl Transport for WsTransport {
    type Sink = WsSink;
    type Stream = WsStream;

    async fn connect(&self) -> Result<(WsSink, WsStream), VoiceError> {
        let (socket, _response) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| VoiceError::Transport(e.to_string()))?;
        let (sink, stream) = socket.split();
        Ok((WsSink { inner: sink }, WsStream { inner: stream }))
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), VoiceError> {
        self.inner
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| VoiceError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.send(Message::Close(None)).await;
    }
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next_frame(&mut self) -> Option<Result<String, VoiceError>> {
        while let Some(message) = self.inner.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(VoiceError::Transport(e.to_string()))),
            }
        }
        None
    }
}
