//! Voice-AI provider integration: per-user configuration provisioning, the
//! reconnecting session client, and the microphone capture pipeline.
//!
//! The relay server provisions one provider configuration per user (see
//! [`provision`]). Clients talk to the provider through a
//! [`client::SessionClient`], which supervises the WebSocket with capped
//! exponential backoff and replays the latest pending frame after a
//! reconnect. Captured audio flows through [`audio`] as interim
//! `audio_input` frames.

pub mod audio;
pub mod client;
pub mod error;
pub mod provision;

pub use audio::{encode_pcm_block, start_audio_stream, AudioStream, CaptureDevice};
pub use client::{
    backoff_delay, ConnectionStatus, ProviderEventSink, ProviderFrame, SessionClient,
    StoreEventSink, Transport, WsTransport, MAX_RECONNECT_ATTEMPTS, SETTLE_DELAY,
};
pub use error::VoiceError;
pub use provision::{HttpVoiceProvider, VoiceConfig, VoiceProvider, BASE_SYSTEM_PROMPT};
