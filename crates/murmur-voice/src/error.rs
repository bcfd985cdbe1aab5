use thiserror::Error;

/// Errors produced by the voice-provider glue and the session client.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// External configuration create/delete failed. Surfaced to the caller;
    /// no automatic compensation is performed.
    #[error("provisioning error: {0}")]
    Provisioning(String),

    /// Socket connect/read/write failure. Recovered locally via the
    /// reconnection backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// The operation was cancelled by teardown before it could complete.
    #[error("operation cancelled by teardown")]
    Cancelled,

    /// The reconnection sequence exhausted its attempt budget.
    #[error("reconnect attempts exhausted after {attempts} failures")]
    RetriesExhausted { attempts: u32 },

    /// Audio capture could not be started.
    #[error("audio capture error: {0}")]
    Capture(String),
}
