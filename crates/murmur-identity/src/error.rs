use thiserror::Error;

/// Errors raised at the identity boundary. All of these reject the request
/// at the edge; none are retried by this crate.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No bearer token was supplied with the upgrade request.
    #[error("missing bearer token")]
    MissingToken,

    /// The identity provider rejected the token, or it could not be
    /// checked.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The token verified but carried no subject.
    #[error("token has an empty subject")]
    EmptySubject,

    /// One or more of the required webhook signature headers is absent.
    #[error("missing webhook signature headers")]
    MissingSignatureHeaders,

    /// The webhook payload signature did not match any provided signature.
    #[error("webhook signature verification failed")]
    InvalidSignature,

    /// The webhook timestamp is outside the accepted tolerance window.
    #[error("webhook timestamp outside tolerance")]
    StaleTimestamp,

    /// The webhook signing secret is malformed.
    #[error("malformed webhook signing secret: {0}")]
    MalformedSecret(String),

    /// Transport failure talking to the identity provider.
    #[error("identity provider request failed: {0}")]
    Http(String),

    /// The provider accepted the request but returned an unusable body.
    #[error("identity provider response invalid: {0}")]
    InvalidResponse(String),
}
