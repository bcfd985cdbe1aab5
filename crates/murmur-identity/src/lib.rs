//! External identity platform glue: bearer-token verification, user
//! metadata writes, and webhook signature verification.
//!
//! Token issuance itself is the provider's concern; this crate only checks
//! tokens and signatures at the relay's boundary.

pub mod error;
pub mod token;
pub mod webhook;

pub use error::IdentityError;
pub use token::{Claims, HttpIdentityProvider, IdentityProvider};
pub use webhook::{sign, verify_webhook_signature, SignatureHeaders};
