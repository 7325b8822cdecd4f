//! Inbound caller authentication.
//!
//! Tokens are verified against a hot-reloaded map of trusted issuers to
//! their public keys. See [`keyset`] for the verification rules.

pub mod claims;
pub mod keyset;

pub use claims::Claims;
pub use keyset::{Keyset, KeysetStore, VerificationError, VerificationKey};
