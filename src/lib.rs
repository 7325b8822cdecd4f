//! Trust Sidecar Library
//!
//! Sidecar proxy that enforces service-to-service trust for one HTTP workload.
//!
//! # Features
//!
//! - **Authentication**: bearer tokens verified against a hot-reloaded issuer keyset
//! - **Authorization**: fail-closed Rego or static-whitelist policy per request
//! - **Credential attachment**: best-matching audience credential on outbound calls
//! - **Hot reload**: every trust source re-read on its own interval, last good
//!   snapshot kept on failure
//!
//! # Layout
//!
//! [`refresh`] is the reload primitive; [`authn`], [`authz`] and
//! [`credentials`] are the three stores built on it; [`proxy`] composes them
//! into the inbound and outbound gateways.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authn;
pub mod authz;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod proxy;
pub mod refresh;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}
