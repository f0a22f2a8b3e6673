//! Clauth - local credential-brokering daemon.
//!
//! Untrusted "skills" submit brokered-request descriptors naming a
//! provider, an opaque credential handle, a scope, and a target endpoint;
//! the daemon injects authentication, enforces policy, records a
//! tamper-evident audit trail, and returns the upstream response. Skills
//! never see raw credentials.
//!
//! # Subsystems
//!
//! - **vault**: AES-256-GCM credential store under a passphrase-derived key
//! - **scopes**: grants with wildcard matching and per-grant rate limits
//! - **firewall**: per-skill behavioral baselines and anomaly detection
//! - **audit**: append-only hash-chained NDJSON event stream
//! - **auth**: skill tokens and revocable HS256 session claims
//! - **identity**: challenge/verify proofs of external-account ownership
//! - **proxy**: the brokered-request pipeline composing all of the above

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod advisory;
pub mod alerts;
pub mod audit;
pub mod auth;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod firewall;
pub mod identity;
pub mod oauth;
pub mod proxy;
pub mod runtime;
pub mod scopes;
pub mod server;
pub mod storage;
pub mod vault;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
