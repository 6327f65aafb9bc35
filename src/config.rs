//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, str::FromStr};

use anyhow::{Context, Result};

/// Kinds stored by default: metadata, notes, contacts, deletions, reposts,
/// reactions and long-form articles.
pub const DEFAULT_ACCEPTED_KINDS: &str = "0,1,3,5,6,7,30023";

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all storage.
    pub store_root: PathBuf,
    /// Listen address for WebSocket and HTTP, e.g. `127.0.0.1:9900`.
    pub bind: String,
    /// Public relay URL expected in AUTH `relay` tags.
    pub relay_url: String,
    /// Enable Schnorr signature verification on publish and ingest.
    pub verify_sig: bool,
    /// Kinds the relay stores.
    pub accepted_kinds: Vec<u32>,
    /// Kinds that may only be published after AUTH.
    pub auth_required_kinds: Vec<u32>,
    /// Allowed AUTH clock skew in seconds.
    pub auth_max_skew: u64,
    /// Live subscriptions allowed per connection.
    pub max_subscriptions: usize,
    /// Largest inbound WebSocket message in bytes.
    pub max_message_bytes: usize,
    /// Per-frame write timeout in milliseconds.
    pub write_timeout_ms: u64,
    pub relay_name: Option<String>,
    pub relay_description: Option<String>,
    pub relay_pubkey: Option<String>,
    pub relay_contact: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT").context("STORE_ROOT is not set")?);
        let bind = env::var("BIND").context("BIND is not set")?;
        let relay_url = optional("RELAY_URL").unwrap_or_else(|| format!("ws://{bind}"));
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "1".into()) == "1";
        let accepted_kinds =
            csv_u32(env::var("ACCEPTED_KINDS").unwrap_or_else(|_| DEFAULT_ACCEPTED_KINDS.into()));
        let auth_required_kinds = csv_u32(env::var("AUTH_REQUIRED_KINDS").unwrap_or_default());
        Ok(Self {
            store_root,
            bind,
            relay_url,
            verify_sig,
            accepted_kinds,
            auth_required_kinds,
            auth_max_skew: number("AUTH_MAX_SKEW", 600)?,
            max_subscriptions: number("MAX_SUBSCRIPTIONS", 20)?,
            max_message_bytes: number("MAX_MESSAGE_BYTES", 512 * 1024)?,
            write_timeout_ms: number("WRITE_TIMEOUT_MS", 5000)?,
            relay_name: optional("RELAY_NAME"),
            relay_description: optional("RELAY_DESCRIPTION"),
            relay_pubkey: optional("RELAY_PUBKEY"),
            relay_contact: optional("RELAY_CONTACT"),
        })
    }
}

/// Non-empty value of `key`, if set.
fn optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Numeric value of `key`, or `default` when unset or empty.
fn number<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}")),
        None => Ok(default),
    }
}

/// Split a comma-separated string into `u32` values, skipping invalid entries.
pub fn csv_u32(input: impl AsRef<str>) -> Vec<u32> {
    let s = input.as_ref();
    s.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}
