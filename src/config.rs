//! Configuration loading from `.env` files.

use std::{env, time::Duration};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relay WebSocket URL, e.g. `wss://relay.damus.io`.
    pub relay_url: String,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Relay URLs advertised in zap requests. Defaults to `relay_url`.
    pub zap_relays: Vec<String>,
    /// Comment placed in the zap request content.
    pub zap_comment: String,
    /// Deadline for one-shot relay queries.
    pub query_timeout: Duration,
    /// Deadline for LNURL HTTP requests.
    pub http_timeout: Duration,
    /// Deadline for the relay WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let relay_url = env::var("RELAY_URL").context("RELAY_URL not set")?;
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let mut zap_relays = csv_strings(env::var("ZAP_RELAYS").unwrap_or_default());
        if zap_relays.is_empty() {
            zap_relays = vec![relay_url.clone()];
        }
        let zap_comment = env::var("ZAP_COMMENT").unwrap_or_else(|_| "Zap!".into());
        let query_timeout = secs_var("QUERY_TIMEOUT_SECS", 10);
        let http_timeout = secs_var("HTTP_TIMEOUT_SECS", 10);
        let connect_timeout = secs_var("CONNECT_TIMEOUT_SECS", 10);
        Ok(Self {
            relay_url,
            tor_socks,
            zap_relays,
            zap_comment,
            query_timeout,
            http_timeout,
            connect_timeout,
        })
    }
}

/// Read a duration in whole seconds, falling back to `default`.
fn secs_var(name: &str, default: u64) -> Duration {
    let secs = env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
