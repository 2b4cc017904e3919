//! Configuration loading from `.env` files.

use std::{env, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

use crate::{
    chat::{DEFAULT_PRECISION, DEFAULT_SCOPE_PRECISION},
    geocell::MAX_PRECISION,
    session::PlaceScope,
};

/// Default wait for relays that never send `EOSE`.
pub const DEFAULT_EOSE_TIMEOUT_MS: u64 = 3400;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relays to read from.
    pub relays: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Own public key (hex).
    pub identity: Option<String>,
    /// Followed public keys (hex).
    pub contacts: Vec<String>,
    /// Whose places to show by default.
    pub place_scope: ScopeMode,
    /// Report end-of-backlog after this long even if relays stay silent.
    /// `None` waits for every relay.
    pub eose_timeout: Option<Duration>,
    /// Geocell precision of the chat title cell.
    pub chat_precision: usize,
    /// Prefix length of the chat area filter.
    pub chat_scope_precision: usize,
}

/// `PLACE_SCOPE` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeMode {
    /// Everyone's places.
    Global,
    /// Own places plus those of contacts.
    Contacts,
}

impl FromStr for ScopeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "global" => Ok(ScopeMode::Global),
            "contacts" => Ok(ScopeMode::Contacts),
            other => bail!("unknown place scope {other:?}"),
        }
    }
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let relays = csv_strings(env::var("RELAYS").context("RELAYS is not set")?);
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let identity = env::var("IDENTITY").ok().filter(|s| !s.is_empty());
        let contacts = csv_strings(env::var("CONTACTS").unwrap_or_default());
        let place_scope = env::var("PLACE_SCOPE")
            .unwrap_or_default()
            .parse()
            .context("PLACE_SCOPE")?;
        let eose_timeout = match number_or("EOSE_TIMEOUT_MS", DEFAULT_EOSE_TIMEOUT_MS)? {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let chat_precision = precision_or("CHAT_PRECISION", DEFAULT_PRECISION)?;
        let chat_scope_precision = precision_or("CHAT_SCOPE_PRECISION", DEFAULT_SCOPE_PRECISION)?;
        Ok(Self {
            relays,
            tor_socks,
            identity,
            contacts,
            place_scope,
            eose_timeout,
            chat_precision,
            chat_scope_precision,
        })
    }

    /// Place scope for the configured mode. Contacts scope covers the
    /// identity (when set) followed by every contact.
    pub fn place_scope(&self) -> PlaceScope {
        match self.place_scope {
            ScopeMode::Global => PlaceScope::Global,
            ScopeMode::Contacts => PlaceScope::Authors(
                self.identity
                    .iter()
                    .chain(&self.contacts)
                    .cloned()
                    .collect(),
            ),
        }
    }
}

/// Parse an optional numeric variable. Unset or empty yields `default`.
fn number_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse().with_context(|| format!("{name}={v}")),
        _ => Ok(default),
    }
}

/// Geocell length variable, within `1..=MAX_PRECISION`.
fn precision_or(name: &str, default: usize) -> Result<usize> {
    let value = number_or(name, default)?;
    if !(1..=MAX_PRECISION).contains(&value) {
        bail!("{name} must be between 1 and {MAX_PRECISION}, got {value}");
    }
    Ok(value)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}
