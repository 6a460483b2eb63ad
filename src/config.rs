//! Runtime settings, read from the environment (and `.env` when present).

use std::{fmt::Display, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Context;

use crate::room::{registry::MIN_OUTBOX, relay::RelayLimits};

/// Room for the JSON envelope around a payload in a `sendMessage` frame.
const FRAME_OVERHEAD: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub addr: SocketAddr,
    pub max_payload_bytes: usize,
    pub empty_payload: Option<String>,
    pub outbound_buffer: usize,
    pub max_connections: usize,
    pub name_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 4001)),
            max_payload_bytes: RelayLimits::default().max_payload_bytes,
            empty_payload: None,
            outbound_buffer: 64,
            max_connections: 1024,
            name_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let name_timeout_secs: Option<u64> = parse(&lookup, "SCRIBBLE_NAME_TIMEOUT_SECS")?;

        Ok(Self {
            addr: parse(&lookup, "SCRIBBLE_ADDR")?.unwrap_or(defaults.addr),
            max_payload_bytes: parse(&lookup, "SCRIBBLE_MAX_PAYLOAD_BYTES")?
                .unwrap_or(defaults.max_payload_bytes),
            empty_payload: lookup("SCRIBBLE_EMPTY_PAYLOAD").filter(|v| !v.is_empty()),
            outbound_buffer: at_least(&lookup, "SCRIBBLE_OUTBOUND_BUFFER", MIN_OUTBOX)?
                .unwrap_or(defaults.outbound_buffer),
            max_connections: at_least(&lookup, "SCRIBBLE_MAX_CONNECTIONS", 1)?
                .unwrap_or(defaults.max_connections),
            name_timeout: match name_timeout_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.name_timeout,
            },
        })
    }

    pub fn relay_limits(&self) -> RelayLimits {
        RelayLimits {
            max_payload_bytes: self.max_payload_bytes,
            empty_payload: self.empty_payload.clone(),
        }
    }

    /// Largest websocket message accepted; anything bigger is a transport
    /// error rather than a rejected drawing.
    pub fn max_frame_bytes(&self) -> usize {
        self.max_payload_bytes.saturating_add(FRAME_OVERHEAD)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|err| anyhow::anyhow!("{err}"))
                .with_context(|| format!("invalid {key}={raw:?}"))
        })
        .transpose()
}

fn at_least(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    min: usize,
) -> anyhow::Result<Option<usize>> {
    match parse::<usize>(lookup, key)? {
        Some(value) if value < min => anyhow::bail!("{key} must be at least {min}, got {value}"),
        value => Ok(value),
    }
}
