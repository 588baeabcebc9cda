use crate::error::{LiveError, Result};
use crate::logging::LogConfig;
use crate::model::StatusSet;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client settings, loaded from an optional JSON file and then overridden by CLI flags.
///
/// The bearer credential is deliberately absent: it is passed around as a
/// [`Credential`] and never read from or written to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    /// Log-lines service; defaults to `base_url` when unset.
    pub cdn_url: Option<String>,
    /// Websocket path, appended to `base_url`.
    pub events_path: String,
    pub user_agent: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub transport: TransportConfig,
    pub poller: PollerConfig,
    pub tail: TailConfig,
    pub active_statuses: StatusSet,
    pub log: LogConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".into(),
            cdn_url: None,
            events_path: "/ws".into(),
            user_agent: format!("runwatch/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(30),
            transport: TransportConfig::default(),
            poller: PollerConfig::default(),
            tail: TailConfig::default(),
            active_statuses: StatusSet::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_initial: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_max: Duration,
    /// Fraction of each reconnect delay randomised up or down.
    pub reconnect_jitter: f64,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    /// No inbound frame (data or pong) for this long drops the connection.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Capacity of the transport -> multiplexer channel.
    pub event_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            reconnect_jitter: 0.2,
            max_reconnect_attempts: None,
            keepalive_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(45),
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollerConfig {
    /// Length of one backoff time unit.
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// Ticks between fetches while the resource keeps answering.
    pub base_interval: u64,
    /// Consecutive retryable outcomes tolerated before giving up. `None` = unbounded.
    pub max_retries: Option<u32>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            base_interval: 1,
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TailConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Lines requested per page; 0 lets the server choose.
    pub page_size: u64,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            page_size: 500,
        }
    }
}

impl ClientConfig {
    /// `$XDG_CONFIG_HOME/runwatch/config.json` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("runwatch").join("config.json"))
    }

    /// Load from `path`, or from the default location when it exists.
    ///
    /// An explicit path that cannot be read is an error; a missing default file is not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) if p.exists() => (p, false),
                _ => return Ok(Self::default()),
            },
        };
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default())
            }
            Err(e) => {
                return Err(LiveError::Config(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        let cfg: Self = serde_json::from_str(&raw)
            .map_err(|e| LiveError::Config(format!("parse {}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| LiveError::Config(format!("base_url '{}': {e}", self.base_url)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(LiveError::Config(format!(
                "base_url must be http or https, got '{}'",
                base.scheme()
            )));
        }
        if let Some(cdn) = &self.cdn_url {
            Url::parse(cdn).map_err(|e| LiveError::Config(format!("cdn_url '{cdn}': {e}")))?;
        }
        let t = &self.transport;
        if t.reconnect_initial.is_zero() {
            return Err(LiveError::Config("reconnect_initial must be > 0".into()));
        }
        if t.reconnect_max < t.reconnect_initial {
            return Err(LiveError::Config(
                "reconnect_max must be >= reconnect_initial".into(),
            ));
        }
        if t.keepalive_interval.is_zero() || t.idle_timeout <= t.keepalive_interval {
            return Err(LiveError::Config(
                "idle_timeout must exceed a non-zero keepalive_interval".into(),
            ));
        }
        if t.event_buffer == 0 {
            return Err(LiveError::Config("event_buffer must be > 0".into()));
        }
        if self.poller.tick.is_zero() || self.tail.interval.is_zero() {
            return Err(LiveError::Config("poll intervals must be > 0".into()));
        }
        Ok(())
    }

    /// Websocket endpoint derived from `base_url` and `events_path`.
    pub fn events_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| LiveError::Config(format!("base_url '{}': {e}", self.base_url)))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| LiveError::Config(format!("cannot derive {scheme} url")))?;
        url.set_path(&join_path(url.path(), &self.events_path));
        Ok(url.to_string())
    }

    pub fn cdn_base(&self) -> &str {
        self.cdn_url.as_deref().unwrap_or(&self.base_url)
    }
}

pub(crate) fn join_path(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Opaque bearer credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ClientConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.transport.idle_timeout, Duration::from_secs(45));
        assert_eq!(cfg.poller.base_interval, 1);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: ClientConfig = serde_json::from_str(
            r#"{
                "base_url": "https://ci.example.com",
                "transport": {"keepalive_interval": "10s", "max_reconnect_attempts": 5},
                "active_statuses": ["Building", "Waiting", "Scheduling"]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.transport.keepalive_interval, Duration::from_secs(10));
        assert_eq!(cfg.transport.max_reconnect_attempts, Some(5));
        assert_eq!(cfg.transport.connect_timeout, Duration::from_secs(10));
        assert!(cfg.active_statuses.is_active("Scheduling"));
        assert_eq!(cfg.tail, TailConfig::default());
    }

    #[test]
    fn events_url_follows_scheme() {
        let mut cfg = ClientConfig {
            base_url: "https://ci.example.com/api/".into(),
            ..ClientConfig::default()
        };
        assert_eq!(cfg.events_url().unwrap(), "wss://ci.example.com/api/ws");
        cfg.base_url = "http://localhost:8081".into();
        assert_eq!(cfg.events_url().unwrap(), "ws://localhost:8081/ws");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = ClientConfig::default();
        cfg.transport.idle_timeout = Duration::from_secs(5);
        assert!(matches!(cfg.validate(), Err(LiveError::Config(_))));

        let cfg = ClientConfig {
            base_url: "ftp://nope".into(),
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = ClientConfig::load(Some(Path::new("/definitely/not/here.json"))).unwrap_err();
        assert!(matches!(err, LiveError::Config(_)));
    }

    #[test]
    fn credential_debug_is_redacted() {
        let c = Credential::new("s3cret");
        assert_eq!(format!("{c:?}"), "Credential(***)");
        assert_eq!(c.header_value(), "Bearer s3cret");
    }
}
