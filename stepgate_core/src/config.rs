use crate::clock::{clamp_tempo, StallPolicy, DEFAULT_TEMPO};
use crate::error::ConfigError;
use std::time::Duration;
use url::Url;

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/ws";
pub const DEFAULT_TRIGGER_MS: u32 = 50;
pub const OUTBOUND_CAP: usize = 256;

const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(500);
const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(10);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: Url,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// `None` disables the liveness probe.
    pub ping_interval: Option<Duration>,
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
    pub outbound_capacity: usize,
}

impl SessionConfig {
    /// Default timings for the given endpoint.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_max: DEFAULT_RECONNECT_MAX,
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            ping_timeout: DEFAULT_PING_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            outbound_capacity: OUTBOUND_CAP,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = lookup("STEPGATE_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string());
        let mut config = Self::new(parse_ws_url(&url)?);
        if let Some(ms) = parse_u64(&lookup, "STEPGATE_RECONNECT_BASE_MS")? {
            config.reconnect_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "STEPGATE_RECONNECT_MAX_MS")? {
            config.reconnect_max = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "STEPGATE_PING_INTERVAL_MS")? {
            config.ping_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = parse_u64(&lookup, "STEPGATE_PING_TIMEOUT_MS")? {
            config.ping_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "STEPGATE_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("reconnect base", Some(self.reconnect_base)),
            ("ping interval", self.ping_interval),
            ("ping timeout", Some(self.ping_timeout)),
            ("connect timeout", Some(self.connect_timeout)),
        ];
        for (name, value) in durations {
            if value == Some(Duration::ZERO) {
                return Err(ConfigError::ZeroDuration { name });
            }
        }
        if self.reconnect_max < self.reconnect_base {
            return Err(ConfigError::Backoff {
                base_ms: self.reconnect_base.as_millis() as u64,
                max_ms: self.reconnect_max.as_millis() as u64,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerConfig {
    pub tempo: u32,
    pub trigger_ms: u32,
    pub stall_policy: StallPolicy,
}

impl SequencerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(tempo) = parse_u64(&lookup, "STEPGATE_TEMPO")? {
            config.tempo = clamp_tempo(tempo.min(u32::MAX as u64) as u32);
        }
        if let Some(ms) = parse_u64(&lookup, "STEPGATE_TRIGGER_MS")? {
            if ms == 0 || ms > u32::MAX as u64 {
                return Err(ConfigError::Number {
                    name: "STEPGATE_TRIGGER_MS",
                    value: ms.to_string(),
                });
            }
            config.trigger_ms = ms as u32;
        }
        if let Some(policy) = lookup("STEPGATE_STALL_POLICY") {
            config.stall_policy = policy.parse()?;
        }
        Ok(config)
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            tempo: DEFAULT_TEMPO,
            trigger_ms: DEFAULT_TRIGGER_MS,
            stall_policy: StallPolicy::default(),
        }
    }
}

pub fn parse_ws_url(value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim()).map_err(|source| ConfigError::Url {
        value: value.to_string(),
        source,
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::Scheme(other.to_string())),
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::Number {
            name,
            value: raw.to_string(),
        })
}
