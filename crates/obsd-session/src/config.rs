use std::time::Duration;

use obsd_core::protocol::{EventSubscription, RPC_VERSION};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

/// Everything a session needs to reach and supervise one OBS instance.
///
/// Durations are plain millisecond integers so the struct can be embedded in
/// the settings file as-is. Missing fields fall back to [`Default`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub uri: String,
    #[serde(deserialize_with = "deserialize_password")]
    pub password: Option<SecretString>,
    pub event_subscriptions: EventSubscription,
    pub rpc_version: u32,
    pub connect_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub stats_interval_ms: u64,
    pub backoff: BackoffConfig,
    pub supervisor: SupervisorConfig,
    pub task_pool_concurrency: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            uri: "ws://127.0.0.1:4455".into(),
            password: None,
            event_subscriptions: EventSubscription::ALL,
            rpc_version: RPC_VERSION,
            connect_timeout_ms: 5_000,
            auth_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            stats_interval_ms: 5_000,
            backoff: BackoffConfig::default(),
            supervisor: SupervisorConfig::default(),
            task_pool_concurrency: 8,
        }
    }
}

impl SessionOptions {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }
}

/// Reconnect backoff: `base * 2^attempt`, capped at `max`, with +/- jitter.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter_factor: 0.2,
            max_attempts: None,
        }
    }
}

/// Restart intensity and teardown bounds for the all-for-one group.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub restart_window_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_window_ms: 5_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn deserialize_password<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}
