//! Daemon settings: compiled defaults, then the JSON settings file, then
//! `OBSD_*` environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use obsd_session::{SessionId, SessionOptions};
use obsd_telemetry::TelemetryConfig;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn, Level};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module overrides, e.g. `"obsd_session::connection": "debug"`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
            modules: BTreeMap::new(),
        }
    }
}

impl LoggingSettings {
    pub fn telemetry_config(&self) -> TelemetryConfig {
        let log_level = parse_level(&self.level).unwrap_or_else(|| {
            warn!(value = %self.level, "invalid log level, using info");
            Level::INFO
        });
        let module_levels = self
            .modules
            .iter()
            .filter_map(|(module, level)| parse_level(level).map(|l| (module.clone(), l)))
            .collect();
        TelemetryConfig {
            log_level,
            module_levels,
            json: self.json,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SessionSettings {
    pub id: SessionId,
    #[serde(flatten)]
    pub options: SessionOptions,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub sessions: Vec<SessionSettings>,
}

pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".obsd").join("settings.json")
}

/// Load settings from `path` (missing file means defaults) and apply env
/// overrides.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let defaults = json!({
        "logging": serde_json::to_value(LoggingSettings::default())?,
        "sessions": [],
    });
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let user: Value = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Objects merge per key, everything else is replaced, nulls in `source` are
/// skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// `OBSD_URI` and friends apply to a single session: the first configured one,
/// or a new one named by `OBSD_SESSION_ID` (default `"default"`).
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Some(v) = read_env_string("OBSD_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("OBSD_LOG_JSON") {
        settings.logging.json = v;
    }

    let uri = read_env_string("OBSD_URI");
    let password = read_env_string("OBSD_PASSWORD");
    let timeout = read_env_u64("OBSD_REQUEST_TIMEOUT_MS", 100, 600_000);
    if uri.is_none() && password.is_none() && timeout.is_none() {
        return;
    }
    if settings.sessions.is_empty() {
        let id = read_env_string("OBSD_SESSION_ID").unwrap_or_else(|| "default".into());
        settings.sessions.push(SessionSettings {
            id: SessionId::from(id.as_str()),
            options: SessionOptions::default(),
        });
    }
    let Some(session) = settings.sessions.first_mut() else {
        return;
    };
    if let Some(uri) = uri {
        session.options.uri = uri;
    }
    if let Some(password) = password {
        session.options.password = Some(SecretString::from(password));
    }
    if let Some(timeout) = timeout {
        session.options.request_timeout_ms = timeout;
    }
}

pub fn parse_level(val: &str) -> Option<Level> {
    Level::from_str(val.trim()).ok()
}

/// Accepts `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
