mod metrics;

pub use metrics::{ConnectionMetrics, Metric, MetricsSnapshot};

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var at startup.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "obsd_session::connection" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

/// Keeps the reloadable filter alive and allows runtime level changes.
pub struct TelemetryGuard {
    base_level: Level,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
    filter: reload::Handle<EnvFilter, Registry>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.module_levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };
        if let Err(e) = self.filter.reload(EnvFilter::new(directives)) {
            tracing::warn!(error = %e, "failed to reload log filter");
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }
}

/// Initialize logging. Call once at startup; a second call leaves the first
/// subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let directives = filter_directives(config.log_level, &config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));
    let (filter_layer, filter) = reload::Layer::new(env_filter);

    let json_layer = config.json.then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let plain_layer = (!config.json).then(|| fmt::layer().with_target(true));

    if let Err(e) = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(plain_layer)
        .try_init()
    {
        eprintln!("obsd-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        base_level: config.log_level,
        module_levels: Arc::new(RwLock::new(config.module_levels)),
        filter,
    }
}

/// Render a level plus module overrides as an `EnvFilter` directive string.
pub fn filter_directives(level: Level, module_levels: &[(String, Level)]) -> String {
    let mut out = level.to_string().to_lowercase();
    for (module, level) in module_levels {
        out.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    out
}
