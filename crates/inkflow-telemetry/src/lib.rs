use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "inkflow_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines on stdout instead of human-readable output.
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

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid filter directive: {0}")]
    Filter(String),
    #[error("global subscriber already installed: {0}")]
    AlreadyInitialized(String),
    #[error("filter reload failed: {0}")]
    Reload(String),
}

/// Keeps the installed filter reachable so levels can change at runtime.
pub struct TelemetryGuard {
    handle: reload::Handle<EnvFilter, Registry>,
    log_level: Level,
    module_levels: RwLock<Vec<(String, Level)>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let directives = {
            let mut levels = self.module_levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.log_level, &levels)
        };
        let filter = EnvFilter::try_new(&directives).map_err(|e| TelemetryError::Filter(e.to_string()))?;
        self.handle
            .reload(filter)
            .map_err(|e| TelemetryError::Reload(e.to_string()))
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let directives = filter_directives(config.log_level, &config.module_levels);
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&directives).map_err(|e| TelemetryError::Filter(e.to_string()))?,
    };
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    Ok(TelemetryGuard {
        handle,
        log_level: config.log_level,
        module_levels: RwLock::new(config.module_levels),
    })
}

/// Build an `EnvFilter` directive string: default level first, then one
/// `module=level` entry per override.
pub fn filter_directives(default: Level, modules: &[(String, Level)]) -> String {
    let mut filter = default.to_string().to_lowercase();
    for (module, level) in modules {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Parse a level name as used in settings files ("debug", "WARN", ...).
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse().ok()
}
