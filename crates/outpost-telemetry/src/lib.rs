mod metrics;

pub use metrics::{HistogramSummary, MetricSample, MetricType, MetricsRecorder};

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid filter directive: {0}")]
    InvalidFilter(String),
    #[error("failed to install subscriber: {0}")]
    Init(String),
    #[error("failed to reload filter: {0}")]
    Reload(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "outpost_link" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per line instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string, e.g. `info,outpost_link=debug`.
    pub fn directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Parse a level name (`trace`..`error`, case-insensitive).
pub fn parse_level(s: &str) -> Option<Level> {
    s.trim().parse().ok()
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Handle kept alive by the binary: runtime level control and metrics.
pub struct TelemetryGuard {
    filter: Option<FilterHandle>,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
    base_level: RwLock<Level>,
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    /// Guard with no installed subscriber. Used by tests and embedders that
    /// bring their own subscriber.
    pub fn detached(config: &TelemetryConfig) -> Self {
        Self {
            filter: None,
            module_levels: Arc::new(RwLock::new(config.module_levels.clone())),
            base_level: RwLock::new(config.log_level),
            metrics: Arc::new(MetricsRecorder::new()),
        }
    }

    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        {
            let mut levels = self.module_levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
        }
        self.apply()
    }

    /// Change the default level at runtime. Module overrides are kept.
    pub fn set_level(&self, level: Level) -> Result<(), TelemetryError> {
        *self.base_level.write() = level;
        self.apply()
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// Shared metrics recorder.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics.clone()
    }

    fn current_directives(&self) -> String {
        TelemetryConfig {
            log_level: *self.base_level.read(),
            module_levels: self.module_levels(),
            json: false,
        }
        .directives()
    }

    fn apply(&self) -> Result<(), TelemetryError> {
        let Some(handle) = &self.filter else {
            return Ok(());
        };
        let directives = self.current_directives();
        let filter = EnvFilter::try_new(&directives)
            .map_err(|e| TelemetryError::InvalidFilter(e.to_string()))?;
        handle
            .reload(filter)
            .map_err(|e| TelemetryError::Reload(e.to_string()))
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let directives = config.directives();
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&directives)
            .map_err(|e| TelemetryError::InvalidFilter(e.to_string()))?,
    };
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    let mut guard = TelemetryGuard::detached(&config);
    guard.filter = Some(handle);
    Ok(guard)
}
