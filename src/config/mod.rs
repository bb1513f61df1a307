use serde::Deserialize;
use std::time::Duration;

/// Complete enricher configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnricherConfig {
    #[serde(default)]
    pub enrichment: EnrichmentSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Settings every enricher reads at attach time
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentSettings {
    /// Bound on resolving a transformer target value, per event
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    /// Bound on resolving a reducer source sensor expression
    #[serde(default = "default_resolve_timeout_ms")]
    pub sensor_resolve_timeout_ms: u64,
    /// Default for enrichers that do not choose
    #[serde(default)]
    pub suppress_duplicates: bool,
}

fn default_resolve_timeout_ms() -> u64 {
    250
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            resolve_timeout_ms: default_resolve_timeout_ms(),
            sensor_resolve_timeout_ms: default_resolve_timeout_ms(),
            suppress_duplicates: false,
        }
    }
}

impl EnrichmentSettings {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn sensor_resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor_resolve_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "enricher=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// Parameters of the demo simulation
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_members")]
    pub members: usize,
    #[serde(default = "default_ticks")]
    pub ticks: u32,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Upper bound of the random load each member reports
    #[serde(default = "default_max_load")]
    pub max_load: f64,
}

fn default_members() -> usize {
    3
}

fn default_ticks() -> u32 {
    10
}

fn default_tick_interval_ms() -> u64 {
    200
}

fn default_max_load() -> f64 {
    100.0
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            members: default_members(),
            ticks: default_ticks(),
            tick_interval_ms: default_tick_interval_ms(),
            max_load: default_max_load(),
        }
    }
}

impl SimulationConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl EnricherConfig {
    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply ENRICHER_* environment variables on top of this configuration
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ENRICHER_RESOLVE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.enrichment.resolve_timeout_ms = ms;
            }
        }
        if let Some(v) = lookup("ENRICHER_SUPPRESS_DUPLICATES") {
            if let Ok(b) = v.parse::<bool>() {
                self.enrichment.suppress_duplicates = b;
            }
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<EnricherConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: EnricherConfig = toml::from_str(&contents)?;
    Ok(config)
}
