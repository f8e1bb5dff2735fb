use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::classifier::{GoodBehaviorPolicy, ThreatPolicy};
use super::monitor::Monitor;
use super::service::PetService;

pub const CYBERPET_DIR: &str = ".cyberpet";

pub fn default_config_path() -> PathBuf {
    Path::new(CYBERPET_DIR).join("config.toml")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Frames buffered per client before it counts as too slow and is dropped.
    pub client_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
            client_queue: 64,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PetSection {
    pub history_capacity: usize,
    pub state_file: Option<PathBuf>,
}

impl Default for PetSection {
    fn default() -> Self {
        Self {
            history_capacity: super::pet::DEFAULT_HISTORY_CAPACITY,
            state_file: Some(Path::new(CYBERPET_DIR).join("pet_state.json")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub analyzer_timeout_secs: u64,
    pub error_backoff_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            analyzer_timeout_secs: 30,
            error_backoff_secs: 5,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn analyzer_timeout(&self) -> Duration {
        Duration::from_secs(self.analyzer_timeout_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerKind {
    #[default]
    Mock,
    Http,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub kind: AnalyzerKind,
    pub endpoint: Option<String>,
    /// Name of the environment variable holding a bearer token.
    pub api_key_env: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct PetConfig {
    pub server: ServerConfig,
    pub pet: PetSection,
    pub threat: ThreatPolicy,
    pub good_behavior: GoodBehaviorPolicy,
    pub monitor: MonitorConfig,
    pub analyzer: AnalyzerConfig,
}

impl PetConfig {
    /// Reads `path` if it exists, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            toml::from_str(&content).with_context(|| format!("Invalid config {:?}", path))?
        } else {
            Self::default()
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.sanitize();
        Ok(config)
    }

    /// Clamps policy values that would break the health bounds.
    pub fn sanitize(&mut self) {
        let threat = self.threat.sanitized();
        if threat != self.threat {
            warn!(?threat, "threat policy out of range, clamped");
            self.threat = threat;
        }
        let good_behavior = self.good_behavior.sanitized();
        if good_behavior != self.good_behavior {
            warn!(?good_behavior, "good behavior policy out of range, clamped");
            self.good_behavior = good_behavior;
        }
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("CYBERPET_BIND") {
            self.server.bind = bind;
        }
        if let Some(port) = lookup("CYBERPET_PORT") {
            self.server.port = port.parse().context("CYBERPET_PORT must be a port number")?;
        }
        if let Some(kind) = lookup("CYBERPET_ANALYZER") {
            self.analyzer.kind = match kind.to_ascii_lowercase().as_str() {
                "mock" => AnalyzerKind::Mock,
                "http" => AnalyzerKind::Http,
                other => anyhow::bail!("CYBERPET_ANALYZER must be `mock` or `http`, got `{}`", other),
            };
        }
        if let Some(url) = lookup("CYBERPET_ANALYZER_URL") {
            self.analyzer.endpoint = Some(url);
        }
        if let Some(secs) = lookup("CYBERPET_INTERVAL_SECS") {
            self.monitor.interval_secs = secs
                .parse()
                .context("CYBERPET_INTERVAL_SECS must be a whole number of seconds")?;
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Everything the HTTP layer needs, cheap to clone into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PetConfig>,
    pub service: Arc<PetService>,
    pub monitor: Arc<Monitor>,
}

impl AppState {
    pub fn new(config: PetConfig, service: Arc<PetService>, monitor: Arc<Monitor>) -> Self {
        Self {
            config: Arc::new(config),
            service,
            monitor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() -> Result<()> {
        let config: PetConfig = toml::from_str(
            r#"
[server]
port = 9100

[threat]
ignore_below = 60
"#,
        )?;
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.threat.ignore_below, 60);
        assert_eq!(config.threat.max_penalty, 25);
        assert_eq!(config.monitor.interval_secs, 10);
        assert_eq!(config.analyzer.kind, AnalyzerKind::Mock);
        Ok(())
    }

    #[test]
    fn test_env_overrides() -> Result<()> {
        let vars: HashMap<&str, &str> = [
            ("CYBERPET_PORT", "9999"),
            ("CYBERPET_ANALYZER", "HTTP"),
            ("CYBERPET_ANALYZER_URL", "http://127.0.0.1:7000/analyze"),
        ]
        .into_iter()
        .collect();
        let mut config = PetConfig::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()))?;
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.analyzer.kind, AnalyzerKind::Http);
        assert_eq!(
            config.analyzer.endpoint.as_deref(),
            Some("http://127.0.0.1:7000/analyze")
        );

        let mut config = PetConfig::default();
        assert!(config
            .apply_env(|k| (k == "CYBERPET_PORT").then(|| "eighty".to_string()))
            .is_err());
        Ok(())
    }

    #[test]
    fn test_load_clamps_out_of_range_policies() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[threat]
max_penalty = 255

[good_behavior]
health_per_step = 4294967295
max_health_per_credit = 4294967295
"#,
        )?;
        let config = PetConfig::load(&path)?;
        assert_eq!(config.threat.max_penalty, 50);
        assert_eq!(config.good_behavior.health_per_step, 100);
        assert_eq!(config.good_behavior.max_health_per_credit, 100);
        assert_eq!(PetConfig::default().threat.sanitized(), PetConfig::default().threat);
        Ok(())
    }

    #[test]
    fn test_default_config_round_trips_through_toml() -> Result<()> {
        let config = PetConfig::default();
        let parsed: PetConfig = toml::from_str(&config.to_toml()?)?;
        assert_eq!(parsed, config);
        Ok(())
    }
}
