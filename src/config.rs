//! Settings aggregator: layers a base file, an environment-specific file, a
//! local override file, then `EXECUTION__`-prefixed env vars, the same
//! precedence order the teacher's own `Settings::new` uses.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::circuit_breaker::BreakerConfig;
use crate::confirmation::ConfirmationConfig;
use crate::engine::EngineConfig;
use crate::fallback::FallbackConfig;
use crate::risk::{AdaptiveVarConfig, MarginMonitorConfig};
use crate::splitter::SplitterConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub splitter: SplitterConfig,
    #[serde(default)]
    pub adaptive_var: AdaptiveVarConfig,
    #[serde(default)]
    pub margin_monitor: MarginMonitorConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub nats_url: String,
    pub breaker_lockfile: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            nats_url: "nats://localhost:4222".to_string(),
            breaker_lockfile: "/tmp/execution-pipeline/breaker.lock".to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            confirmation: ConfirmationConfig::default(),
            breaker: BreakerConfig::default(),
            splitter: SplitterConfig::default(),
            adaptive_var: AdaptiveVarConfig::default(),
            margin_monitor: MarginMonitorConfig::default(),
            fallback: FallbackConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let s = Config::builder()
            .add_source(File::with_name(&format!("{}/.execution-pipeline/config", home)).required(false))
            .add_source(File::with_name("config/config").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("EXECUTION").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_spec_constants() {
        let settings = Settings::default();
        assert_eq!(settings.engine.default_timeout_seconds, 30.0);
        assert_eq!(settings.engine.max_concurrent_plans, 100);
        assert_eq!(settings.server.port, 8080);
    }
}
