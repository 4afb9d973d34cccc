//! Startup configuration.
//!
//! One JSON file with a section per agent plus broker and runtime knobs;
//! every section falls back to its defaults, so a partial file (or none at
//! all) is fine. A couple of operational knobs also accept `FXSWARM_*`
//! environment overrides when no file is given.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::agents::{
    AssetSelectionConfig, ExecutionConfig, FundamentalConfig, RiskConfig, StrategyConfig,
    TechnicalConfig,
};
use crate::fabric::agent::AgentRuntimeConfig;
use crate::fabric::broker::BrokerConfig;
use crate::gateway::SimulationConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub cache_ttl_ms: u64,
    pub inbox_capacity: Option<usize>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 5_000,
            inbox_capacity: None,
        }
    }
}

impl BrokerSettings {
    pub fn to_config(&self) -> BrokerConfig {
        BrokerConfig {
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            inbox_capacity: self.inbox_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_interval_ms: 500,
        }
    }
}

impl RuntimeSettings {
    pub fn to_config(&self) -> AgentRuntimeConfig {
        AgentRuntimeConfig {
            batch_size: self.batch_size,
            batch_interval: Duration::from_millis(self.batch_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub runtime: RuntimeSettings,
    pub technical: TechnicalConfig,
    pub fundamental: FundamentalConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub asset_selection: AssetSelectionConfig,
    pub execution: ExecutionConfig,
    pub simulation: SimulationConfig,
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Settings> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("parsing settings from {}", path.display()))?;
        info!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// File settings when a path is given, otherwise defaults with the
    /// environment overrides applied.
    pub fn load_or_env(path: Option<&Path>) -> anyhow::Result<Settings> {
        match path {
            Some(path) => Settings::load(path),
            None => Ok(Settings {
                risk: RiskConfig::from_env(),
                execution: ExecutionConfig::from_env(),
                ..Settings::default()
            }),
        }
    }
}
