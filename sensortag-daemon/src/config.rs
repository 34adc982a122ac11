use anyhow::{Context, Result};
use sensortag_core::SensorTagConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
    /// How often the adapter power state is sampled
    pub power_poll_interval_ms: u64,
    pub sensortag: SensorTagConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/run/sensortag/sensortagd.sock".to_string(),
            power_poll_interval_ms: 1000,
            sensortag: SensorTagConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self> {
        let config: Self = match fs::read_to_string(path) {
            Ok(content) => {
                toml::from_str(&content).with_context(|| format!("invalid config {}", path))?
            }
            Err(_) => {
                // Create default config if not found
                let config = Self::default();
                if let Err(e) = fs::write(path, toml::to_string_pretty(&config)?) {
                    tracing::debug!("could not write default config to {}: {}", path, e);
                }
                config
            }
        };
        config.sensortag.validate()?;
        Ok(config)
    }

    pub fn power_poll_interval(&self) -> Duration {
        Duration::from_millis(self.power_poll_interval_ms.max(50))
    }
}
