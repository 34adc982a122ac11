use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Characteristic the session subscribes to for value-change notifications.
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
/// Characteristic the write task sends tag payloads to.
pub const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

pub const DEFAULT_WRITE_PAYLOAD: &str = "/rgb/000000000000/";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SensorTagConfig {
    /// Advertised names accepted by the scanner
    pub allow_list: Vec<String>,
    pub notify_characteristic: Uuid,
    pub write_characteristic: Uuid,
    pub default_write_payload: String,
    pub scan: ScanOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanOptions {
    pub allow_duplicates: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            allow_duplicates: false,
        }
    }
}

impl Default for SensorTagConfig {
    fn default() -> Self {
        Self {
            allow_list: vec!["NEBULA".to_string(), "AURELIAN".to_string()],
            notify_characteristic: NOTIFY_CHARACTERISTIC,
            write_characteristic: WRITE_CHARACTERISTIC,
            default_write_payload: DEFAULT_WRITE_PAYLOAD.to_string(),
            scan: ScanOptions::default(),
        }
    }
}

impl SensorTagConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allow_list.is_empty() {
            return Err(ConfigError::AllowList("no names configured".to_string()));
        }
        if let Some(blank) = self.allow_list.iter().find(|n| n.trim().is_empty()) {
            return Err(ConfigError::AllowList(format!("blank entry {:?}", blank)));
        }
        if self.notify_characteristic == self.write_characteristic {
            return Err(ConfigError::CharacteristicClash(self.notify_characteristic));
        }
        Ok(())
    }

    pub fn accepts(&self, local_name: Option<&str>) -> bool {
        match local_name {
            Some(name) => self.allow_list.iter().any(|allowed| allowed == name),
            None => false,
        }
    }
}
