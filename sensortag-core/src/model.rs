use serde::{Deserialize, Serialize};
use std::fmt;

use crate::radio::DeviceHandle;

/// Radio address of a peripheral, unique key in the registry.
pub type DeviceId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::Unknown => "Unknown",
            AdapterState::Resetting => "Resetting",
            AdapterState::Unsupported => "Unsupported",
            AdapterState::Unauthorized => "Unauthorized",
            AdapterState::PoweredOff => "PoweredOff",
            AdapterState::PoweredOn => "PoweredOn",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Discovering,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// States in which the radio is free for scanning.
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Discovering => "DISCOVERING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(name)
    }
}

/// Everything the registry knows about one peripheral.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub local_name: Option<String>,
    pub connection_state: ConnectionState,
    pub active_error: Option<String>,
    #[serde(skip)]
    pub device: Option<DeviceHandle>,
}

impl DeviceRecord {
    pub fn discovered(device: DeviceHandle) -> Self {
        Self {
            id: device.id(),
            local_name: device.local_name(),
            connection_state: ConnectionState::Disconnected,
            active_error: None,
            device: Some(device),
        }
    }
}
