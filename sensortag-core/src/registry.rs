/*!
 * Device Registry
 * Application state and the pure reducer that advances it
 */

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use crate::model::{AdapterState, ConnectionState, DeviceId, DeviceRecord};
use crate::radio::DeviceHandle;
use crate::tasks::WRITE_TAG;

#[derive(Debug, Clone)]
pub enum Action {
    Log(String),
    ClearLogs,
    ClearDevices,
    DeviceDiscovered(DeviceHandle),
    ConnectionStateChanged {
        id: DeviceId,
        state: ConnectionState,
    },
    AdapterStateChanged(AdapterState),
    DeviceError {
        id: DeviceId,
        message: String,
    },

    // Commands
    Connect(DeviceHandle),
    Disconnect {
        id: DeviceId,
    },
    ExecuteTest {
        id: DeviceId,
        test: String,
    },
    WriteTag {
        id: DeviceId,
        payload: Option<Vec<u8>>,
    },

    // Task signals
    TestFinished,
    WriteFinished,
}

impl Action {
    /// Device a session command is addressed to.
    pub fn target(&self) -> Option<&str> {
        match self {
            Action::Disconnect { id }
            | Action::ExecuteTest { id, .. }
            | Action::WriteTag { id, .. } => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AppState {
    /// Newest first
    pub logs: VecDeque<String>,
    pub current_test: Option<String>,
    pub adapter_state: AdapterState,
    pub devices: BTreeMap<DeviceId, DeviceRecord>,
}

impl AppState {
    pub fn device(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.device(id)
            .map_or(false, |d| d.connection_state == ConnectionState::Connected)
    }

    /// A test may start when its own device is connected and nothing else runs.
    pub fn can_execute_test(&self, id: &str) -> bool {
        self.is_connected(id) && self.current_test.is_none()
    }

    pub fn reduce(mut self, action: &Action) -> AppState {
        match action {
            Action::Log(message) => {
                self.logs.push_front(message.clone());
            }
            Action::ClearLogs => {
                self.logs.clear();
            }
            Action::ClearDevices => {
                self.devices.clear();
            }
            Action::DeviceDiscovered(device) => {
                let record = DeviceRecord::discovered(device.clone());
                let duplicate = self.devices.values().any(|known| {
                    known.id == record.id
                        || (known.local_name.is_some() && known.local_name == record.local_name)
                });
                if duplicate {
                    return self;
                }
                self.logs.push_front(format!(
                    "SensorTag found: {} {}",
                    record.local_name.as_deref().unwrap_or("<unnamed>"),
                    record.id
                ));
                self.devices.insert(record.id.clone(), record);
            }
            Action::ConnectionStateChanged { id, state } => {
                let Some(record) = self.devices.get_mut(id) else {
                    return self;
                };
                record.connection_state = *state;
                if *state == ConnectionState::Connecting {
                    record.active_error = None;
                }
                self.logs
                    .push_front(format!("Connection state changed: {} {}", id, state));
            }
            Action::AdapterStateChanged(state) => {
                self.adapter_state = *state;
                self.logs.push_front(format!("BLE state changed: {}", state));
            }
            Action::DeviceError { id, message } => {
                if let Some(record) = self.devices.get_mut(id) {
                    record.active_error = Some(message.clone());
                }
                self.logs.push_front(format!("ERROR: {} ({})", message, id));
            }
            Action::ExecuteTest { id, test } => {
                if self.is_connected(id) {
                    self.current_test = Some(test.clone());
                }
            }
            Action::WriteTag { id, .. } => {
                // a running test keeps its marker while the write runs beside it
                if self.is_connected(id) && self.current_test.is_none() {
                    self.current_test = Some(WRITE_TAG.to_string());
                }
            }
            Action::TestFinished => {
                if self.current_test.as_deref() != Some(WRITE_TAG) {
                    self.current_test = None;
                }
            }
            Action::WriteFinished => {
                if self.current_test.as_deref() == Some(WRITE_TAG) {
                    self.current_test = None;
                }
            }
            Action::Connect(_) | Action::Disconnect { .. } => {}
        }
        self
    }
}
