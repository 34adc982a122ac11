/*!
 * Control Protocol
 * JSON lines exchanged over the daemon socket
 */

use sensortag_core::{AdapterState, AppState, ConnectionState, TaskDescriptor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    GetState,
    ListTests,
    Connect { id: String },
    Disconnect { id: String },
    ExecuteTest { id: String, test: String },
    WriteTag { id: String, payload: Option<String> },
    ClearLogs,
    ClearDevices,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    State { state: StateView },
    Tests { tests: Vec<TestView> },
    Success { message: String },
    Error { message: String },
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Response::Success {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceView {
    pub id: String,
    pub local_name: Option<String>,
    pub connection_state: ConnectionState,
    pub active_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateView {
    pub adapter_state: AdapterState,
    pub current_test: Option<String>,
    pub devices: Vec<DeviceView>,
    /// Newest first
    pub logs: Vec<String>,
}

impl From<&AppState> for StateView {
    fn from(state: &AppState) -> Self {
        Self {
            adapter_state: state.adapter_state,
            current_test: state.current_test.clone(),
            devices: state
                .devices
                .values()
                .map(|d| DeviceView {
                    id: d.id.clone(),
                    local_name: d.local_name.clone(),
                    connection_state: d.connection_state,
                    active_error: d.active_error.clone(),
                })
                .collect(),
            logs: state.logs.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestView {
    pub id: String,
    pub title: String,
}

impl From<&TaskDescriptor> for TestView {
    fn from(task: &TaskDescriptor) -> Self {
        Self {
            id: task.id.to_string(),
            title: task.title.to_string(),
        }
    }
}
