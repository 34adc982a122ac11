/*!
 * SensorTag Connection Core
 * Device registry, scan gating and per-device connection sessions
 * Onyx Digital Intelligence Development LLC
 */

pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod radio;
pub mod registry;
pub mod scan;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod tasks;
pub mod watcher;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::SensorTagConfig;
pub use coordinator::Coordinator;
pub use error::{ConfigError, RadioError};
pub use model::{AdapterState, ConnectionState, DeviceId, DeviceRecord};
pub use radio::{DeviceHandle, Peripheral, Radio};
pub use registry::{Action, AppState};
pub use store::Store;
pub use tasks::{TaskDescriptor, TaskRegistry};

/// Locks a mutex, carrying on with the inner value if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
