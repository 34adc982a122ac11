/*!
 * Radio Adapter Capability
 * The BLE transport surface the core drives and listens to
 */

pub mod mock;

use async_trait::async_trait;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::ScanOptions;
use crate::error::RadioError;
use crate::model::{AdapterState, DeviceId};

pub use mock::{MockPeripheral, MockRadio};

/// Receiving end of a callback-style radio API.
///
/// Closing (or dropping) the subscription closes the channel, so the producer
/// side sees the unsubscription on its next send instead of being ignored.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn channel() -> (mpsc::UnboundedSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Scan results: a matching device or an error raised by the scanner.
pub type ScanStream = Subscription<Result<DeviceHandle, RadioError>>;
/// Peripheral-initiated disconnects, with the error that caused them if any.
pub type DisconnectStream = Subscription<Option<RadioError>>;
/// Value-change notifications of one characteristic.
pub type NotificationStream = Subscription<Result<Vec<u8>, RadioError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub readable: bool,
    pub writable_with_response: bool,
    pub notifiable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

pub fn find_characteristic(services: &[Service], uuid: Uuid) -> Option<&Characteristic> {
    services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.uuid == uuid)
}

#[async_trait]
pub trait Radio: Send + Sync {
    /// Adapter power state; new receivers observe the current value first.
    fn power_states(&self) -> watch::Receiver<AdapterState>;

    /// Runtime permission needed before scanning. Platforms without one grant it.
    async fn check_scan_permission(&self) -> Result<bool, RadioError> {
        Ok(true)
    }

    async fn start_scan(&self, options: &ScanOptions) -> Result<ScanStream, RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;
}

#[async_trait]
pub trait Peripheral: Send + Sync {
    fn id(&self) -> DeviceId;

    fn local_name(&self) -> Option<String>;

    async fn connect(&self) -> Result<(), RadioError>;

    async fn discover_services(&self) -> Result<(), RadioError>;

    async fn services(&self) -> Result<Vec<Service>, RadioError>;

    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, RadioError>;

    async fn write_with_response(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), RadioError>;

    async fn monitor(&self, characteristic: &Characteristic)
        -> Result<NotificationStream, RadioError>;

    async fn on_disconnected(&self) -> Result<DisconnectStream, RadioError>;

    async fn cancel_connection(&self) -> Result<(), RadioError>;
}

/// Shared handle to a live peripheral object of the radio adapter.
#[derive(Clone)]
pub struct DeviceHandle(Arc<dyn Peripheral>);

impl DeviceHandle {
    pub fn new(peripheral: Arc<dyn Peripheral>) -> Self {
        Self(peripheral)
    }
}

impl Deref for DeviceHandle {
    type Target = dyn Peripheral;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.0.id())
            .field("local_name", &self.0.local_name())
            .finish()
    }
}

/// Printable rendering of a characteristic value: text when it is UTF-8, hex otherwise.
pub fn decode_value(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => value
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" "),
    }
}
