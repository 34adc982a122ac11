/*!
 * In-memory radio adapter
 * Scriptable stand-in for the BLE transport, used by the test suites
 */

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{
    Characteristic, CharacteristicProperties, DeviceHandle, DisconnectStream, NotificationStream,
    Peripheral, Radio, ScanStream, Service, Subscription,
};
use crate::config::{ScanOptions, NOTIFY_CHARACTERISTIC, WRITE_CHARACTERISTIC};
use crate::error::RadioError;
use crate::lock;
use crate::model::{AdapterState, DeviceId};

pub const UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const DEVICE_INFO_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const MANUFACTURER_NAME: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
pub const PRIVACY_FLAG: Uuid = Uuid::from_u128(0x00002a02_0000_1000_8000_00805f9b34fb);
pub const TEMPERATURE_SERVICE: Uuid = Uuid::from_u128(0xf000aa00_0451_4000_b000_000000000000);
pub const TEMPERATURE_DATA: Uuid = Uuid::from_u128(0xf000aa01_0451_4000_b000_000000000000);

pub struct MockRadio {
    power: watch::Sender<AdapterState>,
    scan_tx: Mutex<Option<mpsc::UnboundedSender<Result<DeviceHandle, RadioError>>>>,
    permission: AtomicBool,
    permission_error: Mutex<Option<RadioError>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockRadio {
    pub fn new() -> Self {
        let (power, _) = watch::channel(AdapterState::Unknown);
        Self {
            power,
            scan_tx: Mutex::new(None),
            permission: AtomicBool::new(true),
            permission_error: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn set_power(&self, state: AdapterState) {
        self.power.send_replace(state);
    }

    pub fn deny_permission(&self) {
        self.permission.store(false, Ordering::SeqCst);
    }

    pub fn fail_permission_check(&self, error: RadioError) {
        *lock(&self.permission_error) = Some(error);
    }

    /// Fires the scan callback. Returns false when nobody is subscribed anymore.
    pub fn advertise(&self, peripheral: &Arc<MockPeripheral>) -> bool {
        self.emit_scan(Ok(peripheral.handle()))
    }

    pub fn scan_error(&self, error: RadioError) -> bool {
        self.emit_scan(Err(error))
    }

    fn emit_scan(&self, item: Result<DeviceHandle, RadioError>) -> bool {
        match lock(&self.scan_tx).as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    pub fn scan_starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn scan_stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.scan_tx)
            .as_ref()
            .map_or(false, |tx| !tx.is_closed())
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Radio for MockRadio {
    fn power_states(&self) -> watch::Receiver<AdapterState> {
        self.power.subscribe()
    }

    async fn check_scan_permission(&self) -> Result<bool, RadioError> {
        if let Some(err) = lock(&self.permission_error).clone() {
            return Err(err);
        }
        Ok(self.permission.load(Ordering::SeqCst))
    }

    async fn start_scan(&self, _options: &ScanOptions) -> Result<ScanStream, RadioError> {
        let (tx, stream) = Subscription::channel();
        *lock(&self.scan_tx) = Some(tx);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        lock(&self.scan_tx).take();
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockPeripheral {
    id: DeviceId,
    name: Option<String>,
    services: Vec<Service>,
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    connect_error: Mutex<Option<RadioError>>,
    discovery_error: Mutex<Option<RadioError>>,
    listen_error: Mutex<Option<RadioError>>,
    stall_reads: AtomicBool,
    connected: AtomicBool,
    connects: AtomicUsize,
    cancels: AtomicUsize,
    disconnect_tx: Mutex<Option<mpsc::UnboundedSender<Option<RadioError>>>>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Result<Vec<u8>, RadioError>>>>,
}

impl MockPeripheral {
    pub fn new(id: &str, name: Option<&str>, services: Vec<Service>) -> Self {
        Self {
            id: id.to_string(),
            name: name.map(str::to_string),
            services,
            values: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            connect_error: Mutex::new(None),
            discovery_error: Mutex::new(None),
            listen_error: Mutex::new(None),
            stall_reads: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            disconnect_tx: Mutex::new(None),
            notify_tx: Mutex::new(None),
        }
    }

    /// A tag exposing the UART service, device information and IR temperature data.
    pub fn sensortag(id: &str, name: &str) -> Arc<Self> {
        let readable = CharacteristicProperties {
            readable: true,
            ..Default::default()
        };
        let services = vec![
            Service {
                uuid: DEVICE_INFO_SERVICE,
                characteristics: vec![
                    characteristic(DEVICE_INFO_SERVICE, MANUFACTURER_NAME, readable),
                    characteristic(DEVICE_INFO_SERVICE, PRIVACY_FLAG, readable),
                ],
            },
            Service {
                uuid: TEMPERATURE_SERVICE,
                characteristics: vec![characteristic(
                    TEMPERATURE_SERVICE,
                    TEMPERATURE_DATA,
                    readable,
                )],
            },
            Service {
                uuid: UART_SERVICE,
                characteristics: vec![
                    characteristic(
                        UART_SERVICE,
                        WRITE_CHARACTERISTIC,
                        CharacteristicProperties {
                            readable: true,
                            writable_with_response: true,
                            notifiable: false,
                        },
                    ),
                    characteristic(
                        UART_SERVICE,
                        NOTIFY_CHARACTERISTIC,
                        CharacteristicProperties {
                            readable: true,
                            writable_with_response: false,
                            notifiable: true,
                        },
                    ),
                ],
            },
        ];

        let peripheral = Self::new(id, Some(name), services);
        peripheral.set_value(MANUFACTURER_NAME, b"Texas Instruments");
        peripheral.set_value(TEMPERATURE_DATA, &[0x68, 0x0b, 0xd4, 0x0c]);
        peripheral.set_value(WRITE_CHARACTERISTIC, b"/rgb/ffffff000000/");
        Arc::new(peripheral)
    }

    pub fn handle(self: &Arc<Self>) -> DeviceHandle {
        DeviceHandle::new(self.clone())
    }

    pub fn set_value(&self, uuid: Uuid, value: &[u8]) {
        lock(&self.values).insert(uuid, value.to_vec());
    }

    pub fn fail_connect(&self, error: RadioError) {
        *lock(&self.connect_error) = Some(error);
    }

    pub fn fail_discovery(&self, error: RadioError) {
        *lock(&self.discovery_error) = Some(error);
    }

    /// Refuses to register a disconnect listener.
    pub fn fail_disconnect_listener(&self, error: RadioError) {
        *lock(&self.listen_error) = Some(error);
    }

    /// Makes every read hang until the caller gives up on it.
    pub fn stall_reads(&self, stall: bool) {
        self.stall_reads.store(stall, Ordering::SeqCst);
    }

    /// Peripheral-side link loss. Returns false when nobody listens for it.
    pub fn drop_link(&self, error: Option<RadioError>) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        match lock(&self.disconnect_tx).as_ref() {
            Some(tx) => tx.send(error).is_ok(),
            None => false,
        }
    }

    /// Value change on the monitored characteristic.
    pub fn notify(&self, value: Result<Vec<u8>, RadioError>) -> bool {
        if let Ok(bytes) = &value {
            self.set_value(NOTIFY_CHARACTERISTIC, bytes);
        }
        match lock(&self.notify_tx).as_ref() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.writes).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn has_disconnect_listener(&self) -> bool {
        lock(&self.disconnect_tx)
            .as_ref()
            .map_or(false, |tx| !tx.is_closed())
    }

    pub fn has_notification_listener(&self) -> bool {
        lock(&self.notify_tx)
            .as_ref()
            .map_or(false, |tx| !tx.is_closed())
    }

    fn require_connected(&self) -> Result<(), RadioError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RadioError::Disconnected(self.id.clone()))
        }
    }

    fn known(&self, characteristic: &Characteristic) -> Result<(), RadioError> {
        super::find_characteristic(&self.services, characteristic.uuid)
            .map(|_| ())
            .ok_or(RadioError::CharacteristicNotFound(characteristic.uuid))
    }
}

fn characteristic(service: Uuid, uuid: Uuid, properties: CharacteristicProperties) -> Characteristic {
    Characteristic {
        uuid,
        service_uuid: service,
        properties,
    }
}

#[async_trait]
impl Peripheral for MockPeripheral {
    fn id(&self) -> DeviceId {
        self.id.clone()
    }

    fn local_name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn connect(&self) -> Result<(), RadioError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.connect_error).clone() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn discover_services(&self) -> Result<(), RadioError> {
        self.require_connected()?;
        match lock(&self.discovery_error).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn services(&self) -> Result<Vec<Service>, RadioError> {
        self.require_connected()?;
        Ok(self.services.clone())
    }

    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, RadioError> {
        self.require_connected()?;
        self.known(characteristic)?;
        if self.stall_reads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(lock(&self.values)
            .get(&characteristic.uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_with_response(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), RadioError> {
        self.require_connected()?;
        self.known(characteristic)?;
        lock(&self.writes).push((characteristic.uuid, value.to_vec()));
        self.set_value(characteristic.uuid, value);
        Ok(())
    }

    async fn monitor(
        &self,
        characteristic: &Characteristic,
    ) -> Result<NotificationStream, RadioError> {
        self.require_connected()?;
        self.known(characteristic)?;
        let (tx, stream) = Subscription::channel();
        *lock(&self.notify_tx) = Some(tx);
        Ok(stream)
    }

    async fn on_disconnected(&self) -> Result<DisconnectStream, RadioError> {
        if let Some(err) = lock(&self.listen_error).clone() {
            return Err(err);
        }
        let (tx, stream) = Subscription::channel();
        *lock(&self.disconnect_tx) = Some(tx);
        Ok(stream)
    }

    async fn cancel_connection(&self) -> Result<(), RadioError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        // the platform reports our own cancellation through the disconnect callback too
        if let Some(tx) = lock(&self.disconnect_tx).as_ref() {
            let _ = tx.send(None);
        }
        Ok(())
    }
}
