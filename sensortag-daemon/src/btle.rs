/*!
 * btleplug Radio Backend
 * Host BLE adapter exposed through the core radio traits
 */

use anyhow::anyhow;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures::stream::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sensortag_core::config::ScanOptions;
use sensortag_core::radio::{
    Characteristic, CharacteristicProperties, DisconnectStream, NotificationStream, ScanStream,
    Service, Subscription,
};
use sensortag_core::{AdapterState, DeviceHandle, DeviceId, Peripheral, Radio, RadioError};

fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

fn properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        readable: flags.contains(CharPropFlags::READ),
        writable_with_response: flags.contains(CharPropFlags::WRITE),
        notifiable: flags.contains(CharPropFlags::NOTIFY),
    }
}

/// Instances of the same service UUID stay separate entries.
fn convert_services<'a>(services: impl Iterator<Item = &'a btleplug::api::Service>) -> Vec<Service> {
    services
        .map(|service| Service {
            uuid: service.uuid,
            characteristics: service
                .characteristics
                .iter()
                .map(|c| Characteristic {
                    uuid: c.uuid,
                    service_uuid: c.service_uuid,
                    properties: properties(c.properties),
                })
                .collect(),
        })
        .collect()
}

pub struct BtleRadio {
    adapter: Adapter,
    power: watch::Receiver<AdapterState>,
    poller: JoinHandle<()>,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl BtleRadio {
    /// Opens the first host adapter and starts sampling its power state.
    pub async fn new(poll_interval: Duration) -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!(RadioError::NoAdapter))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => warn!("adapter info unavailable: {}", e),
        }

        let (tx, power) = watch::channel(AdapterState::Unknown);
        let poller = tokio::spawn(poll_power(adapter.clone(), tx, poll_interval));

        Ok(Self {
            adapter,
            power,
            poller,
            scan: Mutex::new(None),
        })
    }

    fn take_scan(&self) -> Option<JoinHandle<()>> {
        self.scan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for BtleRadio {
    fn drop(&mut self) {
        self.poller.abort();
        if let Some(scan) = self.take_scan() {
            scan.abort();
        }
    }
}

async fn poll_power(adapter: Adapter, tx: watch::Sender<AdapterState>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let state = match adapter.adapter_state().await {
            Ok(state) => adapter_state(state),
            Err(e) => {
                debug!("adapter state query failed: {}", e);
                AdapterState::Unknown
            }
        };
        tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if tx.is_closed() {
            break;
        }
    }
}

#[async_trait]
impl Radio for BtleRadio {
    fn power_states(&self) -> watch::Receiver<AdapterState> {
        self.power.clone()
    }

    async fn start_scan(&self, options: &ScanOptions) -> Result<ScanStream, RadioError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| RadioError::Scan(e.to_string()))?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| RadioError::Scan(e.to_string()))?;

        let (tx, stream) = Subscription::channel();
        let adapter = self.adapter.clone();
        let allow_duplicates = options.allow_duplicates;

        let forwarder = tokio::spawn(async move {
            let mut reported = HashSet::new();
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(e) => {
                        debug!("discovered peripheral vanished: {}", e);
                        continue;
                    }
                };
                let local_name = match peripheral.properties().await {
                    Ok(props) => props.and_then(|p| p.local_name),
                    Err(e) => {
                        if tx.send(Err(RadioError::Scan(e.to_string()))).is_err() {
                            break;
                        }
                        continue;
                    }
                };
                // Nameless adverts are reported again once a name shows up
                if local_name.is_none() {
                    continue;
                }
                let device = BtlePeripheral::new(adapter.clone(), peripheral, local_name);
                if !allow_duplicates && !reported.insert(device.id()) {
                    continue;
                }
                if tx.send(Ok(DeviceHandle::new(Arc::new(device)))).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self
            .scan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(forwarder)
        {
            previous.abort();
        }
        Ok(stream)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        if let Some(forwarder) = self.take_scan() {
            forwarder.abort();
        }
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| RadioError::Scan(e.to_string()))
    }
}

pub struct BtlePeripheral {
    adapter: Adapter,
    peripheral: PlatformPeripheral,
    id: DeviceId,
    local_name: Option<String>,
}

impl BtlePeripheral {
    fn new(adapter: Adapter, peripheral: PlatformPeripheral, local_name: Option<String>) -> Self {
        let id = peripheral.address().to_string();
        Self {
            adapter,
            peripheral,
            id,
            local_name,
        }
    }

    fn platform_characteristic(
        &self,
        characteristic: &Characteristic,
    ) -> Result<btleplug::api::Characteristic, RadioError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid
            })
            .ok_or(RadioError::CharacteristicNotFound(characteristic.uuid))
    }
}

#[async_trait]
impl Peripheral for BtlePeripheral {
    fn id(&self) -> DeviceId {
        self.id.clone()
    }

    fn local_name(&self) -> Option<String> {
        self.local_name.clone()
    }

    async fn connect(&self) -> Result<(), RadioError> {
        self.peripheral
            .connect()
            .await
            .map_err(|e| RadioError::Connect(e.to_string()))
    }

    async fn discover_services(&self) -> Result<(), RadioError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| RadioError::Discovery(e.to_string()))
    }

    async fn services(&self) -> Result<Vec<Service>, RadioError> {
        Ok(convert_services(self.peripheral.services().iter()))
    }

    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, RadioError> {
        let target = self.platform_characteristic(characteristic)?;
        self.peripheral
            .read(&target)
            .await
            .map_err(|e| RadioError::Read {
                uuid: characteristic.uuid,
                reason: e.to_string(),
            })
    }

    async fn write_with_response(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), RadioError> {
        let target = self.platform_characteristic(characteristic)?;
        self.peripheral
            .write(&target, value, WriteType::WithResponse)
            .await
            .map_err(|e| RadioError::Write {
                uuid: characteristic.uuid,
                reason: e.to_string(),
            })
    }

    async fn monitor(
        &self,
        characteristic: &Characteristic,
    ) -> Result<NotificationStream, RadioError> {
        let target = self.platform_characteristic(characteristic)?;
        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| RadioError::Notification(e.to_string()))?;
        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|e| RadioError::Notification(e.to_string()))?;

        let (tx, stream) = Subscription::channel();
        let uuid = target.uuid;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    notification = notifications.next() => match notification {
                        Some(n) if n.uuid == uuid => {
                            if tx.send(Ok(n.value)).is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        Ok(stream)
    }

    async fn on_disconnected(&self) -> Result<DisconnectStream, RadioError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| RadioError::Other(e.to_string()))?;
        let own = self.peripheral.id();

        let (tx, stream) = Subscription::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == own => {
                            if tx.send(None).is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        Ok(stream)
    }

    async fn cancel_connection(&self) -> Result<(), RadioError> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| RadioError::Disconnected(e.to_string()))
    }
}
