/*!
 * Scan Controller
 * Starts and stops scanning from the adapter power state and link activity
 */

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SensorTagConfig;
use crate::model::{AdapterState, ConnectionState};
use crate::radio::Radio;
use crate::registry::Action;
use crate::store::Store;

/// Scanning is allowed while the radio is on and no link is being set up or used.
pub fn should_scan(adapter: AdapterState, link: ConnectionState) -> bool {
    adapter == AdapterState::PoweredOn && link.is_idle()
}

struct ScanTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScanTask {
    async fn cancel(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("scan task ended abnormally: {}", e);
        }
    }
}

pub struct ScanController {
    radio: Arc<dyn Radio>,
    store: Store,
    config: Arc<SensorTagConfig>,
    adapter: watch::Receiver<AdapterState>,
    link: watch::Receiver<ConnectionState>,
    scan: Option<ScanTask>,
}

impl ScanController {
    /// Subscribes to the gate channels right away so no transition is missed
    /// between construction and `run`.
    pub fn new(radio: Arc<dyn Radio>, store: Store, config: Arc<SensorTagConfig>) -> Self {
        let adapter = store.watch_adapter();
        let link = store.watch_link();
        Self {
            radio,
            store,
            config,
            adapter,
            link,
            scan: None,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        self.recompute().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                changed = self.adapter.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = self.link.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            self.recompute().await;
        }

        self.stop_scanning().await;
        debug!("scan controller stopped");
    }

    async fn recompute(&mut self) {
        let adapter = *self.adapter.borrow_and_update();
        let link = *self.link.borrow_and_update();
        let enable = should_scan(adapter, link);
        debug!(%adapter, %link, enable, "scan gate");

        // A new scan always replaces the old one, never runs next to it
        self.stop_scanning().await;
        if enable {
            let token = CancellationToken::new();
            let handle = tokio::spawn(scan(
                self.radio.clone(),
                self.store.clone(),
                self.config.clone(),
                token.clone(),
            ));
            self.scan = Some(ScanTask { token, handle });
        }
    }

    async fn stop_scanning(&mut self) {
        if let Some(task) = self.scan.take() {
            task.cancel().await;
        }
    }
}

async fn scan(
    radio: Arc<dyn Radio>,
    store: Store,
    config: Arc<SensorTagConfig>,
    token: CancellationToken,
) {
    let permitted = tokio::select! {
        _ = token.cancelled() => return,
        permitted = radio.check_scan_permission() => permitted,
    };
    match permitted {
        Ok(true) => {}
        Ok(false) => {
            store.log("Scanning: Permissions not granted, aborting...");
            return;
        }
        Err(e) => {
            warn!("scan permission check failed: {}", e);
            store.log(format!("Scanning: permission check failed: {}", e));
            return;
        }
    }

    let mut results = match radio.start_scan(&config.scan).await {
        Ok(results) => results,
        Err(e) => {
            warn!("failed to start scan: {}", e);
            store.log(format!("Error: {}", e));
            return;
        }
    };
    info!("scanning started");
    store.log("Scanning started...");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            item = results.next() => {
                match item {
                    Some(Ok(device)) => {
                        let name = device.local_name();
                        if config.accepts(name.as_deref()) {
                            debug!(id = %device.id(), ?name, "accepted scan result");
                            store.dispatch(Action::DeviceDiscovered(device));
                        }
                    }
                    Some(Err(e)) => {
                        warn!("scan error: {}", e);
                        store.log(format!("Error: {}", e));
                    }
                    None => {
                        store.log("Scan results ended");
                        break;
                    }
                }
            }
        }
    }

    results.close();
    if let Err(e) = radio.stop_scan().await {
        warn!("failed to stop scan: {}", e);
        store.log(format!("Error: {}", e));
    }
    info!("scanning stopped");
    store.log("Scanning stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RadioError;
    use crate::radio::{MockPeripheral, MockRadio};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn eventually(mut cond: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !cond() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn start(radio: &Arc<MockRadio>, store: &Store) -> (CancellationToken, JoinHandle<()>) {
        let controller = ScanController::new(
            radio.clone(),
            store.clone(),
            Arc::new(SensorTagConfig::default()),
        );
        let token = CancellationToken::new();
        let handle = tokio::spawn(controller.run(token.clone()));
        (token, handle)
    }

    fn link(store: &Store, state: ConnectionState) {
        store.dispatch(Action::ConnectionStateChanged {
            id: "AA:01".to_string(),
            state,
        });
    }

    #[test]
    fn test_should_scan() {
        use ConnectionState::*;
        assert!(should_scan(AdapterState::PoweredOn, Disconnected));
        assert!(should_scan(AdapterState::PoweredOn, Disconnecting));
        assert!(!should_scan(AdapterState::PoweredOn, Connecting));
        assert!(!should_scan(AdapterState::PoweredOn, Discovering));
        assert!(!should_scan(AdapterState::PoweredOn, Connected));
        assert!(!should_scan(AdapterState::PoweredOff, Disconnected));
        assert!(!should_scan(AdapterState::Unknown, Disconnected));
        assert!(!should_scan(AdapterState::Unauthorized, Disconnected));
    }

    #[tokio::test]
    async fn test_scans_only_allow_listed_names() {
        let radio = Arc::new(MockRadio::new());
        let store = Store::new();
        let (token, handle) = start(&radio, &store);

        store.dispatch(Action::AdapterStateChanged(AdapterState::PoweredOn));
        eventually(|| radio.is_scanning()).await;

        assert!(radio.advertise(&MockPeripheral::sensortag("AA:01", "NEBULA")));
        assert!(radio.advertise(&MockPeripheral::sensortag("CC:01", "PARAGON")));
        assert!(radio.advertise(&MockPeripheral::sensortag("AA:02", "NEBULA")));
        assert!(radio.advertise(&MockPeripheral::sensortag("BB:01", "AURELIAN")));
        eventually(|| store.snapshot().devices.len() == 2).await;

        let state = store.snapshot();
        assert!(state.device("AA:01").is_some());
        assert!(state.device("BB:01").is_some());
        assert!(state.device("CC:01").is_none());

        token.cancel();
        handle.await.unwrap();
        assert_eq!(radio.scan_starts(), radio.scan_stops());
    }

    #[tokio::test]
    async fn test_power_off_unsubscribes_scan() {
        let radio = Arc::new(MockRadio::new());
        let store = Store::new();
        let (token, handle) = start(&radio, &store);

        store.dispatch(Action::AdapterStateChanged(AdapterState::PoweredOn));
        eventually(|| radio.is_scanning()).await;

        store.dispatch(Action::AdapterStateChanged(AdapterState::PoweredOff));
        eventually(|| radio.scan_stops() == 1).await;

        // the platform callback firing late finds no subscriber
        assert!(!radio.advertise(&MockPeripheral::sensortag("AA:01", "NEBULA")));
        sleep(Duration::from_millis(20)).await;
        assert!(store.snapshot().devices.is_empty());
        assert_eq!(radio.scan_starts(), 1);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(radio.scan_stops(), 1);
    }

    #[tokio::test]
    async fn test_link_activity_gates_scanning() {
        let radio = Arc::new(MockRadio::new());
        let store = Store::new();
        let (token, handle) = start(&radio, &store);

        store.dispatch(Action::AdapterStateChanged(AdapterState::PoweredOn));
        eventually(|| radio.scan_starts() == 1).await;

        link(&store, ConnectionState::Connecting);
        eventually(|| radio.scan_stops() == 1).await;
        assert!(!radio.is_scanning());

        link(&store, ConnectionState::Discovering);
        link(&store, ConnectionState::Connected);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(radio.scan_starts(), 1);

        link(&store, ConnectionState::Disconnecting);
        eventually(|| radio.is_scanning()).await;
        link(&store, ConnectionState::Disconnected);
        eventually(|| radio.scan_starts() >= 2 && radio.is_scanning()).await;

        token.cancel();
        handle.await.unwrap();
        assert!(!radio.is_scanning());
        assert_eq!(radio.scan_starts(), radio.scan_stops());
    }

    #[tokio::test]
    async fn test_permission_refused_aborts_quietly() {
        let radio = Arc::new(MockRadio::new());
        radio.deny_permission();
        let store = Store::new();
        let (token, handle) = start(&radio, &store);

        store.dispatch(Action::AdapterStateChanged(AdapterState::PoweredOn));
        eventually(|| {
            store
                .snapshot()
                .logs
                .iter()
                .any(|l| l == "Scanning: Permissions not granted, aborting...")
        })
        .await;
        assert_eq!(radio.scan_starts(), 0);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(radio.scan_stops(), 0);
    }

    #[tokio::test]
    async fn test_scan_error_is_logged_and_scan_continues() {
        let radio = Arc::new(MockRadio::new());
        let store = Store::new();
        let (token, handle) = start(&radio, &store);

        store.dispatch(Action::AdapterStateChanged(AdapterState::PoweredOn));
        eventually(|| radio.is_scanning()).await;

        assert!(radio.scan_error(RadioError::Scan("adapter busy".to_string())));
        eventually(|| {
            store
                .snapshot()
                .logs
                .iter()
                .any(|l| l == "Error: scan failed: adapter busy")
        })
        .await;
        assert!(radio.is_scanning());

        assert!(radio.advertise(&MockPeripheral::sensortag("AA:01", "NEBULA")));
        eventually(|| store.snapshot().device("AA:01").is_some()).await;
        assert_eq!(radio.scan_starts(), 1);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(radio.scan_starts(), radio.scan_stops());
    }

    #[tokio::test]
    async fn test_permission_check_error_aborts_scan() {
        let radio = Arc::new(MockRadio::new());
        radio.fail_permission_check(RadioError::Other("permission service unavailable".to_string()));
        let store = Store::new();
        let (token, handle) = start(&radio, &store);

        store.dispatch(Action::AdapterStateChanged(AdapterState::PoweredOn));
        eventually(|| {
            store
                .snapshot()
                .logs
                .iter()
                .any(|l| l == "Scanning: permission check failed: permission service unavailable")
        })
        .await;
        assert_eq!(radio.scan_starts(), 0);
        assert!(!radio.is_scanning());

        token.cancel();
        handle.await.unwrap();
        assert_eq!(radio.scan_stops(), 0);
    }
}
