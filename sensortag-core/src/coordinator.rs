/*!
 * BLE Core Coordinator
 * Starts the watcher, scan controller and supervisor under one cancellation tree
 */

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SensorTagConfig;
use crate::radio::Radio;
use crate::scan::ScanController;
use crate::store::Store;
use crate::supervisor::Supervisor;
use crate::tasks::TaskRegistry;
use crate::watcher::watch_adapter_state;

pub struct Coordinator {
    token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Coordinator {
    /// Must be called from within a tokio runtime.
    pub fn start(
        radio: Arc<dyn Radio>,
        store: Store,
        config: Arc<SensorTagConfig>,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        let token = CancellationToken::new();

        // Both consumers subscribe here, before the watcher can emit its first state
        let scanner = ScanController::new(radio.clone(), store.clone(), config.clone());
        let supervisor = Supervisor::new(store.clone(), config, tasks);

        let handles = vec![
            (
                "scan controller",
                tokio::spawn(scanner.run(token.child_token())),
            ),
            (
                "supervisor",
                tokio::spawn(supervisor.run(token.child_token())),
            ),
            (
                "adapter watcher",
                tokio::spawn(watch_adapter_state(
                    radio,
                    store.clone(),
                    token.child_token(),
                )),
            ),
        ];

        info!("BLE core started");
        store.log("BLE core started");
        Self { token, handles }
    }

    pub async fn shutdown(self) {
        info!("shutting down BLE core");
        self.token.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!("{} ended abnormally: {}", name, e);
            }
        }
        info!("BLE core stopped");
    }
}
