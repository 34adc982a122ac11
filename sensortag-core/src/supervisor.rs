/*!
 * Connection Supervisor
 * Turns connect commands into connection sessions and tracks them for shutdown
 */

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SensorTagConfig;
use crate::model::DeviceId;
use crate::radio::DeviceHandle;
use crate::registry::Action;
use crate::session::{Session, SessionExit};
use crate::store::{ActionStream, Store};
use crate::tasks::TaskRegistry;

struct SessionHandle {
    token: CancellationToken,
    handle: JoinHandle<SessionExit>,
}

pub struct Supervisor {
    store: Store,
    config: Arc<SensorTagConfig>,
    registry: Arc<TaskRegistry>,
    commands: ActionStream,
    sessions: HashMap<DeviceId, SessionHandle>,
}

impl Supervisor {
    pub fn new(store: Store, config: Arc<SensorTagConfig>, registry: Arc<TaskRegistry>) -> Self {
        let commands = store.subscribe(|a| matches!(a, Action::Connect(_)));
        Self {
            store,
            config,
            registry,
            commands,
            sessions: HashMap::new(),
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                command = self.commands.recv() => {
                    match command {
                        Some(Action::Connect(device)) => self.connect(device, &token),
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }

        // every session runs its teardown before the supervisor is done
        for (id, session) in self.sessions.drain() {
            session.token.cancel();
            match session.handle.await {
                Ok(exit) => info!(device = %id, ?exit, "session stopped"),
                Err(e) => warn!(device = %id, "session ended abnormally: {}", e),
            }
        }
    }

    fn connect(&mut self, device: DeviceHandle, token: &CancellationToken) {
        let id = device.id();
        self.sessions.retain(|_, s| !s.handle.is_finished());

        // One session per device: a second connect would race the first on the same link
        if self.sessions.contains_key(&id) {
            warn!(device = %id, "session already active, ignoring connect");
            self.store
                .log(format!("Already connecting or connected: {}", id));
            return;
        }

        info!(device = %id, "starting session");
        self.store.log(format!("Connect requested. Device id = {}", id));
        let session = Session::new(
            device,
            self.store.clone(),
            self.config.clone(),
            self.registry.clone(),
        );
        let child = token.child_token();
        let handle = tokio::spawn(session.run(child.clone()));
        self.sessions.insert(id, SessionHandle { token: child, handle });
    }
}
