/*!
 * Connection Session
 * Drives one device from connect to disconnect and serves commands while connected
 */

use std::future::{pending, Future};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SensorTagConfig;
use crate::error::RadioError;
use crate::model::{ConnectionState, DeviceId};
use crate::radio::{
    decode_value, find_characteristic, Characteristic, DeviceHandle, DisconnectStream,
    NotificationStream,
};
use crate::registry::Action;
use crate::store::{ActionStream, Store};
use crate::tasks::{TaskContext, TaskKind, TaskRegistry, TaskSlot, WRITE_TAG};

/// One input of the connected loop, whichever source produced it first.
#[derive(Debug)]
enum SessionEvent {
    Command(Action),
    PeripheralDisconnected(Option<RadioError>),
    CharacteristicNotified(Option<Result<Vec<u8>, RadioError>>),
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionExit {
    UserDisconnect,
    PeripheralDisconnect,
    Failed(RadioError),
    Cancelled,
}

pub struct Session {
    id: DeviceId,
    session_id: Uuid,
    device: DeviceHandle,
    store: Store,
    config: Arc<SensorTagConfig>,
    registry: Arc<TaskRegistry>,
    commands: ActionStream,
    disconnects: Option<DisconnectStream>,
    notifications: Option<NotificationStream>,
    notify_characteristic: Option<Characteristic>,
    tests: TaskSlot,
    writes: TaskSlot,
    linked: bool,
    disconnected_emitted: bool,
    torn_down: bool,
}

impl Session {
    /// Commands are buffered from this point on, even while still connecting.
    pub fn new(
        device: DeviceHandle,
        store: Store,
        config: Arc<SensorTagConfig>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        let id = device.id();
        let own_id = id.clone();
        let commands = store.subscribe(move |action| match action {
            Action::Disconnect { .. } => true,
            Action::ExecuteTest { id, .. } | Action::WriteTag { id, .. } => *id == own_id,
            _ => false,
        });

        Self {
            id,
            session_id: Uuid::new_v4(),
            device,
            store,
            config,
            registry,
            commands,
            disconnects: None,
            notifications: None,
            notify_characteristic: None,
            tests: TaskSlot::default(),
            writes: TaskSlot::default(),
            linked: false,
            disconnected_emitted: false,
            torn_down: false,
        }
    }

    pub async fn run(mut self, token: CancellationToken) -> SessionExit {
        let span = info_span!("session", device = %self.id, session = %self.session_id);
        async move {
            let exit = match self.establish(&token).await {
                Ok(()) => self.serve(&token).await,
                Err(exit) => exit,
            };
            self.teardown(&exit).await;
            exit
        }
        .instrument(span)
        .await
    }

    async fn establish(&mut self, token: &CancellationToken) -> Result<(), SessionExit> {
        self.transition(ConnectionState::Connecting);
        self.disconnects = Some(guarded(token, self.device.on_disconnected()).await?);
        guarded(token, self.device.connect()).await?;
        self.linked = true;

        self.transition(ConnectionState::Discovering);
        guarded(token, self.device.discover_services()).await?;

        self.transition(ConnectionState::Connected);
        let services = guarded(token, self.device.services()).await?;
        for service in &services {
            self.store.log(format!("Found service: {}", service.uuid));
        }

        let wanted = self.config.notify_characteristic;
        match find_characteristic(&services, wanted) {
            Some(characteristic) => {
                self.store.log(format!(
                    "Found characteristic: {} (notifiable: {})",
                    characteristic.uuid, characteristic.properties.notifiable
                ));
                self.notifications = Some(guarded(token, self.device.monitor(characteristic)).await?);
                self.notify_characteristic = Some(characteristic.clone());
            }
            None => {
                warn!("notification characteristic {} missing", wanted);
                self.store
                    .log(format!("Notification characteristic {} not found", wanted));
            }
        }
        Ok(())
    }

    async fn serve(&mut self, token: &CancellationToken) -> SessionExit {
        loop {
            debug!("waiting for device events");
            let event = tokio::select! {
                _ = token.cancelled() => return SessionExit::Cancelled,
                command = self.commands.recv() => {
                    match command {
                        Some(action) => SessionEvent::Command(action),
                        None => return SessionExit::Cancelled,
                    }
                }
                error = next_disconnect(&mut self.disconnects) => {
                    SessionEvent::PeripheralDisconnected(error)
                }
                notified = next_notification(&mut self.notifications) => {
                    SessionEvent::CharacteristicNotified(notified)
                }
            };

            if let Some(exit) = self.handle(event, token).await {
                return exit;
            }
        }
    }

    async fn handle(&mut self, event: SessionEvent, token: &CancellationToken) -> Option<SessionExit> {
        match event {
            SessionEvent::Command(Action::Disconnect { id }) => {
                if id != self.id {
                    debug!(other = %id, "disconnect for another device");
                    self.store
                        .log(format!("Not this device: {} (session for {})", id, self.id));
                    return None;
                }

                info!("disconnect requested");
                self.store.log(format!("Disconnected by user... {}", self.id));
                self.transition(ConnectionState::Disconnecting);
                if let Err(e) = self.device.cancel_connection().await {
                    self.report(&e);
                }
                self.linked = false;
                if let Some(mut disconnects) = self.disconnects.take() {
                    disconnects.close();
                }
                self.transition(ConnectionState::Disconnected);
                Some(SessionExit::UserDisconnect)
            }
            SessionEvent::Command(Action::ExecuteTest { test, .. }) => {
                match self.registry.get(&test) {
                    Some(descriptor) => {
                        let ctx = self.task_context(None);
                        self.tests.replace(TaskKind::Test, descriptor.clone(), ctx).await;
                    }
                    None => {
                        self.store.log(format!("Unknown test: {}", test));
                        // release the marker the command set, unless a real test still holds it
                        if !self.tests.is_active() {
                            self.store.dispatch(Action::TestFinished);
                        }
                    }
                }
                None
            }
            SessionEvent::Command(Action::WriteTag { payload, .. }) => {
                match self.registry.get(WRITE_TAG) {
                    Some(descriptor) => {
                        let ctx = self.task_context(payload);
                        self.writes.replace(TaskKind::Write, descriptor.clone(), ctx).await;
                    }
                    None => {
                        self.store.log("Write task not registered");
                        if !self.writes.is_active() {
                            self.store.dispatch(Action::WriteFinished);
                        }
                    }
                }
                None
            }
            SessionEvent::Command(other) => {
                debug!(?other, "ignoring action");
                None
            }
            SessionEvent::PeripheralDisconnected(error) => {
                info!("peripheral disconnected");
                self.store.log("Disconnected by device...");
                if let Some(e) = error {
                    self.report(&e);
                }
                self.linked = false;
                self.transition(ConnectionState::Disconnected);
                Some(SessionExit::PeripheralDisconnect)
            }
            SessionEvent::CharacteristicNotified(None) => {
                debug!("notification stream closed");
                self.store.log("Notification channel closed");
                self.notifications = None;
                None
            }
            SessionEvent::CharacteristicNotified(Some(Err(e))) => {
                self.report(&e);
                None
            }
            SessionEvent::CharacteristicNotified(Some(Ok(_))) => {
                self.store.log("Read from device...");
                let characteristic = self.notify_characteristic.clone()?;
                let read = tokio::select! {
                    _ = token.cancelled() => return Some(SessionExit::Cancelled),
                    read = self.device.read(&characteristic) => read,
                };
                match read {
                    Ok(value) => self.store.log(format!("Got value: {}", decode_value(&value))),
                    Err(e) => self.report(&e),
                }
                None
            }
        }
    }

    /// Runs once per session whatever ended it.
    pub(crate) async fn teardown(&mut self, exit: &SessionExit) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.tests.cancel().await;
        self.writes.cancel().await;
        if let Some(mut disconnects) = self.disconnects.take() {
            disconnects.close();
        }
        if let Some(mut notifications) = self.notifications.take() {
            notifications.close();
        }

        if let SessionExit::Failed(e) = exit {
            self.report(e);
        }
        if self.linked || *exit == SessionExit::Cancelled {
            if let Err(e) = self.device.cancel_connection().await {
                self.report(&e);
            }
            self.linked = false;
        }

        self.transition(ConnectionState::Disconnected);
        self.store.dispatch(Action::TestFinished);
        self.store.dispatch(Action::WriteFinished);
        info!(?exit, "session finished");
    }

    fn transition(&mut self, state: ConnectionState) {
        if state == ConnectionState::Disconnected {
            if self.disconnected_emitted {
                return;
            }
            self.disconnected_emitted = true;
        }
        debug!(%state, "transition");
        self.store.dispatch(Action::ConnectionStateChanged {
            id: self.id.clone(),
            state,
        });
    }

    fn report(&self, e: &RadioError) {
        error!("{}", e);
        self.store.dispatch(Action::DeviceError {
            id: self.id.clone(),
            message: e.to_string(),
        });
    }

    fn task_context(&self, payload: Option<Vec<u8>>) -> TaskContext {
        TaskContext {
            device: self.device.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            payload,
        }
    }
}

/// Races a radio call against cancellation.
async fn guarded<T>(
    token: &CancellationToken,
    call: impl Future<Output = Result<T, RadioError>>,
) -> Result<T, SessionExit> {
    tokio::select! {
        _ = token.cancelled() => Err(SessionExit::Cancelled),
        result = call => result.map_err(SessionExit::Failed),
    }
}

async fn next_disconnect(disconnects: &mut Option<DisconnectStream>) -> Option<RadioError> {
    match disconnects {
        // a closed source means the link is gone as well
        Some(stream) => stream.next().await.flatten(),
        None => pending().await,
    }
}

async fn next_notification(
    notifications: &mut Option<NotificationStream>,
) -> Option<Result<Vec<u8>, RadioError>> {
    match notifications {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}
