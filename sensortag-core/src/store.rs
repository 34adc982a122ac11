/*!
 * Action Store
 * Single reduction path for application state plus action fan-out
 */

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use crate::lock;
use crate::model::{AdapterState, ConnectionState};
use crate::registry::{Action, AppState};

type Filter = Box<dyn Fn(&Action) -> bool + Send + Sync>;

struct Subscriber {
    filter: Filter,
    tx: mpsc::UnboundedSender<Action>,
}

struct Inner {
    state: watch::Sender<AppState>,
    adapter: watch::Sender<AdapterState>,
    link: watch::Sender<ConnectionState>,
    subscribers: Mutex<Vec<Subscriber>>,
}

/// Buffered stream of the actions a subscriber asked for.
pub struct ActionStream {
    rx: mpsc::UnboundedReceiver<Action>,
}

impl ActionStream {
    pub async fn recv(&mut self) -> Option<Action> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Action> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    pub fn new() -> Self {
        let (state, _) = watch::channel(AppState::default());
        let (adapter, _) = watch::channel(AdapterState::Unknown);
        let (link, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                state,
                adapter,
                link,
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn dispatch(&self, action: Action) {
        tracing::trace!(?action, "dispatch");

        self.inner
            .state
            .send_modify(|state| *state = std::mem::take(state).reduce(&action));

        // Gate channels keep only the newest value, so producers never wait on the scanner
        match &action {
            Action::AdapterStateChanged(state) => {
                self.inner.adapter.send_replace(*state);
            }
            Action::ConnectionStateChanged { state, .. } => {
                self.inner.link.send_replace(*state);
            }
            _ => {}
        }

        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|sub| {
            if sub.tx.is_closed() {
                return false;
            }
            if (sub.filter)(&action) {
                return sub.tx.send(action.clone()).is_ok();
            }
            true
        });
    }

    pub fn log(&self, message: impl Into<String>) {
        self.dispatch(Action::Log(message.into()));
    }

    /// Buffers every future action accepted by `filter` until it is received.
    pub fn subscribe<F>(&self, filter: F) -> ActionStream
    where
        F: Fn(&Action) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(Subscriber {
            filter: Box::new(filter),
            tx,
        });
        ActionStream { rx }
    }

    pub fn snapshot(&self) -> AppState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<AppState> {
        self.inner.state.subscribe()
    }

    /// Latest adapter state, coalesced.
    pub fn watch_adapter(&self) -> watch::Receiver<AdapterState> {
        self.inner.adapter.subscribe()
    }

    /// Latest connection transition of any device, coalesced.
    pub fn watch_link(&self) -> watch::Receiver<ConnectionState> {
        self.inner.link.subscribe()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_reduces_and_fans_out() {
        let store = Store::new();
        let mut logs = store.subscribe(|a| matches!(a, Action::Log(_)));
        let mut everything = store.subscribe(|_| true);

        store.log("first");
        store.dispatch(Action::AdapterStateChanged(AdapterState::PoweredOff));

        assert!(matches!(logs.try_recv(), Some(Action::Log(m)) if m == "first"));
        assert!(logs.try_recv().is_none());
        assert!(matches!(everything.try_recv(), Some(Action::Log(_))));
        assert!(matches!(
            everything.try_recv(),
            Some(Action::AdapterStateChanged(AdapterState::PoweredOff))
        ));

        let state = store.snapshot();
        assert_eq!(state.adapter_state, AdapterState::PoweredOff);
        assert_eq!(state.logs.len(), 2);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let store = Store::new();
        let stream = store.subscribe(|_| true);
        drop(stream);
        store.log("after drop");
        assert!(lock(&store.inner.subscribers).is_empty());
    }

    #[test]
    fn test_gate_channels_coalesce() {
        let store = Store::new();
        let mut link = store.watch_link();
        let mut adapter = store.watch_adapter();

        for state in [
            ConnectionState::Connecting,
            ConnectionState::Discovering,
            ConnectionState::Connected,
        ] {
            store.dispatch(Action::ConnectionStateChanged {
                id: "AA:01".to_string(),
                state,
            });
        }

        assert!(link.has_changed().unwrap());
        assert_eq!(*link.borrow_and_update(), ConnectionState::Connected);
        assert!(!link.has_changed().unwrap());
        assert!(!adapter.has_changed().unwrap());

        store.dispatch(Action::AdapterStateChanged(AdapterState::PoweredOn));
        assert_eq!(*adapter.borrow_and_update(), AdapterState::PoweredOn);
    }
}
