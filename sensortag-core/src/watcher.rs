/*!
 * Adapter-State Watcher
 * Republishes radio power-state changes as registry actions
 */

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::radio::Radio;
use crate::registry::Action;
use crate::store::Store;

pub async fn watch_adapter_state(radio: Arc<dyn Radio>, store: Store, token: CancellationToken) {
    let mut states = radio.power_states();

    // Initial emission: the current state before any change
    let initial = *states.borrow_and_update();
    info!("adapter state: {}", initial);
    store.dispatch(Action::AdapterStateChanged(initial));

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    warn!("adapter power-state source closed");
                    store.log("BLE state source closed");
                    break;
                }
                let state = *states.borrow_and_update();
                info!("adapter state: {}", state);
                store.dispatch(Action::AdapterStateChanged(state));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AdapterState;
    use crate::radio::MockRadio;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_emits_initial_and_changes() {
        let radio = Arc::new(MockRadio::new());
        radio.set_power(AdapterState::PoweredOff);
        let store = Store::new();
        let mut seen = store.subscribe(|a| matches!(a, Action::AdapterStateChanged(_)));
        let token = CancellationToken::new();

        let task = tokio::spawn(watch_adapter_state(radio.clone(), store.clone(), token.clone()));

        let first = timeout(Duration::from_secs(1), seen.recv()).await.unwrap();
        assert!(matches!(
            first,
            Some(Action::AdapterStateChanged(AdapterState::PoweredOff))
        ));

        radio.set_power(AdapterState::PoweredOn);
        let next = timeout(Duration::from_secs(1), seen.recv()).await.unwrap();
        assert!(matches!(
            next,
            Some(Action::AdapterStateChanged(AdapterState::PoweredOn))
        ));
        assert_eq!(store.snapshot().adapter_state, AdapterState::PoweredOn);

        token.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        // torn down: later changes are not republished
        radio.set_power(AdapterState::Resetting);
        tokio::task::yield_now().await;
        assert!(seen.try_recv().is_none());
    }
}
