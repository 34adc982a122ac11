/*!
 * IPC Server for the SensorTag Daemon
 * JSON protocol over Unix socket
 */

use anyhow::Result;
use sensortag_core::{Action, Store, TaskRegistry};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::protocol::{Request, Response, StateView, TestView};

pub struct IpcServer {
    listener: UnixListener,
    store: Store,
    tasks: Arc<TaskRegistry>,
}

impl IpcServer {
    pub fn new(listener: UnixListener, store: Store, tasks: Arc<TaskRegistry>) -> Self {
        Self {
            listener,
            store,
            tasks,
        }
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("IPC server listening for connections...");

        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tracing::debug!("New client connected");
                    let store = self.store.clone();
                    let tasks = self.tasks.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, store, tasks).await {
                            tracing::error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_client(stream: UnixStream, store: Store, tasks: Arc<TaskRegistry>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        tracing::debug!("Received request: {}", line);

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => handle_request(&store, &tasks, request),
            Err(e) => Response::error(format!("Invalid request: {}", e)),
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }

    Ok(())
}

pub fn handle_request(store: &Store, tasks: &TaskRegistry, request: Request) -> Response {
    match request {
        Request::GetState => Response::State {
            state: StateView::from(&store.snapshot()),
        },
        Request::ListTests => Response::Tests {
            tests: tasks.iter().map(TestView::from).collect(),
        },
        Request::Connect { id } => {
            let device = store.snapshot().device(&id).and_then(|d| d.device.clone());
            match device {
                Some(device) => {
                    store.dispatch(Action::Connect(device));
                    Response::success(format!("Connect requested: {}", id))
                }
                None => Response::error(format!("Unknown device: {}", id)),
            }
        }
        Request::Disconnect { id } => {
            if store.snapshot().device(&id).is_none() {
                return Response::error(format!("Unknown device: {}", id));
            }
            store.dispatch(Action::Disconnect { id: id.clone() });
            Response::success(format!("Disconnect requested: {}", id))
        }
        Request::ExecuteTest { id, test } => {
            if tasks.get(&test).is_none() {
                return Response::error(format!("Unknown test: {}", test));
            }
            if !store.snapshot().is_connected(&id) {
                return Response::error(format!("Device not connected: {}", id));
            }
            store.dispatch(Action::ExecuteTest {
                id,
                test: test.clone(),
            });
            Response::success(format!("Test started: {}", test))
        }
        Request::WriteTag { id, payload } => {
            if !store.snapshot().is_connected(&id) {
                return Response::error(format!("Device not connected: {}", id));
            }
            store.dispatch(Action::WriteTag {
                id: id.clone(),
                payload: payload.map(String::into_bytes),
            });
            Response::success(format!("Write started: {}", id))
        }
        Request::ClearLogs => {
            store.dispatch(Action::ClearLogs);
            Response::success("Logs cleared")
        }
        Request::ClearDevices => {
            store.dispatch(Action::ClearDevices);
            Response::success("Devices cleared")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensortag_core::radio::MockPeripheral;
    use sensortag_core::ConnectionState;

    fn connected(store: &Store, id: &str) {
        store.dispatch(Action::ConnectionStateChanged {
            id: id.to_string(),
            state: ConnectionState::Connected,
        });
    }

    #[test]
    fn test_connect_resolves_registry_handle() {
        let store = Store::new();
        let tasks = TaskRegistry::standard();
        let mut commands = store.subscribe(|a| matches!(a, Action::Connect(_)));

        let response = handle_request(&store, &tasks, Request::Connect { id: "AA:01".into() });
        assert!(matches!(response, Response::Error { ref message } if message == "Unknown device: AA:01"));
        assert!(commands.try_recv().is_none());

        let tag = MockPeripheral::sensortag("AA:01", "NEBULA");
        store.dispatch(Action::DeviceDiscovered(tag.handle()));
        let response = handle_request(&store, &tasks, Request::Connect { id: "AA:01".into() });
        assert!(matches!(response, Response::Success { .. }));
        assert!(matches!(commands.try_recv(), Some(Action::Connect(d)) if d.id() == "AA:01"));
    }

    #[test]
    fn test_execute_test_requires_connection_and_known_test() {
        let store = Store::new();
        let tasks = TaskRegistry::standard();
        let tag = MockPeripheral::sensortag("AA:01", "NEBULA");
        store.dispatch(Action::DeviceDiscovered(tag.handle()));

        let request = || Request::ExecuteTest {
            id: "AA:01".into(),
            test: "READ_TEMPERATURE".into(),
        };
        assert!(matches!(
            handle_request(&store, &tasks, request()),
            Response::Error { .. }
        ));
        assert!(store.snapshot().current_test.is_none());

        connected(&store, "AA:01");
        let unknown = Request::ExecuteTest {
            id: "AA:01".into(),
            test: "SELF_DESTRUCT".into(),
        };
        assert!(matches!(
            handle_request(&store, &tasks, unknown),
            Response::Error { ref message } if message == "Unknown test: SELF_DESTRUCT"
        ));

        assert!(matches!(
            handle_request(&store, &tasks, request()),
            Response::Success { .. }
        ));
        assert_eq!(
            store.snapshot().current_test.as_deref(),
            Some("READ_TEMPERATURE")
        );
    }

    #[test]
    fn test_write_tag_carries_payload_bytes() {
        let store = Store::new();
        let tasks = TaskRegistry::standard();
        let tag = MockPeripheral::sensortag("AA:01", "NEBULA");
        store.dispatch(Action::DeviceDiscovered(tag.handle()));
        connected(&store, "AA:01");
        let mut writes = store.subscribe(|a| matches!(a, Action::WriteTag { .. }));

        let response = handle_request(
            &store,
            &tasks,
            Request::WriteTag {
                id: "AA:01".into(),
                payload: Some("/rgb/ff0000ff0000/".into()),
            },
        );
        assert!(matches!(response, Response::Success { .. }));
        assert!(matches!(
            writes.try_recv(),
            Some(Action::WriteTag { payload: Some(p), .. }) if p == b"/rgb/ff0000ff0000/"
        ));
    }

    #[test]
    fn test_state_and_tests_listing() {
        let store = Store::new();
        let tasks = TaskRegistry::standard();
        store.log("hello");
        store.dispatch(Action::ClearLogs);
        store.log("after clear");

        match handle_request(&store, &tasks, Request::GetState) {
            Response::State { state } => assert_eq!(state.logs, vec!["after clear".to_string()]),
            other => panic!("unexpected response: {:?}", other),
        }
        match handle_request(&store, &tasks, Request::ListTests) {
            Response::Tests { tests } => {
                let ids: Vec<_> = tests.iter().map(|t| t.id.as_str()).collect();
                assert_eq!(
                    ids,
                    vec!["READ_ALL_CHARACTERISTICS", "READ_TEMPERATURE", "WRITE_TAG"]
                );
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        use tokio::io::AsyncReadExt;

        let (server, client) = UnixStream::pair().unwrap();
        let store = Store::new();
        let tasks = Arc::new(TaskRegistry::standard());
        let handle = tokio::spawn(handle_client(server, store, tasks));

        let (mut rx, mut tx) = client.into_split();
        tx.write_all(b"{\"type\":\"ClearDevices\"}\nnot json\n").await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);

        let mut output = String::new();
        rx.read_to_string(&mut output).await.unwrap();
        let lines: Vec<Response> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert!(matches!(lines[0], Response::Success { ref message } if message == "Devices cleared"));
        assert!(matches!(lines[1], Response::Error { .. }));
        handle.await.unwrap().unwrap();
    }
}
