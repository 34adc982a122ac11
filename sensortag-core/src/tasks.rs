/*!
 * Test/Write Tasks
 * Named one-shot operations run against a connected tag
 */

use async_trait::async_trait;
use chrono::Local;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SensorTagConfig;
use crate::error::RadioError;
use crate::radio::{decode_value, find_characteristic, DeviceHandle};
use crate::registry::Action;
use crate::store::Store;

pub const READ_ALL_CHARACTERISTICS: &str = "READ_ALL_CHARACTERISTICS";
pub const READ_TEMPERATURE: &str = "READ_TEMPERATURE";
pub const WRITE_TAG: &str = "WRITE_TAG";

const PRIVACY_FLAG: Uuid = Uuid::from_u128(0x00002a02_0000_1000_8000_00805f9b34fb);
const IR_TEMPERATURE_DATA: Uuid = Uuid::from_u128(0xf000aa01_0451_4000_b000_000000000000);

/// What an operation gets to work with.
pub struct TaskContext {
    pub device: DeviceHandle,
    pub store: Store,
    pub config: Arc<SensorTagConfig>,
    pub payload: Option<Vec<u8>>,
}

#[async_trait]
pub trait DeviceOperation: Send + Sync {
    /// `Ok(false)` is a clean failure; errors are logged and count as failure too.
    async fn execute(&self, ctx: &TaskContext) -> Result<bool, RadioError>;
}

#[derive(Clone)]
pub struct TaskDescriptor {
    pub id: &'static str,
    pub title: &'static str,
    operation: Arc<dyn DeviceOperation>,
}

impl TaskDescriptor {
    pub fn new(id: &'static str, title: &'static str, operation: Arc<dyn DeviceOperation>) -> Self {
        Self {
            id,
            title,
            operation,
        }
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("id", &self.id)
            .field("title", &self.title)
            .finish()
    }
}

/// Immutable table of operations, built once at start-up.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: BTreeMap<&'static str, TaskDescriptor>,
}

impl TaskRegistry {
    pub fn new(descriptors: impl IntoIterator<Item = TaskDescriptor>) -> Self {
        Self {
            tasks: descriptors.into_iter().map(|d| (d.id, d)).collect(),
        }
    }

    pub fn standard() -> Self {
        Self::new([
            TaskDescriptor::new(
                READ_ALL_CHARACTERISTICS,
                "Read all characteristics",
                Arc::new(ReadAllCharacteristics),
            ),
            TaskDescriptor::new(READ_TEMPERATURE, "Read temperature", Arc::new(ReadTemperature)),
            TaskDescriptor::new(WRITE_TAG, "Write characteristics", Arc::new(WriteTag)),
        ])
    }

    pub fn get(&self, id: &str) -> Option<&TaskDescriptor> {
        self.tasks.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.values()
    }
}

struct ReadAllCharacteristics;

#[async_trait]
impl DeviceOperation for ReadAllCharacteristics {
    async fn execute(&self, ctx: &TaskContext) -> Result<bool, RadioError> {
        for service in ctx.device.services().await? {
            ctx.store.log(format!("Found service: {}", service.uuid));
            for characteristic in &service.characteristics {
                ctx.store
                    .log(format!("Found characteristic: {}", characteristic.uuid));
                if characteristic.uuid == PRIVACY_FLAG || !characteristic.properties.readable {
                    continue;
                }

                ctx.store.log("Reading value...");
                let value = ctx.device.read(characteristic).await?;
                ctx.store.log(format!("Got value: {}", decode_value(&value)));

                if characteristic.properties.writable_with_response {
                    ctx.device.write_with_response(characteristic, &value).await?;
                    ctx.store.log("Successfully written value back");
                }
            }
        }
        Ok(true)
    }
}

struct ReadTemperature;

#[async_trait]
impl DeviceOperation for ReadTemperature {
    async fn execute(&self, ctx: &TaskContext) -> Result<bool, RadioError> {
        ctx.store.log("Read temperature");
        let services = ctx.device.services().await?;
        let Some(characteristic) = find_characteristic(&services, IR_TEMPERATURE_DATA) else {
            ctx.store.log("No temperature characteristic on this tag");
            return Ok(false);
        };

        let raw = ctx.device.read(characteristic).await?;
        match ambient_celsius(&raw) {
            Some(celsius) => {
                ctx.store.log(format!("Ambient temperature: {:.2} C", celsius));
                Ok(true)
            }
            None => {
                ctx.store
                    .log(format!("Unexpected temperature payload: {}", decode_value(&raw)));
                Ok(false)
            }
        }
    }
}

/// Ambient die temperature from an IR temperature data record (bytes 2..4, 1/128 C).
fn ambient_celsius(raw: &[u8]) -> Option<f64> {
    let bytes: [u8; 2] = raw.get(2..4)?.try_into().ok()?;
    Some(f64::from(i16::from_le_bytes(bytes)) / 128.0)
}

struct WriteTag;

#[async_trait]
impl DeviceOperation for WriteTag {
    async fn execute(&self, ctx: &TaskContext) -> Result<bool, RadioError> {
        let services = ctx.device.services().await?;
        let target = ctx.config.write_characteristic;
        let characteristic =
            find_characteristic(&services, target).ok_or(RadioError::CharacteristicNotFound(target))?;
        ctx.store.log(format!("Found characteristic: {}", characteristic.uuid));

        let payload = ctx
            .payload
            .clone()
            .unwrap_or_else(|| ctx.config.default_write_payload.clone().into_bytes());
        ctx.device.write_with_response(characteristic, &payload).await?;
        ctx.store
            .log(format!("Successfully written value: {}", decode_value(&payload)));
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Test,
    Write,
}

impl TaskKind {
    fn finished(self) -> Action {
        match self {
            TaskKind::Test => Action::TestFinished,
            TaskKind::Write => Action::WriteFinished,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Test => f.write_str("test"),
            TaskKind::Write => f.write_str("write"),
        }
    }
}

/// A spawned operation that can be cancelled and awaited.
pub struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningTask {
    pub fn spawn(kind: TaskKind, descriptor: TaskDescriptor, ctx: TaskContext) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_task(kind, descriptor, ctx, token.clone()));
        Self { token, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels and waits until the task has stopped.
    pub async fn cancel(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("task ended abnormally: {}", e);
        }
    }
}

async fn run_task(
    kind: TaskKind,
    descriptor: TaskDescriptor,
    ctx: TaskContext,
    token: CancellationToken,
) {
    let store = ctx.store.clone();
    let started = Instant::now();
    store.log(format!(
        "Executing {}: {} ({}) at {}",
        kind,
        descriptor.id,
        descriptor.title,
        Local::now().format("%H:%M:%S%.3f")
    ));

    let result = tokio::select! {
        _ = token.cancelled() => {
            debug!(task = descriptor.id, "cancelled");
            store.log(format!("{} {} cancelled", kind, descriptor.id));
            return;
        }
        result = descriptor.operation.execute(&ctx) => result,
    };

    let elapsed = started.elapsed().as_millis();
    let finished_at = Local::now().format("%H:%M:%S%.3f");
    let succeeded = match result {
        Ok(ok) => ok,
        Err(e) => {
            warn!(task = descriptor.id, error = %e, "operation failed");
            store.dispatch(Action::DeviceError {
                id: ctx.device.id(),
                message: e.to_string(),
            });
            false
        }
    };
    if succeeded {
        store.log(format!(
            "{} {} finished successfully at {} ({} ms)",
            kind, descriptor.id, finished_at, elapsed
        ));
    } else {
        store.log(format!(
            "{} {} failed at {} ({} ms)",
            kind, descriptor.id, finished_at, elapsed
        ));
    }
    store.dispatch(kind.finished());
}

/// Holds at most one running task; a replacement cancels its predecessor first.
#[derive(Default)]
pub struct TaskSlot {
    running: Option<RunningTask>,
}

impl TaskSlot {
    pub async fn replace(&mut self, kind: TaskKind, descriptor: TaskDescriptor, ctx: TaskContext) {
        self.cancel().await;
        self.running = Some(RunningTask::spawn(kind, descriptor, ctx));
    }

    pub async fn cancel(&mut self) {
        if let Some(task) = self.running.take() {
            if !task.is_finished() {
                task.cancel().await;
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.running.as_ref().map_or(false, |t| !t.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WRITE_CHARACTERISTIC;
    use crate::radio::mock::TEMPERATURE_DATA;
    use crate::radio::MockPeripheral;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn connected_tag() -> Arc<MockPeripheral> {
        let tag = MockPeripheral::sensortag("AA:01", "NEBULA");
        tag.handle().connect().await.unwrap();
        tag
    }

    fn context(tag: &Arc<MockPeripheral>, store: &Store, payload: Option<&[u8]>) -> TaskContext {
        TaskContext {
            device: tag.handle(),
            store: store.clone(),
            config: Arc::new(SensorTagConfig::default()),
            payload: payload.map(<[u8]>::to_vec),
        }
    }

    async fn wait_finished(store: &Store) {
        let mut rx = store.watch_state();
        let waited = timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.logs.iter().any(|l| l.contains("finished") || l.contains("failed"))),
        )
        .await;
        assert!(waited.is_ok(), "task did not finish");
    }

    #[test]
    fn test_standard_registry() {
        let registry = TaskRegistry::standard();
        let ids: Vec<_> = registry.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![READ_ALL_CHARACTERISTICS, READ_TEMPERATURE, WRITE_TAG]);
        assert_eq!(registry.get(WRITE_TAG).unwrap().title, "Write characteristics");
        assert!(registry.get("FORMAT_FLASH").is_none());
    }

    #[test]
    fn test_ambient_celsius() {
        assert_eq!(ambient_celsius(&[0x68, 0x0b, 0x00, 0x0c]), Some(24.0));
        assert_eq!(ambient_celsius(&[0x00, 0x00, 0x80, 0xff]), Some(-1.0));
        assert_eq!(ambient_celsius(&[0x01]), None);
    }

    #[tokio::test]
    async fn test_read_all_characteristics_writes_back() {
        let tag = connected_tag().await;
        let store = Store::new();
        let registry = TaskRegistry::standard();

        let task = RunningTask::spawn(
            TaskKind::Test,
            registry.get(READ_ALL_CHARACTERISTICS).unwrap().clone(),
            context(&tag, &store, None),
        );
        wait_finished(&store).await;
        task.cancel().await;

        let logs = store.snapshot().logs;
        assert!(logs.iter().any(|l| l == "Got value: Texas Instruments"));
        assert!(logs
            .iter()
            .any(|l| l.starts_with("test READ_ALL_CHARACTERISTICS finished successfully")));

        // only the UART write characteristic accepts write-with-response
        let writes = tag.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, WRITE_CHARACTERISTIC);
        assert_eq!(writes[0].1, b"/rgb/ffffff000000/".to_vec());
    }

    #[tokio::test]
    async fn test_write_tag_uses_payload_or_default() {
        let tag = connected_tag().await;
        let store = Store::new();
        let registry = TaskRegistry::standard();
        let descriptor = registry.get(WRITE_TAG).unwrap().clone();

        let task = RunningTask::spawn(
            TaskKind::Write,
            descriptor.clone(),
            context(&tag, &store, Some(b"/rgb/ff0000/")),
        );
        wait_finished(&store).await;
        task.cancel().await;

        store.dispatch(Action::ClearLogs);
        let task = RunningTask::spawn(TaskKind::Write, descriptor, context(&tag, &store, None));
        wait_finished(&store).await;
        task.cancel().await;

        let writes: Vec<_> = tag.writes().into_iter().map(|(_, v)| v).collect();
        assert_eq!(
            writes,
            vec![b"/rgb/ff0000/".to_vec(), b"/rgb/000000000000/".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_read_temperature() {
        let tag = connected_tag().await;
        tag.set_value(TEMPERATURE_DATA, &[0x00, 0x00, 0x00, 0x0c]);
        let store = Store::new();
        let registry = TaskRegistry::standard();

        let task = RunningTask::spawn(
            TaskKind::Test,
            registry.get(READ_TEMPERATURE).unwrap().clone(),
            context(&tag, &store, None),
        );
        wait_finished(&store).await;
        task.cancel().await;

        let logs = store.snapshot().logs;
        assert!(logs.iter().any(|l| l == "Ambient temperature: 24.00 C"));
    }

    #[tokio::test]
    async fn test_operation_error_reports_failure() {
        // never connected, so every GATT call fails
        let tag = MockPeripheral::sensortag("AA:01", "NEBULA");
        let store = Store::new();
        let registry = TaskRegistry::standard();
        let mut finished = store.subscribe(|a| matches!(a, Action::TestFinished));

        let task = RunningTask::spawn(
            TaskKind::Test,
            registry.get(READ_ALL_CHARACTERISTICS).unwrap().clone(),
            context(&tag, &store, None),
        );
        wait_finished(&store).await;
        task.cancel().await;

        let logs = store.snapshot().logs;
        assert!(logs.iter().any(|l| l.starts_with("ERROR: device disconnected")));
        assert!(logs
            .iter()
            .any(|l| l.starts_with("test READ_ALL_CHARACTERISTICS failed")));
        assert!(finished.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_slot_cancels_before_replacing() {
        let tag = connected_tag().await;
        tag.stall_reads(true);
        let store = Store::new();
        let registry = TaskRegistry::standard();
        let mut finished = store.subscribe(|a| matches!(a, Action::TestFinished));
        let mut slot = TaskSlot::default();

        slot.replace(
            TaskKind::Test,
            registry.get(READ_TEMPERATURE).unwrap().clone(),
            context(&tag, &store, None),
        )
        .await;
        // let the first task reach its stalled read
        let mut rx = store.watch_state();
        timeout(Duration::from_secs(2), rx.wait_for(|s| s.logs.iter().any(|l| l == "Read temperature")))
            .await
            .unwrap()
            .unwrap();
        assert!(slot.is_active());

        slot.replace(
            TaskKind::Write,
            registry.get(WRITE_TAG).unwrap().clone(),
            context(&tag, &store, None),
        )
        .await;
        wait_finished(&store).await;

        let logs: Vec<_> = store.snapshot().logs.into_iter().rev().collect();
        let cancelled = logs
            .iter()
            .position(|l| l == "test READ_TEMPERATURE cancelled")
            .unwrap();
        let second = logs
            .iter()
            .position(|l| l.starts_with("Executing write: WRITE_TAG"))
            .unwrap();
        assert!(cancelled < second);
        assert!(finished.try_recv().is_none());

        slot.cancel().await;
        assert!(!slot.is_active());
    }
}
