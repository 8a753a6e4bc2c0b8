//! Device core
//!
//! One `DeviceCore` per IP block: it owns the block manager, the
//! observation state model, the task executor and (for monitored blocks)
//! the health monitor, and exposes the command surface. Fast commands run
//! inline; long-running commands are queued and answer `(Queued, task-id)`
//! immediately, with progress reported through the attribute publishers.

use crate::attribute::AttributePublisher;
use crate::backend::BackendSettings;
use crate::blocks::{BlockKind, BlockManager};
use crate::executor::{Hook, TaskExecutor, TaskRequest};
use crate::health::HealthMonitor;
use anyhow::Result;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use vcc_shared::config::ChanneliserConfig;
use vcc_shared::{timing, AdminMode, HealthState, ObsAction, ObsState, ObsStateModel, ResultCode};

/// Static description of one block device
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub device_id: String,
    pub kind: BlockKind,
    pub backend: BackendSettings,
    pub poll_period: Duration,
}

impl DeviceSettings {
    /// Simulator-backed device with the default poll period
    pub fn simulated(device_id: impl Into<String>, kind: BlockKind) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            backend: BackendSettings::simulated(kind.block_id()),
            poll_period: Duration::from_millis(timing::DEFAULT_POLL_PERIOD_MS),
        }
    }
}

/// Immediate answer of a command: the result code plus either a message
/// or, for queued commands, the task id to watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub code: ResultCode,
    pub message: String,
}

impl CommandReply {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn queued(task_id: String) -> Self {
        Self::new(ResultCode::Queued, task_id)
    }

    fn not_allowed(message: impl Into<String>) -> Self {
        Self::new(ResultCode::NotAllowed, message)
    }

    fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ResultCode::NotImplemented, message)
    }
}

/// Terminal outcome of the most recently finished task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastResult {
    pub task_id: String,
    pub code: ResultCode,
    pub message: String,
}

/// The per-block device
pub struct DeviceCore {
    device_id: String,
    kind: BlockKind,
    manager: Arc<BlockManager>,
    model: Arc<ObsStateModel>,
    executor: Arc<TaskExecutor>,
    monitor: Option<Arc<HealthMonitor>>,
    admin_mode: Mutex<AdminMode>,
    admin_mode_attr: Arc<AttributePublisher<AdminMode>>,
    obs_state_attr: Arc<AttributePublisher<ObsState>>,
    health_attr: Arc<AttributePublisher<HealthState>>,
    last_result_attr: Arc<AttributePublisher<LastResult>>,
    sample_rate_attr: Arc<AttributePublisher<Option<u64>>>,
    gains_attr: Arc<AttributePublisher<Option<Vec<f64>>>>,
    expected_dish_id_attr: Arc<AttributePublisher<Option<String>>>,
    band_attr: Arc<AttributePublisher<Option<u64>>>,
}

impl DeviceCore {
    /// Bind the back-end and bring the device up in Idle, Online
    pub fn new(settings: DeviceSettings) -> Result<Arc<Self>> {
        let manager = Arc::new(BlockManager::new(&settings.backend, settings.kind)?);
        let model = Arc::new(ObsStateModel::new());
        let executor = Arc::new(TaskExecutor::new(model.clone()));

        let obs_state_attr = Arc::new(AttributePublisher::new("obs_state"));
        let health_attr = Arc::new(AttributePublisher::new("health_state"));
        let last_result_attr = Arc::new(AttributePublisher::new("last_result"));

        // The model drives the published obs state; the publisher's
        // duplicate suppression hides the Starting/Stopping refinements
        let obs_clone = obs_state_attr.clone();
        model.set_callback(Box::new(move |state: ObsState| {
            obs_clone.publish(state.published());
        }));
        obs_state_attr.publish(ObsState::Idle);
        health_attr.publish(HealthState::Unknown);

        let monitor = settings.kind.is_monitored().then(|| {
            let health_clone = health_attr.clone();
            Arc::new(HealthMonitor::new(
                settings.device_id.clone(),
                settings.poll_period,
                manager.status_poller(),
                manager.health_mapping(),
                Arc::new(move |health| {
                    health_clone.publish(health);
                }),
            ))
        });

        // Pump terminal task updates into the last-result attribute
        let mut events = executor.subscribe();
        let result_clone = last_result_attr.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(update) => {
                        if let Some((code, message)) = update.result {
                            result_clone.publish(LastResult {
                                task_id: update.task_id,
                                code,
                                message,
                            });
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        info!("device {} up ({})", settings.device_id, settings.kind);
        Ok(Arc::new(Self {
            device_id: settings.device_id,
            kind: settings.kind,
            manager,
            model,
            executor,
            monitor,
            admin_mode: Mutex::new(AdminMode::Online),
            admin_mode_attr: Arc::new(AttributePublisher::new("admin_mode")),
            obs_state_attr,
            health_attr,
            last_result_attr,
            sample_rate_attr: Arc::new(AttributePublisher::new("sample_rate")),
            gains_attr: Arc::new(AttributePublisher::new("gains")),
            expected_dish_id_attr: Arc::new(AttributePublisher::new("expected_dish_id")),
            band_attr: Arc::new(AttributePublisher::new("band")),
        }))
    }

    /// Simulator-backed device, the default for tests
    pub fn simulated(device_id: impl Into<String>, kind: BlockKind) -> Arc<Self> {
        Self::new(DeviceSettings::simulated(device_id, kind))
            .expect("simulator construction is infallible")
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Externally published observation state
    pub fn obs_state(&self) -> ObsState {
        self.model.published()
    }

    pub fn health_state(&self) -> HealthState {
        self.health_attr.last().unwrap_or(HealthState::Unknown)
    }

    pub fn admin_mode(&self) -> AdminMode {
        *self.admin_mode.lock().unwrap()
    }

    pub fn set_admin_mode(&self, mode: AdminMode) {
        *self.admin_mode.lock().unwrap() = mode;
        self.admin_mode_attr.publish(mode);
        info!("device {}: admin mode {:?}", self.device_id, mode);
    }

    pub fn subscribe_obs_state(
        &self,
    ) -> tokio::sync::broadcast::Receiver<crate::attribute::ChangeEvent<ObsState>> {
        self.obs_state_attr.subscribe()
    }

    pub fn subscribe_health(
        &self,
    ) -> tokio::sync::broadcast::Receiver<crate::attribute::ChangeEvent<HealthState>> {
        self.health_attr.subscribe()
    }

    pub fn subscribe_results(
        &self,
    ) -> tokio::sync::broadcast::Receiver<crate::attribute::ChangeEvent<LastResult>> {
        self.last_result_attr.subscribe()
    }

    pub fn last_result(&self) -> Option<LastResult> {
        self.last_result_attr.last()
    }

    /// Terminal result of a retained task, if it already finished
    pub fn task_result(&self, task_id: &str) -> Option<(ResultCode, String)> {
        self.executor
            .record(task_id)
            .filter(|record| record.status.is_terminal())
            .and_then(|record| record.result)
    }

    pub fn sample_rate(&self) -> Option<u64> {
        self.sample_rate_attr.last().flatten()
    }

    pub fn expected_dish_id(&self) -> Option<String> {
        self.expected_dish_id_attr.last().flatten()
    }

    pub fn band(&self) -> Option<u64> {
        self.band_attr.last().flatten()
    }

    /// True while the health poller task runs
    pub fn is_polling(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| m.is_polling())
    }

    fn admin_gate(&self) -> Option<CommandReply> {
        let mode = self.admin_mode();
        if matches!(mode, AdminMode::Offline | AdminMode::NotFitted) {
            return Some(CommandReply::not_allowed(format!(
                "device {} is {:?}",
                self.device_id, mode
            )));
        }
        None
    }

    fn state_gate(&self, action: ObsAction) -> Option<CommandReply> {
        if !self.model.is_action_allowed(action) {
            return Some(CommandReply::not_allowed(format!(
                "action {:?} is not allowed from state {:?}",
                action,
                self.model.state()
            )));
        }
        None
    }

    fn submit(&self, request: TaskRequest) -> CommandReply {
        match self.executor.submit(request) {
            Ok(task_id) => CommandReply::queued(task_id),
            Err((code, message)) => CommandReply::new(code, message),
        }
    }

    /// Re-establish communication with the block and bring its registers
    /// to a known state. Allowed in any observation state.
    pub fn recover(&self) -> CommandReply {
        if let Some(reply) = self.admin_gate() {
            return reply;
        }
        let manager = self.manager.clone();
        self.submit(TaskRequest {
            name: "recover".into(),
            hook: None,
            work: Box::new(move |_, _| Box::pin(async move { manager.recover().await })),
        })
    }

    /// Apply a configuration to the block.
    ///
    /// The payload is validated inline; a schema violation answers
    /// immediately and leaves the observation state untouched.
    pub fn configure(&self, payload: Value) -> CommandReply {
        if let Some(reply) = self.admin_gate() {
            return reply;
        }
        if !self.kind.supports_configure() {
            return CommandReply::not_implemented(format!(
                "{} does not take a configuration",
                self.kind
            ));
        }
        if let Some(error) = self.validate_configure(&payload) {
            return CommandReply::new(ResultCode::Failed, error);
        }
        if let Some(reply) = self.state_gate(ObsAction::ConfigureInvoked) {
            return reply;
        }

        let manager = self.manager.clone();
        let kind = self.kind;
        let sample_rate_attr = self.sample_rate_attr.clone();
        let gains_attr = self.gains_attr.clone();
        let expected_dish_id_attr = self.expected_dish_id_attr.clone();
        let band_attr = self.band_attr.clone();
        self.submit(TaskRequest {
            name: "configure".into(),
            hook: Some(Hook::CONFIGURE),
            work: Box::new(move |_, abort| {
                Box::pin(async move {
                    if abort.is_set() {
                        return (ResultCode::Aborted, "configure aborted".into());
                    }
                    let (code, message) = manager.configure(&payload).await;
                    if code == ResultCode::Ok {
                        match kind {
                            BlockKind::Channeliser => {
                                if let Ok(config) = ChanneliserConfig::from_value(&payload) {
                                    sample_rate_attr.publish(Some(config.sample_rate));
                                    gains_attr.publish(Some(config.gains));
                                }
                            }
                            BlockKind::WidebandInputBuffer => {
                                if let Some(dish) =
                                    payload.get("expected_dish_id").and_then(Value::as_str)
                                {
                                    expected_dish_id_attr.publish(Some(dish.to_string()));
                                }
                            }
                            BlockKind::FrequencySliceSelector => {
                                if let Some(band) = payload.get("band").and_then(Value::as_u64) {
                                    band_attr.publish(Some(band));
                                }
                            }
                            _ => {}
                        }
                    }
                    (code, message)
                })
            }),
        })
    }

    fn validate_configure(&self, payload: &Value) -> Option<String> {
        if !payload.is_object() {
            return Some(
                vcc_shared::config::SchemaError::new("payload is not an object").to_string(),
            );
        }
        if self.kind == BlockKind::Channeliser {
            if let Err(e) = ChanneliserConfig::from_value(payload) {
                return Some(e.to_string());
            }
        }
        None
    }

    /// Revert the block's configuration, optionally scoped by a payload
    pub fn deconfigure(&self, payload: Option<Value>) -> CommandReply {
        if let Some(reply) = self.admin_gate() {
            return reply;
        }
        if !self.kind.supports_configure() {
            return CommandReply::not_implemented(format!(
                "{} does not take a configuration",
                self.kind
            ));
        }
        if let Some(reply) = self.state_gate(ObsAction::DeconfigureInvoked) {
            return reply;
        }

        let manager = self.manager.clone();
        let scalars = self.scalar_attrs();
        self.submit(TaskRequest {
            name: "deconfigure".into(),
            hook: Some(Hook::DECONFIGURE),
            work: Box::new(move |_, _| {
                Box::pin(async move {
                    let (code, message) = manager.deconfigure(payload.as_ref()).await;
                    if code == ResultCode::Ok {
                        scalars.clear();
                    }
                    (code, message)
                })
            }),
        })
    }

    /// Start the block's runtime processing and its health polling
    pub fn start(&self) -> CommandReply {
        if let Some(reply) = self.admin_gate() {
            return reply;
        }
        if !self.kind.supports_runtime() {
            return CommandReply::not_implemented(format!("{} is not started directly", self.kind));
        }
        if let Some(reply) = self.state_gate(ObsAction::ScanInvoked) {
            return reply;
        }

        let manager = self.manager.clone();
        let monitor = self.monitor.clone();
        self.submit(TaskRequest {
            name: "start".into(),
            hook: Some(Hook::SCAN),
            work: Box::new(move |_, abort| {
                Box::pin(async move {
                    if abort.is_set() {
                        return (ResultCode::Aborted, "start aborted".into());
                    }
                    let (code, message) = manager.start().await;
                    if code == ResultCode::Ok {
                        if let Some(monitor) = monitor {
                            if let Err(e) = monitor.start() {
                                warn!("{}", e);
                            }
                        }
                    }
                    (code, message)
                })
            }),
        })
    }

    /// Stop the block's runtime processing and its health polling
    pub fn stop(&self) -> CommandReply {
        if let Some(reply) = self.admin_gate() {
            return reply;
        }
        if !self.kind.supports_runtime() {
            return CommandReply::not_implemented(format!("{} is not stopped directly", self.kind));
        }
        if let Some(reply) = self.state_gate(ObsAction::EndScanInvoked) {
            return reply;
        }

        let manager = self.manager.clone();
        let monitor = self.monitor.clone();
        self.submit(TaskRequest {
            name: "stop".into(),
            hook: Some(Hook::END_SCAN),
            work: Box::new(move |_, _| {
                Box::pin(async move {
                    if let Some(monitor) = monitor {
                        monitor.stop().await;
                    }
                    manager.stop(false).await
                })
            }),
        })
    }

    /// Read the block's raw status registers; `clear` zeroes the counters
    /// after the read. Fast command, answers inline.
    pub async fn get_status(&self, clear: bool) -> CommandReply {
        if let Some(reply) = self.admin_gate() {
            return reply;
        }
        let (code, report, message) = self.manager.status(clear).await;
        if code == ResultCode::Ok {
            CommandReply::new(ResultCode::Ok, Value::Object(report).to_string())
        } else {
            CommandReply::new(code, message)
        }
    }

    /// Return to Idle, dropping any applied configuration
    pub fn go_to_idle(&self) -> CommandReply {
        if let Some(reply) = self.admin_gate() {
            return reply;
        }
        if let Some(reply) = self.state_gate(ObsAction::GoToIdle) {
            return reply;
        }

        let manager = self.manager.clone();
        let model = self.model.clone();
        let scalars = self.scalar_attrs();
        self.submit(TaskRequest {
            name: "go_to_idle".into(),
            hook: None,
            work: Box::new(move |_, _| {
                Box::pin(async move {
                    let (code, message) = manager.deconfigure(None).await;
                    if code != ResultCode::Ok {
                        return (code, message);
                    }
                    scalars.clear();
                    match model.apply(ObsAction::GoToIdle) {
                        Ok(_) => (ResultCode::Ok, "device returned to idle".into()),
                        Err(e) => (ResultCode::NotAllowed, e.to_string()),
                    }
                })
            }),
        })
    }

    /// Abort all in-flight and queued work. Runs inline: the abort flag is
    /// broadcast immediately and the call waits for the tasks to drain.
    pub async fn abort(&self) -> CommandReply {
        if let Some(reply) = self.admin_gate() {
            return reply;
        }
        if self.model.state() == ObsState::Aborted {
            return CommandReply::not_allowed(format!(
                "device {} is already aborted",
                self.device_id
            ));
        }
        self.executor.abort_all().await;
        if let Some(monitor) = &self.monitor {
            monitor.stop().await;
        }
        CommandReply::new(ResultCode::Ok, "abort completed")
    }

    /// Reset the device out of Aborted or Fault back to a clean Idle.
    ///
    /// Outstanding tasks are signalled to abort first; the reset task
    /// itself passes the closed admission gate, waits for the others to
    /// drain, recovers the block and re-opens admission.
    pub fn obs_reset(&self) -> CommandReply {
        if let Some(reply) = self.admin_gate() {
            return reply;
        }
        if let Some(reply) = self.state_gate(ObsAction::ObsResetInvoked) {
            return reply;
        }

        self.executor.signal_abort();

        let manager = self.manager.clone();
        let executor = self.executor.clone();
        let monitor = self.monitor.clone();
        let scalars = self.scalar_attrs();
        let request = TaskRequest {
            name: "obs_reset".into(),
            hook: Some(Hook::OBS_RESET),
            work: Box::new(move |_, _| {
                Box::pin(async move {
                    if !executor.drain_others().await {
                        return (
                            ResultCode::Failed,
                            "outstanding tasks did not drain within the reset bound".into(),
                        );
                    }
                    if let Some(monitor) = monitor {
                        monitor.stop().await;
                    }
                    let (code, message) = manager.recover().await;
                    if code != ResultCode::Ok {
                        return (code, format!("recover failed during reset: {}", message));
                    }
                    let _ = manager.deconfigure(None).await;
                    scalars.clear();
                    executor.reset_admission();
                    (ResultCode::Ok, "obs reset complete".into())
                })
            }),
        };
        match self.executor.submit_privileged(request) {
            Ok(task_id) => CommandReply::queued(task_id),
            Err((code, message)) => CommandReply::new(code, message),
        }
    }

    fn scalar_attrs(&self) -> ScalarAttrs {
        ScalarAttrs {
            sample_rate: self.sample_rate_attr.clone(),
            gains: self.gains_attr.clone(),
            expected_dish_id: self.expected_dish_id_attr.clone(),
            band: self.band_attr.clone(),
        }
    }
}

/// The configured-value attributes cleared together on deconfigure and reset
struct ScalarAttrs {
    sample_rate: Arc<AttributePublisher<Option<u64>>>,
    gains: Arc<AttributePublisher<Option<Vec<f64>>>>,
    expected_dish_id: Arc<AttributePublisher<Option<String>>>,
    band: Arc<AttributePublisher<Option<u64>>>,
}

impl ScalarAttrs {
    fn clear(&self) {
        self.sample_rate.publish(None);
        self.gains.publish(None);
        self.expected_dish_id.publish(None);
        self.band.publish(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskUpdate;
    use serde_json::json;
    use tokio::sync::broadcast;
    use vcc_shared::TaskStatus;

    async fn wait_terminal(
        rx: &mut broadcast::Receiver<TaskUpdate>,
        task_id: &str,
    ) -> TaskUpdate {
        loop {
            let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for task update")
                .expect("event channel closed");
            if update.task_id == task_id && update.status.is_terminal() {
                return update;
            }
        }
    }

    fn channeliser_payload() -> Value {
        json!({ "sample_rate": 3_960_000_000u64, "gains": [1.0, 1.0, 1.0, 1.0] })
    }

    #[tokio::test]
    async fn test_configure_happy_path() {
        let device = DeviceCore::simulated("vcc-channeliser-001", BlockKind::Channeliser);
        let mut events = device.executor.subscribe();
        let mut obs = device.subscribe_obs_state();

        let reply = device.configure(channeliser_payload());
        assert_eq!(reply.code, ResultCode::Queued);
        assert!(reply.message.starts_with("task-"));

        let update = wait_terminal(&mut events, &reply.message).await;
        assert_eq!(update.status, TaskStatus::Completed);
        assert_eq!(
            update.result,
            Some((ResultCode::Ok, "channeliser configured successfully".into()))
        );
        assert_eq!(device.obs_state(), ObsState::Ready);
        assert_eq!(device.sample_rate(), Some(3_960_000_000));

        // Published obs-state sequence: Configuring, then Ready
        let first = obs.recv().await.unwrap();
        assert_eq!(first.value, ObsState::Configuring);
        let second = obs.recv().await.unwrap();
        assert_eq!(second.value, ObsState::Ready);
    }

    #[tokio::test]
    async fn test_schema_violation_answers_inline_without_state_change() {
        let device = DeviceCore::simulated("vcc-channeliser-001", BlockKind::Channeliser);

        let reply = device.configure(json!({
            "sample_rate": 3_960_000_000u64,
            "gains": [1.0, 1.0],
            "unexpected": true
        }));
        assert_eq!(reply.code, ResultCode::Failed);
        assert_eq!(
            reply.message,
            "Validation error: argin doesn't match the required schema"
        );
        assert_eq!(device.obs_state(), ObsState::Idle);
        assert_eq!(device.executor.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_abort_during_scan() {
        let device = DeviceCore::simulated("vcc-wib-001", BlockKind::WidebandInputBuffer);
        let mut events = device.executor.subscribe();

        let reply = device.start();
        assert_eq!(reply.code, ResultCode::Queued);
        let update = wait_terminal(&mut events, &reply.message).await;
        assert_eq!(update.status, TaskStatus::Completed);
        assert_eq!(device.obs_state(), ObsState::Scanning);

        // A long task is in flight when the abort lands
        let long_id = device
            .executor
            .submit(TaskRequest {
                name: "slow".into(),
                hook: None,
                work: Box::new(|_, abort| {
                    Box::pin(async move {
                        loop {
                            if abort.is_set() {
                                return (ResultCode::Aborted, "aborted".into());
                            }
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    })
                }),
            })
            .unwrap();

        let reply = device.abort().await;
        assert_eq!(reply.code, ResultCode::Ok);
        assert_eq!(device.obs_state(), ObsState::Aborted);

        let update = wait_terminal(&mut events, &long_id).await;
        assert_eq!(update.status, TaskStatus::Aborted);
    }

    #[tokio::test]
    async fn test_obs_reset_from_fault_aborts_and_recovers() {
        let device = DeviceCore::simulated("vcc-channeliser-001", BlockKind::Channeliser);
        let mut events = device.executor.subscribe();

        // Configure so there is residual state to clear
        let reply = device.configure(channeliser_payload());
        let _ = wait_terminal(&mut events, &reply.message).await;
        assert_eq!(device.sample_rate(), Some(3_960_000_000));

        device.model.apply(ObsAction::ComponentFault).unwrap();

        // In-flight work at the time of the fault
        let long_id = device
            .executor
            .submit(TaskRequest {
                name: "slow".into(),
                hook: None,
                work: Box::new(|_, abort| {
                    Box::pin(async move {
                        loop {
                            if abort.is_set() {
                                return (ResultCode::Aborted, "aborted".into());
                            }
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    })
                }),
            })
            .unwrap();

        let reply = device.obs_reset();
        assert_eq!(reply.code, ResultCode::Queued);

        let long = wait_terminal(&mut events, &long_id).await;
        assert_eq!(long.status, TaskStatus::Aborted);
        let reset = wait_terminal(&mut events, &reply.message).await;
        assert_eq!(reset.status, TaskStatus::Completed);

        assert_eq!(device.obs_state(), ObsState::Idle);
        assert_eq!(device.sample_rate(), None);

        // Admission is open again after the reset
        assert_eq!(device.recover().code, ResultCode::Queued);
    }

    #[tokio::test]
    async fn test_obs_reset_requires_aborted_or_fault() {
        let device = DeviceCore::simulated("vcc-channeliser-001", BlockKind::Channeliser);
        let reply = device.obs_reset();
        assert_eq!(reply.code, ResultCode::NotAllowed);
        assert_eq!(device.obs_state(), ObsState::Idle);
    }

    #[tokio::test]
    async fn test_abort_from_aborted_refused() {
        let device = DeviceCore::simulated("vcc-channeliser-001", BlockKind::Channeliser);
        assert_eq!(device.abort().await.code, ResultCode::Ok);
        assert_eq!(device.obs_state(), ObsState::Aborted);

        let reply = device.abort().await;
        assert_eq!(reply.code, ResultCode::NotAllowed);
        assert_eq!(device.obs_state(), ObsState::Aborted);
    }

    #[tokio::test]
    async fn test_unsupported_commands_answer_not_implemented() {
        let mac = DeviceCore::simulated("vcc-mac-001", BlockKind::Mac);
        let reply = mac.configure(json!({ "rx_loopback_enable": false }));
        assert_eq!(reply.code, ResultCode::NotImplemented);
        assert_eq!(mac.obs_state(), ObsState::Idle);

        let channeliser = DeviceCore::simulated("vcc-channeliser-001", BlockKind::Channeliser);
        assert_eq!(channeliser.start().code, ResultCode::NotImplemented);
        assert_eq!(channeliser.stop().code, ResultCode::NotImplemented);
        assert_eq!(channeliser.obs_state(), ObsState::Idle);
    }

    #[tokio::test]
    async fn test_offline_device_refuses_commands() {
        let device = DeviceCore::simulated("vcc-channeliser-001", BlockKind::Channeliser);
        device.set_admin_mode(AdminMode::Offline);

        let reply = device.configure(channeliser_payload());
        assert_eq!(reply.code, ResultCode::NotAllowed);
        assert_eq!(device.recover().code, ResultCode::NotAllowed);
        assert_eq!(device.get_status(false).await.code, ResultCode::NotAllowed);
        assert_eq!(device.abort().await.code, ResultCode::NotAllowed);

        device.set_admin_mode(AdminMode::Online);
        assert_eq!(device.configure(channeliser_payload()).code, ResultCode::Queued);
    }

    #[tokio::test]
    async fn test_start_links_health_polling() {
        let mut settings =
            DeviceSettings::simulated("vcc-wib-001", BlockKind::WidebandInputBuffer);
        settings.poll_period = Duration::from_millis(100);
        let device = DeviceCore::new(settings).unwrap();
        let mut events = device.executor.subscribe();
        let mut health = device.subscribe_health();

        let reply = device.start();
        let update = wait_terminal(&mut events, &reply.message).await;
        assert_eq!(update.status, TaskStatus::Completed);
        assert!(device.is_polling());

        // The simulator reports a healthy input buffer
        let change = tokio::time::timeout(Duration::from_secs(2), health.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.value, HealthState::Ok);

        let reply = device.stop();
        let update = wait_terminal(&mut events, &reply.message).await;
        assert_eq!(update.status, TaskStatus::Completed);
        assert!(!device.is_polling());
        assert_eq!(device.obs_state(), ObsState::Ready);
    }

    #[tokio::test]
    async fn test_configure_then_deconfigure_round_trip() {
        let device = DeviceCore::simulated("vcc-channeliser-001", BlockKind::Channeliser);
        let mut events = device.executor.subscribe();

        let reply = device.configure(channeliser_payload());
        let _ = wait_terminal(&mut events, &reply.message).await;
        assert_eq!(device.obs_state(), ObsState::Ready);

        let reply = device.deconfigure(None);
        let update = wait_terminal(&mut events, &reply.message).await;
        assert_eq!(update.status, TaskStatus::Completed);
        assert_eq!(device.obs_state(), ObsState::Idle);
        assert_eq!(device.sample_rate(), None);
        assert!(device.gains_attr.last().flatten().is_none());
    }

    #[tokio::test]
    async fn test_get_status_answers_inline() {
        let device = DeviceCore::simulated("vcc-wib-001", BlockKind::WidebandInputBuffer);
        let reply = device.get_status(false).await;
        assert_eq!(reply.code, ResultCode::Ok);
        let report: Value = serde_json::from_str(&reply.message).unwrap();
        assert_eq!(report["rx_ready"], json!(true));
        assert_eq!(device.obs_state(), ObsState::Idle);
    }
}
