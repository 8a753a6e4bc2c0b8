//! Lane coordinator
//!
//! The `LaneController` owns the nine block devices of a VCC lane and its
//! own observation state model and task executor. `ConfigureScan` applies
//! the parsed document to the signal-path devices in order and rolls the
//! chain back on the first failure; `Scan`/`EndScan` fan out to the
//! ingress devices; `Abort` and `ObsReset` drive every subordinate back to
//! a known state. Subordinate health changes roll up into a single
//! lane-level health attribute.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use vcc_device::attribute::{AttributePublisher, ChangeEvent};
use vcc_device::blocks::BlockKind;
use vcc_device::device::{CommandReply, DeviceCore, LastResult};
use vcc_device::executor::{Hook, TaskExecutor, TaskRequest};
use vcc_shared::config::ScanConfiguration;
use vcc_shared::{
    timing, HealthState, ObsAction, ObsState, ObsStateModel, ResultCode,
};

/// Wait for a device task submitted through `reply` to reach a terminal
/// result. Non-queued replies are returned as-is.
pub async fn await_device_task(device: &DeviceCore, reply: CommandReply) -> (ResultCode, String) {
    if reply.code != ResultCode::Queued {
        return (reply.code, reply.message);
    }
    let task_id = reply.message;
    let mut rx = device.subscribe_results();
    // The record is written before the event is broadcast, so checking it
    // after subscribing cannot miss a result
    if let Some(result) = device.task_result(&task_id) {
        return result;
    }

    let bound = Duration::from_millis(timing::OBS_RESET_WAIT_TIMEOUT_MS);
    let deadline = tokio::time::Instant::now() + bound;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) if event.value.task_id == task_id => {
                return (event.value.code, event.value.message);
            }
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                if let Some(result) = device.task_result(&task_id) {
                    return result;
                }
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                return (
                    ResultCode::Failed,
                    format!("no terminal result for {} within {:?}", task_id, bound),
                );
            }
        }
    }
}

/// The block devices of one lane
#[derive(Clone)]
pub struct LaneDevices {
    pub mac: Arc<DeviceCore>,
    pub packet_validator: Arc<DeviceCore>,
    pub wideband_input_buffer: Arc<DeviceCore>,
    pub wideband_frequency_shifter: Arc<DeviceCore>,
    pub channeliser: Arc<DeviceCore>,
    pub frequency_slice_selector: Arc<DeviceCore>,
    pub b123_power_meter: Arc<DeviceCore>,
    pub b45a_power_meter: Arc<DeviceCore>,
    pub b5b_power_meter: Arc<DeviceCore>,
    pub packetizer: Arc<DeviceCore>,
}

impl LaneDevices {
    /// One simulator-backed device per block, named after the lane
    pub fn simulated(lane_id: &str) -> Self {
        let device = |suffix: &str, kind: BlockKind| {
            DeviceCore::simulated(format!("{}-{}", lane_id, suffix), kind)
        };
        Self {
            mac: device("mac", BlockKind::Mac),
            packet_validator: device("packet-validator", BlockKind::PacketValidator),
            wideband_input_buffer: device("wib", BlockKind::WidebandInputBuffer),
            wideband_frequency_shifter: device("wfs", BlockKind::WidebandFrequencyShifter),
            channeliser: device("channeliser", BlockKind::Channeliser),
            frequency_slice_selector: device("fss", BlockKind::FrequencySliceSelector),
            b123_power_meter: device("b123-pwrm", BlockKind::PowerMeter),
            b45a_power_meter: device("b45a-pwrm", BlockKind::PowerMeter),
            b5b_power_meter: device("b5b-pwrm", BlockKind::PowerMeter),
            packetizer: device("packetizer", BlockKind::Packetizer),
        }
    }

    /// Every subordinate, in no particular order
    pub fn all(&self) -> Vec<Arc<DeviceCore>> {
        vec![
            self.mac.clone(),
            self.packet_validator.clone(),
            self.wideband_input_buffer.clone(),
            self.wideband_frequency_shifter.clone(),
            self.channeliser.clone(),
            self.frequency_slice_selector.clone(),
            self.b123_power_meter.clone(),
            self.b45a_power_meter.clone(),
            self.b5b_power_meter.clone(),
            self.packetizer.clone(),
        ]
    }

    /// The ingress devices started and stopped with the scan
    fn runtime(&self) -> Vec<Arc<DeviceCore>> {
        vec![
            self.mac.clone(),
            self.packet_validator.clone(),
            self.wideband_input_buffer.clone(),
        ]
    }
}

/// Worst severity present in the rollup map; an empty map is unknown
fn rollup_of(map: &HashMap<String, HealthState>) -> HealthState {
    for level in HealthState::SEVERITY_ORDER {
        if map.values().any(|v| *v == level) {
            return level;
        }
    }
    HealthState::Unknown
}

/// Coordinator for one VCC lane
pub struct LaneController {
    lane_id: String,
    devices: LaneDevices,
    model: Arc<ObsStateModel>,
    executor: Arc<TaskExecutor>,
    obs_state_attr: Arc<AttributePublisher<ObsState>>,
    health_attr: Arc<AttributePublisher<HealthState>>,
    last_result_attr: Arc<AttributePublisher<LastResult>>,
    subarray_attr: Arc<AttributePublisher<u16>>,
    scan_id_attr: Arc<AttributePublisher<Option<u32>>>,
    config_id_attr: Arc<AttributePublisher<Option<String>>>,
    subarray_id: Mutex<u16>,
    /// Sample rate and gains of the applied configuration, kept for
    /// on-the-fly gain updates and their rollback
    channeliser_config: Arc<Mutex<Option<(u64, Vec<f64>)>>>,
}

impl LaneController {
    /// Bring up the coordinator over an existing set of devices
    pub fn new(lane_id: impl Into<String>, devices: LaneDevices) -> Arc<Self> {
        let lane_id = lane_id.into();
        let model = Arc::new(ObsStateModel::new());
        let executor = Arc::new(TaskExecutor::new(model.clone()));

        let obs_state_attr = Arc::new(AttributePublisher::new("obs_state"));
        let obs_clone = obs_state_attr.clone();
        model.set_callback(Box::new(move |state: ObsState| {
            obs_clone.publish(state.published());
        }));
        obs_state_attr.publish(ObsState::Idle);

        let health_attr = Arc::new(AttributePublisher::new("health_state"));
        health_attr.publish(HealthState::Unknown);
        let rollup = Arc::new(Mutex::new(HashMap::new()));
        for device in devices.all() {
            rollup
                .lock()
                .unwrap()
                .insert(device.device_id().to_string(), device.health_state());
            let mut rx = device.subscribe_health();
            let rollup = rollup.clone();
            let health_attr = health_attr.clone();
            let device_id = device.device_id().to_string();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(change) => {
                            let aggregate = {
                                let mut map = rollup.lock().unwrap();
                                map.insert(device_id.clone(), change.value);
                                rollup_of(&map)
                            };
                            health_attr.publish(aggregate);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        let last_result_attr = Arc::new(AttributePublisher::new("last_result"));
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
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        info!("lane controller {} up", lane_id);
        Arc::new(Self {
            lane_id,
            devices,
            model,
            executor,
            obs_state_attr,
            health_attr,
            last_result_attr,
            subarray_attr: Arc::new(AttributePublisher::new("subarray_id")),
            scan_id_attr: Arc::new(AttributePublisher::new("scan_id")),
            config_id_attr: Arc::new(AttributePublisher::new("config_id")),
            subarray_id: Mutex::new(0),
            channeliser_config: Arc::new(Mutex::new(None)),
        })
    }

    /// Simulator-backed lane, the default for tests
    pub fn simulated(lane_id: &str) -> Arc<Self> {
        Self::new(lane_id, LaneDevices::simulated(lane_id))
    }

    pub fn lane_id(&self) -> &str {
        &self.lane_id
    }

    pub fn devices(&self) -> &LaneDevices {
        &self.devices
    }

    pub fn obs_state(&self) -> ObsState {
        self.model.published()
    }

    pub fn health_state(&self) -> HealthState {
        self.health_attr.last().unwrap_or(HealthState::Unknown)
    }

    pub fn subarray_id(&self) -> u16 {
        *self.subarray_id.lock().unwrap()
    }

    pub fn scan_id(&self) -> Option<u32> {
        self.scan_id_attr.last().flatten()
    }

    pub fn config_id(&self) -> Option<String> {
        self.config_id_attr.last().flatten()
    }

    pub fn subscribe_obs_state(&self) -> broadcast::Receiver<ChangeEvent<ObsState>> {
        self.obs_state_attr.subscribe()
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<ChangeEvent<HealthState>> {
        self.health_attr.subscribe()
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<ChangeEvent<LastResult>> {
        self.last_result_attr.subscribe()
    }

    /// Terminal result of a retained controller task, if it finished
    pub fn task_result(&self, task_id: &str) -> Option<(ResultCode, String)> {
        self.executor
            .record(task_id)
            .filter(|record| record.status.is_terminal())
            .and_then(|record| record.result)
    }

    fn state_gate(&self, action: ObsAction) -> Option<CommandReply> {
        if !self.model.is_action_allowed(action) {
            return Some(CommandReply::new(
                ResultCode::NotAllowed,
                format!(
                    "action {:?} is not allowed from state {:?}",
                    action,
                    self.model.state()
                ),
            ));
        }
        None
    }

    fn submit(&self, request: TaskRequest) -> CommandReply {
        match self.executor.submit(request) {
            Ok(task_id) => CommandReply::new(ResultCode::Queued, task_id),
            Err((code, message)) => CommandReply::new(code, message),
        }
    }

    /// Parse a ConfigureScan document and apply it to the signal path.
    ///
    /// The devices are configured in order; on the first failure every
    /// already-configured device is deconfigured in reverse order and the
    /// lane returns to Idle.
    pub fn configure_scan(&self, document: &str) -> CommandReply {
        let config = match ScanConfiguration::from_json(document) {
            Ok(config) => config,
            Err(e) => return CommandReply::new(ResultCode::Rejected, e.to_string()),
        };
        if let Some(reply) = self.state_gate(ObsAction::ConfigureInvoked) {
            return reply;
        }

        let devices = self.devices.clone();
        let channeliser_config = self.channeliser_config.clone();
        let config_id_attr = self.config_id_attr.clone();
        self.submit(TaskRequest {
            name: "configure_scan".into(),
            hook: Some(Hook::CONFIGURE),
            work: Box::new(move |_, abort| {
                Box::pin(async move {
                    let band = config.frequency_band.index();
                    let steps: Vec<(Arc<DeviceCore>, Value)> = vec![
                        (
                            devices.channeliser.clone(),
                            json!({
                                "sample_rate": config.dish_sample_rate,
                                "gains": config.vcc_gain.clone(),
                            }),
                        ),
                        (
                            devices.wideband_frequency_shifter.clone(),
                            json!({
                                "shift_frequency": config.frequency_band_offset_stream_1,
                                "shift_frequency_stream_2":
                                    config.frequency_band_offset_stream_2.unwrap_or(0),
                            }),
                        ),
                        (
                            devices.frequency_slice_selector.clone(),
                            json!({ "band": band }),
                        ),
                        (
                            devices.wideband_input_buffer.clone(),
                            json!({
                                "expected_dish_id": config.expected_dish_id,
                                "expected_sample_rate": config.dish_sample_rate,
                                "noise_diode_transition_holdoff_seconds":
                                    config.noise_diode_transition_holdoff_seconds,
                            }),
                        ),
                        (
                            devices.b123_power_meter.clone(),
                            json!({
                                "averaging_time": config.b123_pwrm.averaging_time,
                                "flagging": config.b123_pwrm.flagging,
                            }),
                        ),
                        (
                            devices.b45a_power_meter.clone(),
                            json!({
                                "averaging_time": config.b45a_pwrm.averaging_time,
                                "flagging": config.b45a_pwrm.flagging,
                            }),
                        ),
                        (
                            devices.b5b_power_meter.clone(),
                            json!({
                                "averaging_time": config.b5b_pwrm.averaging_time,
                                "flagging": config.b5b_pwrm.flagging,
                            }),
                        ),
                        (
                            devices.packetizer.clone(),
                            json!({ "config_id": config.config_id.clone(), "frequency_band": band }),
                        ),
                    ];

                    let mut applied: Vec<Arc<DeviceCore>> = Vec::new();
                    for (device, payload) in steps {
                        if abort.is_set() {
                            rollback(&applied).await;
                            return (ResultCode::Aborted, "configure scan aborted".into());
                        }
                        let (code, message) =
                            await_device_task(&device, device.configure(payload)).await;
                        if code != ResultCode::Ok {
                            warn!(
                                "configure scan: {} failed ({:?}: {}), rolling back",
                                device.device_id(),
                                code,
                                message
                            );
                            rollback(&applied).await;
                            return (
                                ResultCode::Failed,
                                format!("{}: {}", device.device_id(), message),
                            );
                        }
                        applied.push(device);
                    }

                    *channeliser_config.lock().unwrap() =
                        Some((config.dish_sample_rate, config.vcc_gain.clone()));
                    config_id_attr.publish(Some(config.config_id.clone()));
                    (
                        ResultCode::Ok,
                        format!("scan configuration {} applied", config.config_id),
                    )
                })
            }),
        })
    }

    /// Start the scan: bring up the ingress devices in order
    pub fn scan(&self, scan_id: u32) -> CommandReply {
        if let Some(reply) = self.state_gate(ObsAction::ScanInvoked) {
            return reply;
        }

        let runtime = self.devices.runtime();
        let scan_id_attr = self.scan_id_attr.clone();
        self.submit(TaskRequest {
            name: "scan".into(),
            hook: Some(Hook::SCAN),
            work: Box::new(move |_, abort| {
                Box::pin(async move {
                    for device in &runtime {
                        if abort.is_set() {
                            return (ResultCode::Aborted, "scan aborted".into());
                        }
                        let (code, message) = await_device_task(device, device.start()).await;
                        if code != ResultCode::Ok {
                            return (
                                ResultCode::Failed,
                                format!("{}: {}", device.device_id(), message),
                            );
                        }
                    }
                    scan_id_attr.publish(Some(scan_id));
                    (ResultCode::Ok, format!("scan {} started", scan_id))
                })
            }),
        })
    }

    /// Stop the scan: take down the ingress devices in reverse order.
    ///
    /// In Fault the scan machinery may be in any half-way state, so the
    /// command instead propagates GoToIdle to every subordinate; the lane
    /// itself stays in Fault until ObsReset.
    pub fn end_scan(&self) -> CommandReply {
        if self.model.state() == ObsState::Fault {
            let devices = self.devices.all();
            let scan_id_attr = self.scan_id_attr.clone();
            return self.submit(TaskRequest {
                name: "end_scan".into(),
                hook: None,
                work: Box::new(move |_, _| {
                    Box::pin(async move {
                        for device in &devices {
                            if device.obs_state() == ObsState::Idle {
                                continue;
                            }
                            let (code, message) =
                                await_device_task(device, device.go_to_idle()).await;
                            if !matches!(code, ResultCode::Ok | ResultCode::NotAllowed) {
                                warn!(
                                    "end scan: {} go_to_idle failed: {}",
                                    device.device_id(),
                                    message
                                );
                            }
                        }
                        scan_id_attr.publish(None);
                        (ResultCode::Ok, "subordinates sent to idle".into())
                    })
                }),
            });
        }
        if let Some(reply) = self.state_gate(ObsAction::EndScanInvoked) {
            return reply;
        }

        let runtime = self.devices.runtime();
        let scan_id_attr = self.scan_id_attr.clone();
        self.submit(TaskRequest {
            name: "end_scan".into(),
            hook: Some(Hook::END_SCAN),
            work: Box::new(move |_, _| {
                Box::pin(async move {
                    let mut failures = Vec::new();
                    for device in runtime.iter().rev() {
                        let (code, message) = await_device_task(device, device.stop()).await;
                        if code != ResultCode::Ok {
                            failures.push(format!("{}: {}", device.device_id(), message));
                        }
                    }
                    scan_id_attr.publish(None);
                    if failures.is_empty() {
                        (ResultCode::Ok, "scan stopped".into())
                    } else {
                        (ResultCode::Failed, failures.join("; "))
                    }
                })
            }),
        })
    }

    /// Abort the lane. The lane enters Aborting first, the runtime-critical
    /// subordinates are stopped so the hardware quiesces, and only then is
    /// Aborted published. Runs inline.
    pub async fn abort(&self) -> CommandReply {
        if !self.model.is_action_allowed(ObsAction::AbortInvoked) {
            return CommandReply::new(
                ResultCode::NotAllowed,
                format!("abort is not allowed from state {:?}", self.model.state()),
            );
        }
        self.executor.signal_abort();
        let _ = self.model.apply(ObsAction::AbortInvoked);

        for device in self.devices.runtime() {
            let (code, message) = await_device_task(&device, device.stop()).await;
            // A subordinate that was never started refuses the stop;
            // nothing to quiesce there
            if !matches!(code, ResultCode::Ok | ResultCode::NotAllowed) {
                warn!("abort: {} stop failed: {}", device.device_id(), message);
            }
        }

        self.executor.drain().await;
        let _ = self.model.apply(ObsAction::AbortCompleted);
        CommandReply::new(ResultCode::Ok, "abort completed")
    }

    /// Reset the lane out of Aborted or Fault: drain outstanding work,
    /// drive every subordinate back to Idle and re-open admission.
    pub fn obs_reset(&self) -> CommandReply {
        if let Some(reply) = self.state_gate(ObsAction::ObsResetInvoked) {
            return reply;
        }

        self.executor.signal_abort();
        let from_fault = self.model.state() == ObsState::Fault;

        let devices = self.devices.clone();
        let executor = self.executor.clone();
        let channeliser_config = self.channeliser_config.clone();
        let config_id_attr = self.config_id_attr.clone();
        let scan_id_attr = self.scan_id_attr.clone();
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

                    // Out of Fault the subordinates may still be mid-flight;
                    // abort them all before driving them back to Idle
                    if from_fault {
                        futures::future::join_all(
                            devices.all().iter().map(|device| device.abort()),
                        )
                        .await;
                    }

                    for device in devices.all() {
                        let reply = match device.obs_state() {
                            ObsState::Idle => continue,
                            ObsState::Aborted | ObsState::Fault => device.obs_reset(),
                            ObsState::Scanning => {
                                device.abort().await;
                                device.obs_reset()
                            }
                            _ => device.go_to_idle(),
                        };
                        let (code, message) = await_device_task(&device, reply).await;
                        if code != ResultCode::Ok {
                            return (
                                ResultCode::Failed,
                                format!("{} reset failed: {}", device.device_id(), message),
                            );
                        }
                    }

                    *channeliser_config.lock().unwrap() = None;
                    config_id_attr.publish(None);
                    scan_id_attr.publish(None);
                    executor.reset_admission();
                    (ResultCode::Ok, "obs reset complete".into())
                })
            }),
        };
        match self.executor.submit_privileged(request) {
            Ok(task_id) => CommandReply::new(ResultCode::Queued, task_id),
            Err((code, message)) => CommandReply::new(code, message),
        }
    }

    /// Assign the lane to a subarray, or release it with id 0.
    ///
    /// A lane already assigned must be released before it can join a
    /// different subarray. Fast command, answers inline.
    pub fn update_subarray_membership(&self, subarray_id: u16) -> CommandReply {
        if subarray_id > timing::MAX_SUBARRAY_ID {
            return CommandReply::new(
                ResultCode::Rejected,
                format!(
                    "subarray id {} outside [0, {}]",
                    subarray_id,
                    timing::MAX_SUBARRAY_ID
                ),
            );
        }

        let mut current = self.subarray_id.lock().unwrap();
        match (*current, subarray_id) {
            (0, 0) => CommandReply::new(ResultCode::Ok, "lane is unassigned"),
            (0, n) => {
                *current = n;
                self.subarray_attr.publish(n);
                info!("lane {} assigned to subarray {}", self.lane_id, n);
                CommandReply::new(ResultCode::Ok, format!("assigned to subarray {}", n))
            }
            (n, 0) => {
                *current = 0;
                self.subarray_attr.publish(0);
                info!("lane {} released from subarray {}", self.lane_id, n);
                CommandReply::new(ResultCode::Ok, format!("released from subarray {}", n))
            }
            (n, m) if n == m => {
                CommandReply::new(ResultCode::Ok, format!("already assigned to subarray {}", n))
            }
            (n, _) => CommandReply::new(
                ResultCode::Rejected,
                format!("lane is assigned to subarray {}; release it first", n),
            ),
        }
    }

    /// Update the channeliser gains while a scan runs.
    ///
    /// Allowed only in Scanning; on failure the previous gains are
    /// restored so the running scan keeps a consistent configuration.
    pub fn auto_set_filter_gains(&self, gains: Vec<f64>) -> CommandReply {
        if self.model.published() != ObsState::Scanning {
            return CommandReply::new(
                ResultCode::NotAllowed,
                format!(
                    "gains can only be set while scanning, not in {:?}",
                    self.model.published()
                ),
            );
        }

        let channeliser = self.devices.channeliser.clone();
        let channeliser_config = self.channeliser_config.clone();
        self.submit(TaskRequest {
            name: "auto_set_filter_gains".into(),
            hook: None,
            work: Box::new(move |_, _| {
                Box::pin(async move {
                    let previous = channeliser_config.lock().unwrap().clone();
                    let Some((sample_rate, old_gains)) = previous else {
                        return (
                            ResultCode::Failed,
                            "no scan configuration is applied".into(),
                        );
                    };

                    let payload = json!({ "sample_rate": sample_rate, "gains": gains });
                    let (code, message) =
                        await_device_task(&channeliser, channeliser.configure(payload)).await;
                    if code != ResultCode::Ok {
                        warn!("gain update failed ({}), restoring previous gains", message);
                        let restore = json!({ "sample_rate": sample_rate, "gains": old_gains });
                        let (code, message) =
                            await_device_task(&channeliser, channeliser.configure(restore)).await;
                        if code != ResultCode::Ok {
                            return (
                                ResultCode::Failed,
                                format!("gain restore failed: {}", message),
                            );
                        }
                        return (ResultCode::Failed, "gain update failed and was rolled back".into());
                    }

                    *channeliser_config.lock().unwrap() = Some((sample_rate, gains));
                    (ResultCode::Ok, "filter gains updated".into())
                })
            }),
        })
    }
}

/// Deconfigure already-configured devices in reverse order
async fn rollback(applied: &[Arc<DeviceCore>]) {
    for device in applied.iter().rev() {
        let (code, message) = await_device_task(device, device.deconfigure(None)).await;
        if code != ResultCode::Ok {
            warn!(
                "rollback: {} deconfigure failed: {}",
                device.device_id(),
                message
            );
        }
    }
}
