//! Health monitor
//!
//! Periodically polls a block's status, maps the raw fields to per-check
//! health verdicts, aggregates them by severity and publishes the
//! aggregate on change. One poller task per monitored block; polling is
//! linked to the block's start/stop lifecycle by the owning manager.

use crate::backend::StatusReport;
use anyhow::{bail, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::interval;
use tracing::{info, warn};
use vcc_shared::{timing, HealthState};

/// Synthetic verdict key inserted when the status poll itself fails
pub const REGISTER_POLLING_EXCEPTION: &str = "REGISTER_POLLING_EXCEPTION";

/// Fetches one status report; `Err` carries the transport reason
pub type StatusPoller =
    Arc<dyn Fn() -> BoxFuture<'static, Result<StatusReport, String>> + Send + Sync>;

/// Block-specific translation from raw status to per-check verdicts
pub type HealthMapping =
    Arc<dyn Fn(&StatusReport, &mut EdgeMemo) -> HashMap<String, HealthState> + Send + Sync>;

/// Callback invoked once per aggregate change
pub type HealthCallback = Arc<dyn Fn(HealthState) + Send + Sync>;

/// Tracks the previous boolean reading of each readiness field.
///
/// A true→false transition trips the check and it stays tripped while the
/// reading remains false; a true reading recovers it. The first reading
/// ever seen cannot trip regardless of value.
#[derive(Debug, Default)]
pub struct EdgeMemo {
    previous: HashMap<String, bool>,
    tripped: std::collections::HashSet<String>,
}

impl EdgeMemo {
    pub fn observe(&mut self, key: &str, value: bool) -> HealthState {
        let previous = self.previous.insert(key.to_string(), value);
        if value {
            self.tripped.remove(key);
            return HealthState::Ok;
        }
        match previous {
            Some(true) => {
                self.tripped.insert(key.to_string());
                HealthState::Failed
            }
            Some(false) if self.tripped.contains(key) => HealthState::Failed,
            _ => HealthState::Ok,
        }
    }
}

/// Verdict for an expected-value register check
pub fn expect_equal<T: PartialEq + std::fmt::Debug>(
    key: &str,
    expected: &T,
    actual: &T,
) -> HealthState {
    if expected == actual {
        HealthState::Ok
    } else {
        warn!(
            "health check {}: expected {:?}, read {:?}",
            key, expected, actual
        );
        HealthState::Failed
    }
}

/// Worst severity present in the verdict map; an empty map is healthy
fn aggregate_of(map: &HashMap<String, HealthState>) -> HealthState {
    for level in HealthState::SEVERITY_ORDER {
        if map.values().any(|v| *v == level) {
            return level;
        }
    }
    HealthState::Ok
}

/// Periodic health poller for one IP block
pub struct HealthMonitor {
    name: String,
    period: Duration,
    poller: StatusPoller,
    mapping: HealthMapping,
    callback: HealthCallback,
    component_status: Arc<RwLock<HashMap<String, HealthState>>>,
    /// Cached aggregate, written under the component-status lock
    current: Arc<Mutex<HealthState>>,
    last_published: Arc<Mutex<Option<HealthState>>>,
    active: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor; the poll period is clamped to the admissible
    /// minimum of 100 ms.
    pub fn new(
        name: impl Into<String>,
        period: Duration,
        poller: StatusPoller,
        mapping: HealthMapping,
        callback: HealthCallback,
    ) -> Self {
        let min = Duration::from_millis(timing::MIN_POLL_PERIOD_MS);
        Self {
            name: name.into(),
            period: period.max(min),
            poller,
            mapping,
            callback,
            component_status: Arc::new(RwLock::new(HashMap::new())),
            current: Arc::new(Mutex::new(HealthState::Unknown)),
            last_published: Arc::new(Mutex::new(None)),
            active: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    /// Current aggregate health
    pub fn aggregate(&self) -> HealthState {
        *self.current.lock().unwrap()
    }

    /// Snapshot of the per-check verdict map
    pub async fn component_status(&self) -> HashMap<String, HealthState> {
        self.component_status.read().await.clone()
    }

    /// Start the poller task. Starting an already-running monitor is an
    /// error; use `stop` first.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.task.lock().unwrap();
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            bail!("health monitor {} already polling", self.name);
        }

        self.active.store(true, Ordering::SeqCst);
        let active = self.active.clone();
        let name = self.name.clone();
        let period = self.period;
        let poller = self.poller.clone();
        let mapping = self.mapping.clone();
        let callback = self.callback.clone();
        let component_status = self.component_status.clone();
        let current = self.current.clone();
        let last_published = self.last_published.clone();
        let stop_notify = self.stop_notify.clone();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            let mut memo = EdgeMemo::default();
            info!("health monitor {} polling every {:?}", name, period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_notify.notified() => {}
                }
                if !active.load(Ordering::SeqCst) {
                    break;
                }

                let verdicts = match (poller)().await {
                    Ok(report) => (mapping)(&report, &mut memo),
                    Err(reason) => {
                        warn!("health monitor {}: status poll failed: {}", name, reason);
                        let mut map = component_status.write().await;
                        map.insert(REGISTER_POLLING_EXCEPTION.into(), HealthState::Unknown);
                        let aggregate = aggregate_of(&map);
                        *current.lock().unwrap() = aggregate;
                        drop(map);
                        publish_if_changed(&last_published, aggregate, &callback);
                        // A failing back-end stops the poller
                        break;
                    }
                };

                let mut map = component_status.write().await;
                map.extend(verdicts);
                let aggregate = aggregate_of(&map);
                *current.lock().unwrap() = aggregate;
                drop(map);
                publish_if_changed(&last_published, aggregate, &callback);
            }

            info!("health monitor {} stopped", name);
        }));

        Ok(())
    }

    /// Stop the poller and wait for it to finish. Idempotent.
    pub async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// True while the poller task is running
    pub fn is_polling(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

fn publish_if_changed(
    last: &Mutex<Option<HealthState>>,
    aggregate: HealthState,
    callback: &HealthCallback,
) {
    let mut last = last.lock().unwrap();
    if *last == Some(aggregate) {
        return;
    }
    *last = Some(aggregate);
    callback(aggregate);
}
