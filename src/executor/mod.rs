//! Task executor
//!
//! A bounded, admission-controlled work queue with cooperative
//! cancellation. Commands are submitted as task records and return
//! immediately; a single worker runs them in submission order, couples
//! their lifecycle to the observation state model through hooks, and
//! reports progress through a strict callback protocol: at most one
//! `InProgress`, then exactly one terminal status.

use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};
use vcc_shared::{timing, ObsAction, ObsStateModel, ResultCode, TaskStatus};

/// Couples a task's lifecycle to state-model actions: `invoked` fires
/// before the work function, `completed` after success, `on_failure`
/// rewinds the model when the work function fails.
#[derive(Debug, Clone, Copy)]
pub struct Hook {
    pub invoked: ObsAction,
    pub completed: ObsAction,
    pub on_failure: ObsAction,
}

impl Hook {
    pub const CONFIGURE: Hook = Hook {
        invoked: ObsAction::ConfigureInvoked,
        completed: ObsAction::ConfigureCompleted,
        on_failure: ObsAction::GoToIdle,
    };
    pub const DECONFIGURE: Hook = Hook {
        invoked: ObsAction::DeconfigureInvoked,
        completed: ObsAction::DeconfigureCompleted,
        on_failure: ObsAction::GoToIdle,
    };
    pub const SCAN: Hook = Hook {
        invoked: ObsAction::ScanInvoked,
        completed: ObsAction::ScanCompleted,
        on_failure: ObsAction::ComponentFault,
    };
    pub const END_SCAN: Hook = Hook {
        invoked: ObsAction::EndScanInvoked,
        completed: ObsAction::EndScanCompleted,
        on_failure: ObsAction::ComponentFault,
    };
    pub const OBS_RESET: Hook = Hook {
        invoked: ObsAction::ObsResetInvoked,
        completed: ObsAction::ObsResetCompleted,
        on_failure: ObsAction::ComponentFault,
    };
}

/// Cooperative cancellation signal handed to every work function.
///
/// Long operations poll it at safe suspension points; the executor never
/// hard-kills a task.
#[derive(Clone)]
pub struct AbortSignal {
    own: Arc<AtomicBool>,
    global: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn is_set(&self) -> bool {
        self.own.load(Ordering::SeqCst) || self.global.load(Ordering::SeqCst)
    }
}

/// The work function of a task: runs with the task's callback handle and
/// abort signal, returns a result code and message.
pub type TaskWork =
    Box<dyn FnOnce(Arc<TaskHandle>, AbortSignal) -> BoxFuture<'static, (ResultCode, String)> + Send>;

/// A task as submitted by a device command
pub struct TaskRequest {
    pub name: String,
    pub hook: Option<Hook>,
    pub work: TaskWork,
}

/// One status update observed by subscribers
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
    /// Present on terminal updates only
    pub result: Option<(ResultCode, String)>,
}

/// Retained view of a task
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
    pub result: Option<(ResultCode, String)>,
}

struct RecordStore {
    records: HashMap<String, TaskRecord>,
    terminal_order: VecDeque<String>,
}

impl RecordStore {
    fn update(&mut self, update: &TaskUpdate) {
        let record = self
            .records
            .entry(update.task_id.clone())
            .or_insert_with(|| TaskRecord {
                task_id: update.task_id.clone(),
                name: update.name.clone(),
                status: update.status,
                result: None,
            });
        // A terminal status is final; a late non-terminal update must not
        // clobber it
        if record.status.is_terminal() {
            return;
        }
        record.status = update.status;
        if update.result.is_some() {
            record.result = update.result.clone();
        }

        // Terminal records are retained for late subscribers, bounded
        if update.status.is_terminal() {
            self.terminal_order.push_back(update.task_id.clone());
            while self.terminal_order.len() > timing::TASK_RETENTION {
                if let Some(oldest) = self.terminal_order.pop_front() {
                    self.records.remove(&oldest);
                }
            }
        }
    }
}

struct ExecutorShared {
    events: broadcast::Sender<TaskUpdate>,
    records: Mutex<RecordStore>,
    /// Tasks submitted but not yet terminal
    outstanding: AtomicU64,
    drained: Notify,
}

impl ExecutorShared {
    fn publish(&self, update: TaskUpdate) {
        self.records.lock().unwrap().update(&update);
        let _ = self.events.send(update);
    }

    fn task_done(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Per-task callback handle enforcing the status protocol
pub struct TaskHandle {
    task_id: String,
    name: String,
    shared: Arc<ExecutorShared>,
    in_progress_sent: AtomicBool,
    terminal_sent: AtomicBool,
}

impl TaskHandle {
    /// Emit the single `InProgress` update; later calls are discarded
    pub fn in_progress(&self) {
        if self.in_progress_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.publish(TaskUpdate {
            task_id: self.task_id.clone(),
            name: self.name.clone(),
            status: TaskStatus::InProgress,
            result: None,
        });
    }

    /// Emit the single terminal update; re-entrant calls are discarded
    pub fn terminal(&self, status: TaskStatus, code: ResultCode, message: impl Into<String>) {
        debug_assert!(status.is_terminal());
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.publish(TaskUpdate {
            task_id: self.task_id.clone(),
            name: self.name.clone(),
            status,
            result: Some((code, message.into())),
        });
        self.shared.task_done();
    }

    fn queued(&self) {
        self.shared.publish(TaskUpdate {
            task_id: self.task_id.clone(),
            name: self.name.clone(),
            status: TaskStatus::Queued,
            result: None,
        });
    }
}

struct QueuedTask {
    handle: Arc<TaskHandle>,
    hook: Option<Hook>,
    work: TaskWork,
    abort: AbortSignal,
}

/// Admission predicate consulted by the worker before a task runs
pub type AdmissionPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Bounded task executor bound to one observation state model
pub struct TaskExecutor {
    tx: mpsc::Sender<QueuedTask>,
    shared: Arc<ExecutorShared>,
    model: Arc<ObsStateModel>,
    global_abort: Arc<AtomicBool>,
    admission_closed: AtomicBool,
    task_counter: AtomicU64,
}

impl TaskExecutor {
    /// Executor with the default queue depth and an always-allow predicate
    pub fn new(model: Arc<ObsStateModel>) -> Self {
        Self::with_capacity(model, timing::TASK_QUEUE_DEPTH, Arc::new(|_| true))
    }

    /// Executor with an explicit queue depth and admission predicate;
    /// spawns the single worker task.
    pub fn with_capacity(
        model: Arc<ObsStateModel>,
        capacity: usize,
        predicate: AdmissionPredicate,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(ExecutorShared {
            events,
            records: Mutex::new(RecordStore {
                records: HashMap::new(),
                terminal_order: VecDeque::new(),
            }),
            outstanding: AtomicU64::new(0),
            drained: Notify::new(),
        });

        tokio::spawn(worker_loop(rx, model.clone(), predicate));

        Self {
            tx,
            shared,
            model,
            global_abort: Arc::new(AtomicBool::new(false)),
            admission_closed: AtomicBool::new(false),
            task_counter: AtomicU64::new(0),
        }
    }

    /// Subscribe to all task status updates
    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdate> {
        self.shared.events.subscribe()
    }

    /// Retained record for a task, if still within the retention window
    pub fn record(&self, task_id: &str) -> Option<TaskRecord> {
        self.shared.records.lock().unwrap().records.get(task_id).cloned()
    }

    /// Tasks submitted but not yet terminal
    pub fn outstanding(&self) -> u64 {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Submit a task; returns its id, or (code, message) on refusal
    pub fn submit(&self, request: TaskRequest) -> Result<String, (ResultCode, String)> {
        self.submit_inner(request, false)
    }

    /// Submission path for ObsReset, which alone may pass the closed
    /// admission gate after an abort
    pub fn submit_privileged(&self, request: TaskRequest) -> Result<String, (ResultCode, String)> {
        self.submit_inner(request, true)
    }

    fn submit_inner(
        &self,
        request: TaskRequest,
        privileged: bool,
    ) -> Result<String, (ResultCode, String)> {
        if !privileged && self.admission_closed.load(Ordering::SeqCst) {
            return Err((
                ResultCode::NotAllowed,
                "device is aborting; only ObsReset is admitted".into(),
            ));
        }

        let n = self.task_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let task_id = format!("task-{}", n);
        let handle = Arc::new(TaskHandle {
            task_id: task_id.clone(),
            name: request.name,
            shared: self.shared.clone(),
            in_progress_sent: AtomicBool::new(false),
            terminal_sent: AtomicBool::new(false),
        });
        // A privileged task runs during an abort and must not observe the
        // broadcast flag that stops everything else
        let abort = AbortSignal {
            own: Arc::new(AtomicBool::new(false)),
            global: if privileged {
                Arc::new(AtomicBool::new(false))
            } else {
                self.global_abort.clone()
            },
        };
        let queued = QueuedTask {
            handle: handle.clone(),
            hook: request.hook,
            work: request.work,
            abort,
        };

        // Queued must be published before the worker can see the task, or
        // a fast task's InProgress could reach subscribers first
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        handle.queued();
        match self.tx.try_send(queued) {
            Ok(()) => Ok(task_id),
            Err(mpsc::error::TrySendError::Full(_)) => {
                handle.terminal(
                    TaskStatus::Rejected,
                    ResultCode::Rejected,
                    "task queue is full",
                );
                Err((ResultCode::Rejected, "task queue is full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                handle.terminal(
                    TaskStatus::Failed,
                    ResultCode::Failed,
                    "executor worker has stopped",
                );
                Err((ResultCode::Failed, "executor worker has stopped".into()))
            }
        }
    }

    /// Set the broadcast abort flag and close admission, without touching
    /// the state model or waiting for anything
    pub fn signal_abort(&self) {
        self.admission_closed.store(true, Ordering::SeqCst);
        self.global_abort.store(true, Ordering::SeqCst);
    }

    /// Wait until at most `remaining` tasks are outstanding. Returns false
    /// if the bound expired first.
    async fn drain_to(&self, remaining: u64) -> bool {
        let drained = async {
            loop {
                let notified = self.shared.drained.notified();
                if self.shared.outstanding.load(Ordering::SeqCst) <= remaining {
                    break;
                }
                notified.await;
            }
        };
        let bound = Duration::from_millis(timing::OBS_RESET_WAIT_TIMEOUT_MS);
        if tokio::time::timeout(bound, drained).await.is_err() {
            warn!("abort: outstanding tasks did not drain within {:?}", bound);
            return false;
        }
        true
    }

    /// Wait until every outstanding task is terminal. Returns false if the
    /// bound expired first.
    pub async fn drain(&self) -> bool {
        self.drain_to(0).await
    }

    /// Wait until every task except the caller's own is terminal; used by
    /// the privileged ObsReset task while it occupies the worker
    pub async fn drain_others(&self) -> bool {
        self.drain_to(1).await
    }

    /// Abort every outstanding task and close admission.
    ///
    /// Sets the broadcast abort flag, drives the model through
    /// `AbortInvoked` → `AbortCompleted`, and waits (bounded) for every
    /// outstanding task to reach a terminal status. Tasks that already
    /// started keep running to their next poll point.
    pub async fn abort_all(&self) {
        self.signal_abort();

        if self.model.is_action_allowed(ObsAction::AbortInvoked) {
            let _ = self.model.apply(ObsAction::AbortInvoked);
        }

        self.drain().await;

        if self.model.is_action_allowed(ObsAction::AbortCompleted) {
            let _ = self.model.apply(ObsAction::AbortCompleted);
        }
        info!("abort: all outstanding tasks signalled, admission closed");
    }

    /// Re-open admission after a completed ObsReset
    pub fn reset_admission(&self) {
        self.global_abort.store(false, Ordering::SeqCst);
        self.admission_closed.store(false, Ordering::SeqCst);
    }
}

/// The single worker: dequeues in submission order, gates on admissibility,
/// fires hooks and runs the work function.
async fn worker_loop(
    mut rx: mpsc::Receiver<QueuedTask>,
    model: Arc<ObsStateModel>,
    predicate: AdmissionPredicate,
) {
    while let Some(task) = rx.recv().await {
        let handle = task.handle;

        if task.abort.is_set() {
            handle.terminal(
                TaskStatus::Aborted,
                ResultCode::Aborted,
                "task aborted before start",
            );
            continue;
        }

        if !predicate(&handle.name) {
            handle.terminal(
                TaskStatus::NotAllowed,
                ResultCode::NotAllowed,
                format!("command {} is not allowed", handle.name),
            );
            continue;
        }

        if let Some(hook) = task.hook {
            if let Err(e) = model.apply(hook.invoked) {
                handle.terminal(TaskStatus::NotAllowed, ResultCode::NotAllowed, e.to_string());
                continue;
            }
        }

        handle.in_progress();
        let (code, message) = (task.work)(handle.clone(), task.abort.clone()).await;
        debug!("task {} finished: {:?} {}", handle.task_id, code, message);

        match code {
            ResultCode::Ok => {
                if let Some(hook) = task.hook {
                    if let Err(e) = model.apply(hook.completed) {
                        warn!("task {}: {}", handle.task_id, e);
                    }
                }
                handle.terminal(TaskStatus::Completed, ResultCode::Ok, message);
            }
            ResultCode::Aborted => {
                // The abort path drives the model; no hook fires here
                handle.terminal(TaskStatus::Aborted, ResultCode::Aborted, message);
            }
            ResultCode::Rejected => {
                rewind(&model, task.hook, &handle);
                handle.terminal(TaskStatus::Rejected, ResultCode::Rejected, message);
            }
            ResultCode::NotAllowed => {
                rewind(&model, task.hook, &handle);
                handle.terminal(TaskStatus::NotAllowed, ResultCode::NotAllowed, message);
            }
            other => {
                rewind(&model, task.hook, &handle);
                handle.terminal(TaskStatus::Failed, other, message);
            }
        }
    }
}

fn rewind(model: &ObsStateModel, hook: Option<Hook>, handle: &TaskHandle) {
    if let Some(hook) = hook {
        if let Err(e) = model.apply(hook.on_failure) {
            warn!("task {} rewind: {}", handle.task_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcc_shared::ObsState;

    fn ready_task(code: ResultCode, message: &str) -> TaskRequest {
        let message = message.to_string();
        TaskRequest {
            name: "configure".into(),
            hook: None,
            work: Box::new(move |_, _| Box::pin(async move { (code, message) })),
        }
    }

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

    #[tokio::test]
    async fn test_callback_sequence_happy_path() {
        let model = Arc::new(ObsStateModel::new());
        let executor = TaskExecutor::new(model);
        let mut rx = executor.subscribe();

        let id = executor.submit(ready_task(ResultCode::Ok, "done")).unwrap();

        let mut statuses = Vec::new();
        loop {
            let update = rx.recv().await.unwrap();
            if update.task_id != id {
                continue;
            }
            statuses.push(update.status);
            if update.status.is_terminal() {
                assert_eq!(update.result, Some((ResultCode::Ok, "done".into())));
                break;
            }
        }
        assert_eq!(
            statuses,
            vec![TaskStatus::Queued, TaskStatus::InProgress, TaskStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_hook_drives_state_model() {
        let model = Arc::new(ObsStateModel::new());
        let executor = TaskExecutor::new(model.clone());
        let mut rx = executor.subscribe();

        let id = executor
            .submit(TaskRequest {
                name: "configure".into(),
                hook: Some(Hook::CONFIGURE),
                work: Box::new(|_, _| Box::pin(async { (ResultCode::Ok, "configured".into()) })),
            })
            .unwrap();

        let update = wait_terminal(&mut rx, &id).await;
        assert_eq!(update.status, TaskStatus::Completed);
        assert_eq!(model.state(), ObsState::Ready);
    }

    #[tokio::test]
    async fn test_failed_configure_rewinds_to_idle() {
        let model = Arc::new(ObsStateModel::new());
        let executor = TaskExecutor::new(model.clone());
        let mut rx = executor.subscribe();

        let id = executor
            .submit(TaskRequest {
                name: "configure".into(),
                hook: Some(Hook::CONFIGURE),
                work: Box::new(|_, _| {
                    Box::pin(async { (ResultCode::Failed, "backend failure".into()) })
                }),
            })
            .unwrap();

        let update = wait_terminal(&mut rx, &id).await;
        assert_eq!(update.status, TaskStatus::Failed);
        assert_eq!(model.state(), ObsState::Idle);
    }

    #[tokio::test]
    async fn test_inadmissible_hook_reports_not_allowed() {
        let model = Arc::new(ObsStateModel::with_state(ObsState::Scanning));
        let executor = TaskExecutor::new(model.clone());
        let mut rx = executor.subscribe();

        let id = executor
            .submit(TaskRequest {
                name: "configure".into(),
                hook: Some(Hook::CONFIGURE),
                work: Box::new(|_, _| Box::pin(async { (ResultCode::Ok, String::new()) })),
            })
            .unwrap();

        let update = wait_terminal(&mut rx, &id).await;
        assert_eq!(update.status, TaskStatus::NotAllowed);
        assert_eq!(model.state(), ObsState::Scanning);
    }

    #[tokio::test]
    async fn test_full_queue_rejected() {
        let model = Arc::new(ObsStateModel::new());
        let executor = TaskExecutor::with_capacity(model.clone(), 1, Arc::new(|_| true));

        // Block the worker so queued tasks pile up
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let gate_rx = Arc::new(tokio::sync::Mutex::new(Some(gate_rx)));
        executor
            .submit(TaskRequest {
                name: "blocker".into(),
                hook: None,
                work: Box::new(move |_, _| {
                    Box::pin(async move {
                        let rx = gate_rx.lock().await.take().unwrap();
                        let _ = rx.await;
                        (ResultCode::Ok, String::new())
                    })
                }),
            })
            .unwrap();

        // Give the worker a moment to pick up the blocker, then fill the queue
        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.submit(ready_task(ResultCode::Ok, "queued")).unwrap();

        let err = executor
            .submit(ready_task(ResultCode::Ok, "overflow"))
            .unwrap_err();
        assert_eq!(err.0, ResultCode::Rejected);
        assert_eq!(model.state(), ObsState::Idle);

        let _ = gate_tx.send(());
    }

    #[tokio::test]
    async fn test_abort_all_aborts_in_flight_and_queued() {
        let model = Arc::new(ObsStateModel::with_state(ObsState::Ready));
        let executor = TaskExecutor::new(model.clone());
        let mut rx = executor.subscribe();

        // Long task polling its abort signal
        let long_id = executor
            .submit(TaskRequest {
                name: "scan".into(),
                hook: None,
                work: Box::new(|_, abort| {
                    Box::pin(async move {
                        loop {
                            if abort.is_set() {
                                return (ResultCode::Aborted, "scan aborted".into());
                            }
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    })
                }),
            })
            .unwrap();
        let queued_id = executor.submit(ready_task(ResultCode::Ok, "late")).unwrap();

        executor.abort_all().await;
        assert_eq!(model.state(), ObsState::Aborted);

        let long = wait_terminal(&mut rx, &long_id).await;
        assert_eq!(long.status, TaskStatus::Aborted);
        let queued = wait_terminal(&mut rx, &queued_id).await;
        assert_eq!(queued.status, TaskStatus::Aborted);

        // Admission stays closed until reset
        let err = executor.submit(ready_task(ResultCode::Ok, "x")).unwrap_err();
        assert_eq!(err.0, ResultCode::NotAllowed);
        executor.reset_admission();
        assert!(executor.submit(ready_task(ResultCode::Ok, "x")).is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_terminal_discarded() {
        let model = Arc::new(ObsStateModel::new());
        let executor = TaskExecutor::new(model);
        let mut rx = executor.subscribe();

        let id = executor
            .submit(TaskRequest {
                name: "recover".into(),
                hook: None,
                work: Box::new(|handle, _| {
                    Box::pin(async move {
                        handle.terminal(TaskStatus::Failed, ResultCode::Failed, "first");
                        // The worker's own terminal for the returned code
                        // must be discarded
                        (ResultCode::Ok, "second".into())
                    })
                }),
            })
            .unwrap();

        let update = wait_terminal(&mut rx, &id).await;
        assert_eq!(update.status, TaskStatus::Failed);
        assert_eq!(update.result, Some((ResultCode::Failed, "first".into())));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_submission_order_preserved() {
        let model = Arc::new(ObsStateModel::new());
        let executor = TaskExecutor::new(model);
        let mut rx = executor.subscribe();

        let ids: Vec<String> = (0..5)
            .map(|i| executor.submit(ready_task(ResultCode::Ok, &format!("t{}", i))).unwrap())
            .collect();

        let mut completed = Vec::new();
        while completed.len() < ids.len() {
            let update = rx.recv().await.unwrap();
            if update.status == TaskStatus::Completed {
                completed.push(update.task_id);
            }
        }
        assert_eq!(completed, ids);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_precedes_worker_updates() {
        let model = Arc::new(ObsStateModel::new());
        let executor = TaskExecutor::new(model);

        // A fast task races the worker against the submitting thread; the
        // Queued event must still come first every time
        for _ in 0..50 {
            let mut rx = executor.subscribe();
            let id = executor.submit(ready_task(ResultCode::Ok, "fast")).unwrap();

            let mut statuses = Vec::new();
            loop {
                let update = rx.recv().await.unwrap();
                if update.task_id != id {
                    continue;
                }
                statuses.push(update.status);
                if update.status.is_terminal() {
                    break;
                }
            }
            assert_eq!(
                statuses.first(),
                Some(&TaskStatus::Queued),
                "observed {:?}",
                statuses
            );
            let record = executor.record(&id).unwrap();
            assert!(record.status.is_terminal());
        }
    }

    #[test]
    fn test_terminal_record_is_sticky() {
        let mut store = RecordStore {
            records: HashMap::new(),
            terminal_order: VecDeque::new(),
        };
        store.update(&TaskUpdate {
            task_id: "task-1".into(),
            name: "configure".into(),
            status: TaskStatus::Completed,
            result: Some((ResultCode::Ok, "done".into())),
        });
        store.update(&TaskUpdate {
            task_id: "task-1".into(),
            name: "configure".into(),
            status: TaskStatus::Queued,
            result: None,
        });

        let record = store.records.get("task-1").unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some((ResultCode::Ok, "done".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_bound_expires_with_uncooperative_task() {
        let model = Arc::new(ObsStateModel::with_state(ObsState::Ready));
        let executor = TaskExecutor::new(model);

        // Never checks its abort signal
        executor
            .submit(TaskRequest {
                name: "scan".into(),
                hook: None,
                work: Box::new(|_, _| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        (ResultCode::Ok, String::new())
                    })
                }),
            })
            .unwrap();
        executor.submit(ready_task(ResultCode::Ok, "queued")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        executor.signal_abort();
        // Two tasks outstanding and neither can finish before the bound
        assert!(!executor.drain_others().await);
        assert_eq!(executor.outstanding(), 2);
    }

    #[tokio::test]
    async fn test_failed_obs_reset_faults_model() {
        let model = Arc::new(ObsStateModel::with_state(ObsState::Aborted));
        let executor = TaskExecutor::new(model.clone());
        let mut rx = executor.subscribe();
        executor.signal_abort();

        let id = executor
            .submit_privileged(TaskRequest {
                name: "obs_reset".into(),
                hook: Some(Hook::OBS_RESET),
                work: Box::new(|_, _| {
                    Box::pin(async {
                        (
                            ResultCode::Failed,
                            "outstanding tasks did not drain within the reset bound".into(),
                        )
                    })
                }),
            })
            .unwrap();

        let update = wait_terminal(&mut rx, &id).await;
        assert_eq!(update.status, TaskStatus::Failed);
        assert!(update.result.unwrap().1.contains("drain"));
        assert_eq!(model.state(), ObsState::Fault);
    }

    #[tokio::test]
    async fn test_record_retention() {
        let model = Arc::new(ObsStateModel::new());
        let executor = TaskExecutor::new(model);
        let mut rx = executor.subscribe();

        let id = executor.submit(ready_task(ResultCode::Ok, "done")).unwrap();
        let _ = wait_terminal(&mut rx, &id).await;

        let record = executor.record(&id).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some((ResultCode::Ok, "done".into())));
    }
}
