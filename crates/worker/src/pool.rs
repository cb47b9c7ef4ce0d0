use anyhow::{Context, Result};
use browserpool_common::{GeoProvider, RunOptions, TaskError, TaskStatus, TaskTiming};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::options::{self, SessionOptions};
use crate::script;
use crate::session::{ActiveSessions, SessionHandle};
use crate::stats::Stats;
use crate::stealth::{self, StealthApplier};

const DISPATCH_TICK: Duration = Duration::from_millis(10);

/// Result sink for one task. Invoked exactly once per dequeue.
pub type TaskCallback = Box<dyn FnOnce(TaskStatus, Value, TaskTiming) + Send + 'static>;

type ExecOutcome = Result<Value, (TaskError, Option<String>)>;

/// One queued unit of work: immutable script, options and callback plus
/// mutable lifecycle timestamps.
pub struct Task {
    pub id: Uuid,
    script: String,
    options: SessionOptions,
    callback: TaskCallback,
    timing: TaskTiming,
}

impl Task {
    fn new(script: String, callback: TaskCallback, options: SessionOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            script,
            options,
            callback,
            timing: TaskTiming::new(),
        }
    }
}

struct BrowserHandle {
    browser: Arc<Browser>,
    // Cleared by the handler task when its event stream ends, which is how
    // the driver signals a dead browser process.
    alive: Arc<AtomicBool>,
    handler_task: JoinHandle<()>,
}

struct PoolInner {
    run: RunOptions,
    geo: Box<dyn GeoProvider>,
    stats: Stats,
    stealth: StealthApplier,
    max_workers: usize,
    queue: Mutex<VecDeque<Task>>,
    active: ActiveSessions,
    browser: tokio::sync::RwLock<Option<BrowserHandle>>,
    launch_in_flight: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    fatal: AtomicBool,
    shutdown: CancellationToken,
}

/// Owns the shared browser process, the FIFO task queue and the dispatch
/// loop; executes each task's script inside a fresh stealth-hardened
/// session with a hard timeout and recovers from a dead browser without
/// dropping queued work.
#[derive(Clone)]
pub struct BrowserWorkerPool {
    inner: Arc<PoolInner>,
}

/// `ceil(workers_per_cpu * cpus)`, floored at one slot.
pub fn worker_ceiling(workers_per_cpu: f64, cpus: usize) -> usize {
    let ceiling = (workers_per_cpu * cpus as f64).ceil() as usize;
    ceiling.max(1)
}

impl BrowserWorkerPool {
    /// Construction registers the Stats view of the active-sessions
    /// registry and computes the worker ceiling. The browser is launched
    /// separately via [`launch_browser`](Self::launch_browser) so the
    /// embedding host can surface a failed launch as a startup error.
    pub fn new(
        stats: Stats,
        run: RunOptions,
        geo: Box<dyn GeoProvider>,
        shutdown: CancellationToken,
    ) -> Self {
        let max_workers = worker_ceiling(run.workers_per_cpu, num_cpus::get());
        let active: ActiveSessions = Arc::new(RwLock::new(Vec::new()));
        stats.register_active_sessions(active.clone());

        info!(
            max_workers,
            workers_per_cpu = run.workers_per_cpu,
            timeout_ms = run.max_task_timeout.as_millis() as u64,
            "browser worker pool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                run,
                geo,
                stats,
                stealth: StealthApplier::new(),
                max_workers,
                queue: Mutex::new(VecDeque::new()),
                active,
                browser: tokio::sync::RwLock::new(None),
                launch_in_flight: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
                fatal: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Enqueue a task. FIFO relative to other tasks; completion order is
    /// not guaranteed once tasks run concurrently.
    pub fn add_task(
        &self,
        script: impl Into<String>,
        callback: TaskCallback,
        options: Option<SessionOptions>,
    ) -> Uuid {
        let task = Task::new(script.into(), callback, options.unwrap_or_default());
        let id = task.id;
        self.inner.stats.add_submitted();
        lock_recover(&self.inner.queue).push_back(task);
        debug!(task_id = %id, "task queued");
        id
    }

    pub fn queue_length(&self) -> usize {
        lock_recover(&self.inner.queue).len()
    }

    pub fn active_count(&self) -> usize {
        read_recover(&self.inner.active).len()
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    pub fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    /// True once the pool hit its unrecoverable path (browser relaunch
    /// failed) and drained the queue with fatal errors.
    pub fn is_fatal(&self) -> bool {
        self.inner.fatal.load(Ordering::SeqCst)
    }

    /// Launch the shared browser process. A failure here is the one
    /// unconditionally fatal path; the caller is expected to propagate it
    /// and terminate.
    pub async fn launch_browser(&self) -> Result<()> {
        if self
            .inner
            .launch_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.launch_browser_inner().await;
        self.inner.launch_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn launch_browser_inner(&self) -> Result<()> {
        let config = build_browser_config(&self.inner.run)
            .map_err(|e| anyhow::anyhow!("browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch browser process")?;

        let alive = Arc::new(AtomicBool::new(true));
        let alive_flag = alive.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    let msg = e.to_string();
                    // Chrome emits CDP events newer than the protocol
                    // definitions; those deserialization misses are noise.
                    let benign = msg
                        .contains("data did not match any variant of untagged enum Message")
                        || msg.contains("Failed to deserialize WS response");
                    if benign {
                        tracing::trace!(error = %msg, "suppressed benign handler error");
                    } else {
                        warn!(error = %msg, "browser handler error");
                    }
                }
            }
            alive_flag.store(false, Ordering::SeqCst);
            info!("browser handler stream ended");
        });

        let mut slot = self.inner.browser.write().await;
        if let Some(old) = slot.take() {
            old.handler_task.abort();
        }
        *slot = Some(BrowserHandle {
            browser: Arc::new(browser),
            alive,
            handler_task,
        });

        info!("browser process launched");
        Ok(())
    }

    /// Start the dispatch loop: a 10ms tick admitting at most one task per
    /// tick while a slot is free and the browser is alive. Admission rate
    /// is throttled by tick frequency on purpose, to bound the burst
    /// session-creation rate.
    pub fn run_task_manager(&self) {
        let pool = self.clone();
        let handle = tokio::spawn(async move {
            info!("task manager running");
            let mut tick = tokio::time::interval(DISPATCH_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = pool.inner.shutdown.cancelled() => {
                        info!("task manager stopped");
                        break;
                    }
                    _ = tick.tick() => pool.on_tick().await,
                }
            }
        });
        *lock_recover_opt(&self.inner.dispatcher) = Some(handle);
    }

    /// Stop the dispatch loop without settling queued tasks.
    pub fn stop_task_manager(&self) {
        if let Some(handle) = lock_recover_opt(&self.inner.dispatcher).take() {
            handle.abort();
        }
    }

    async fn on_tick(&self) {
        let browser = {
            let guard = self.inner.browser.read().await;
            guard
                .as_ref()
                .map(|h| (h.browser.clone(), h.alive.clone()))
        };

        let browser = match browser {
            Some((browser, alive)) if alive.load(Ordering::SeqCst) => browser,
            Some(_) => {
                warn!("browser is dead, relaunching");
                self.trigger_relaunch();
                return;
            }
            None => {
                // Initial launch still pending or failed; relaunch is
                // flag-guarded so this is a no-op while one is in flight.
                self.trigger_relaunch();
                return;
            }
        };

        // Admission: ceiling check, dequeue and registry insert happen
        // with no await in between, so the ceiling can never be overshot
        // by a concurrent tick.
        let task = {
            if read_recover(&self.inner.active).len() >= self.inner.max_workers {
                None
            } else {
                lock_recover(&self.inner.queue).pop_front()
            }
        };
        let Some(mut task) = task else {
            return;
        };

        // Pre-flight syntax check; a rejected script settles immediately
        // and never consumes a session slot.
        if let Err(err) = script::check_syntax(&task.script) {
            task.timing.mark_started();
            task.timing.mark_completed();
            self.inner.stats.add_fail(&task.timing);
            debug!(task_id = %task.id, "script rejected by pre-flight check");
            let Task {
                callback, timing, ..
            } = task;
            callback(TaskStatus::Fail, fail_payload(&err, None), timing);
            return;
        }

        task.timing.mark_started();
        let handle = Arc::new(SessionHandle::new());
        write_recover(&self.inner.active).push(handle.clone());

        let pool = self.clone();
        tokio::spawn(async move {
            pool.run_task(task, handle, browser).await;
        });
    }

    async fn run_task(&self, task: Task, handle: Arc<SessionHandle>, browser: Arc<Browser>) {
        let outcome = self
            .execute_task(task.id, &task.script, &task.options, &handle, &browser)
            .await;

        handle.close().await;
        if let Some(context_id) = handle.take_context_id() {
            if let Err(e) = browser
                .execute(DisposeBrowserContextParams::new(context_id))
                .await
            {
                debug!(task_id = %task.id, error = %e, "context disposal failed");
            }
        }
        self.remove_session(&handle);

        if self.settle(task, outcome) {
            self.trigger_relaunch();
        }
    }

    /// Settle one finished attempt: fire the callback with the outcome, or
    /// requeue when the browser died mid-flight. Returns true when the task
    /// was requeued; the callback has not fired then and the caller is
    /// expected to trigger a relaunch.
    fn settle(&self, mut task: Task, outcome: ExecOutcome) -> bool {
        match outcome {
            Err((err, _)) if err.is_retryable() => {
                // Not a task failure: requeue the task untouched and bring
                // up a new browser. The caller's callback fires later with
                // the real outcome.
                warn!(task_id = %task.id, "browser gone mid-task, requeueing");
                task.timing.started_at = None;
                lock_recover(&self.inner.queue).push_back(task);
                true
            }
            Ok(value) => {
                task.timing.mark_completed();
                self.inner.stats.add_success(&task.timing);
                debug!(task_id = %task.id, "task done");
                let Task {
                    callback, timing, ..
                } = task;
                callback(TaskStatus::Done, value, timing);
                false
            }
            Err((err, stack)) => {
                task.timing.mark_completed();
                match err {
                    TaskError::Timeout => self.inner.stats.add_timeout(&task.timing),
                    _ => self.inner.stats.add_fail(&task.timing),
                }
                debug!(task_id = %task.id, kind = err.kind(), "task failed");
                let Task {
                    callback, timing, ..
                } = task;
                callback(TaskStatus::Fail, fail_payload(&err, stack.as_deref()), timing);
                false
            }
        }
    }

    async fn execute_task(
        &self,
        task_id: Uuid,
        script_text: &str,
        options: &SessionOptions,
        handle: &Arc<SessionHandle>,
        browser: &Browser,
    ) -> ExecOutcome {
        let resolved = options::resolve(options, &self.inner.run, self.inner.geo.as_ref()).await;

        // Fresh browser context per task: own cookie jar and storage,
        // disposed when the task settles.
        let context_id = match browser.execute(CreateBrowserContextParams::default()).await {
            Ok(resp) => resp.result.browser_context_id,
            Err(e) => return Err(script::classify_cdp_error(&e)),
        };
        handle.set_context_id(context_id.clone());

        let params = match session_page_params(&context_id) {
            Ok(params) => params,
            Err(e) => {
                return Err((
                    TaskError::Infrastructure {
                        message: e,
                        retryable: false,
                    },
                    None,
                ))
            }
        };
        let page = match browser.new_page(params).await {
            Ok(page) => page,
            Err(e) => return Err(script::classify_cdp_error(&e)),
        };
        handle.attach_page(page.clone()).await;

        if let Err(e) = stealth::prepare_session(&page, &resolved).await {
            let msg = e.to_string();
            if browserpool_common::is_browser_gone_error(&msg) {
                return Err((
                    TaskError::Infrastructure {
                        message: msg,
                        retryable: true,
                    },
                    None,
                ));
            }
            // Overrides are best-effort; the script can still run.
            warn!(task_id = %task_id, error = %msg, "session overrides failed");
        }

        self.inner.stealth.apply(&page, &resolved).await;

        let wrapped = script::wrap_script(script_text);
        // First settled wins. The losing evaluation keeps running in the
        // browser until the session is closed, which is the real stop
        // mechanism.
        tokio::select! {
            _ = tokio::time::sleep(self.inner.run.max_task_timeout) => {
                Err((TaskError::Timeout, None))
            }
            result = page.evaluate(wrapped) => match result {
                Ok(evaluation) => {
                    let value = evaluation.value().cloned().unwrap_or(Value::Null);
                    Ok(script::coerce_result(value))
                }
                Err(e) => Err(script::classify_cdp_error(&e)),
            }
        }
    }

    fn remove_session(&self, handle: &Arc<SessionHandle>) {
        write_recover(&self.inner.active).retain(|s| s.id() != handle.id());
    }

    fn trigger_relaunch(&self) {
        if self
            .inner
            .launch_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            let result = pool.launch_browser_inner().await;
            pool.inner.launch_in_flight.store(false, Ordering::SeqCst);
            if let Err(e) = result {
                error!(error = %e, "browser relaunch failed, shutting down");
                pool.fatal_shutdown();
            }
        });
    }

    /// Unrecoverable path: force-fail every queued task with a fatal
    /// payload and cancel the worker.
    fn fatal_shutdown(&self) {
        self.inner.fatal.store(true, Ordering::SeqCst);
        self.fail_queued_tasks();
        self.inner.shutdown.cancel();
    }

    /// Drain the queue, settling every not-yet-dispatched task with a
    /// fatal error. Used on shutdown; the one path where queued tasks are
    /// deliberately abandoned instead of retried.
    pub fn fail_queued_tasks(&self) {
        let drained: Vec<Task> = lock_recover(&self.inner.queue).drain(..).collect();
        if drained.is_empty() {
            return;
        }
        warn!(count = drained.len(), "failing queued tasks");
        for mut task in drained {
            task.timing.mark_completed();
            self.inner.stats.add_fail(&task.timing);
            let Task {
                callback, timing, ..
            } = task;
            callback(TaskStatus::Fail, fail_payload(&TaskError::Fatal, None), timing);
        }
    }

    /// Stop dispatching, drain the queue and drop the browser handle.
    /// Dropping the last handle kills the child process.
    pub async fn close(&self) {
        self.stop_task_manager();
        self.fail_queued_tasks();
        let mut slot = self.inner.browser.write().await;
        if let Some(handle) = slot.take() {
            handle.handler_task.abort();
            drop(handle.browser);
        }
        info!("browser worker pool closed");
    }
}

/// Structured FAIL payload: classified kind, string form, stack or
/// placeholder.
pub fn fail_payload(error: &TaskError, stack: Option<&str>) -> Value {
    json!({
        "error": error.kind(),
        "log": error.to_string(),
        "stack": stack.unwrap_or("Not available"),
    })
}

fn build_browser_config(
    run: &RunOptions,
) -> std::result::Result<chromiumoxide::browser::BrowserConfig, String> {
    let mut builder = BrowserConfigBuilder::default()
        .request_timeout(run.launch.launch_timeout)
        .window_size(
            options::DEFAULT_VIEWPORT_WIDTH,
            options::DEFAULT_VIEWPORT_HEIGHT,
        );

    builder = if run.launch.headless {
        builder.headless_mode(HeadlessMode::default())
    } else {
        builder.with_head()
    };

    if let Some(path) = &run.launch.executable {
        builder = builder.chrome_executable(path);
    }

    for arg in default_launch_args(run.launch.disable_sandbox) {
        builder = builder.arg(arg);
    }

    if let Some(proxy) = &run.launch.proxy {
        builder = builder.arg(format!("--proxy-server={}", proxy.server_for_browser()));
        if let Some(bypass) = &proxy.bypass {
            if !bypass.is_empty() {
                builder = builder.arg(format!("--proxy-bypass-list={bypass}"));
            }
        }
    }

    if let Some(user_agent) = &run.user_agent {
        builder = builder.arg(format!("--user-agent={user_agent}"));
    }

    for arg in &run.launch.args {
        builder = builder.arg(arg);
    }

    builder.build()
}

/// Page-creation params for one task's session, pinned to its own browser
/// context.
fn session_page_params(
    context_id: &BrowserContextId,
) -> std::result::Result<CreateTargetParams, String> {
    CreateTargetParams::builder()
        .url("about:blank")
        .browser_context_id(context_id.clone())
        .build()
}

fn default_launch_args(disable_sandbox: bool) -> Vec<&'static str> {
    let mut args = vec![
        "--disable-blink-features=AutomationControlled",
        "--disable-infobars",
        "--disable-notifications",
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-backgrounding-occluded-windows",
        "--disable-breakpad",
        "--disable-hang-monitor",
        "--disable-ipc-flooding-protection",
        "--disable-prompt-on-repost",
        "--metrics-recording-only",
        "--password-store=basic",
        "--use-mock-keychain",
        "--hide-scrollbars",
        "--mute-audio",
    ];

    // setuid sandboxing does not work inside containers
    if disable_sandbox {
        args.push("--no-sandbox");
        args.push("--disable-setuid-sandbox");
        args.push("--disable-dev-shm-usage");
    }

    args
}

fn lock_recover<T>(mutex: &Mutex<VecDeque<T>>) -> std::sync::MutexGuard<'_, VecDeque<T>> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn lock_recover_opt<T>(mutex: &Mutex<Option<T>>) -> std::sync::MutexGuard<'_, Option<T>> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read_recover<T>(lock: &RwLock<Vec<T>>) -> std::sync::RwLockReadGuard<'_, Vec<T>> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_recover<T>(lock: &RwLock<Vec<T>>) -> std::sync::RwLockWriteGuard<'_, Vec<T>> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use browserpool_common::NoGeoProvider;
    use std::sync::mpsc;

    fn test_pool() -> BrowserWorkerPool {
        BrowserWorkerPool::new(
            Stats::new(),
            RunOptions::default(),
            Box::new(NoGeoProvider),
            CancellationToken::new(),
        )
    }

    #[test]
    fn ceiling_math() {
        assert_eq!(worker_ceiling(1.0, 4), 4);
        assert_eq!(worker_ceiling(1.5, 4), 6);
        assert_eq!(worker_ceiling(0.5, 3), 2);
        assert_eq!(worker_ceiling(0.1, 1), 1);
        assert_eq!(worker_ceiling(0.0, 8), 1);
    }

    #[tokio::test]
    async fn tasks_queue_in_fifo_order() {
        let pool = test_pool();
        for i in 0..3 {
            pool.add_task(format!("resolve({i});"), Box::new(|_, _, _| {}), None);
        }
        assert_eq!(pool.queue_length(), 3);
        assert_eq!(pool.stats().submitted(), 3);

        let scripts: Vec<String> = lock_recover(&pool.inner.queue)
            .iter()
            .map(|t| t.script.clone())
            .collect();
        assert_eq!(scripts, vec!["resolve(0);", "resolve(1);", "resolve(2);"]);
    }

    #[tokio::test]
    async fn fatal_drain_settles_every_queued_task_once() {
        let pool = test_pool();
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            pool.add_task(
                "resolve({});",
                Box::new(move |status, payload, timing| {
                    let _ = tx.send((status, payload, timing));
                }),
                None,
            );
        }

        pool.fail_queued_tasks();
        assert_eq!(pool.queue_length(), 0);

        let mut received = 0;
        while let Ok((status, payload, timing)) = rx.try_recv() {
            received += 1;
            assert_eq!(status, TaskStatus::Fail);
            assert_eq!(payload["error"], "FATAL");
            assert!(timing.completed_at.is_some());
        }
        assert_eq!(received, 3);
        assert_eq!(pool.stats().failed(), 3);

        // Draining an empty queue settles nothing twice.
        pool.fail_queued_tasks();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fail_payload_shape() {
        let payload = fail_payload(&TaskError::Timeout, None);
        assert_eq!(payload["error"], "TIMEOUT");
        assert_eq!(payload["stack"], "Not available");

        let payload = fail_payload(
            &TaskError::ScriptRuntime("ReferenceError: x is not defined".into()),
            Some("    at <anonymous> (:1:1)"),
        );
        assert_eq!(payload["error"], "SCRIPT_RUNTIME_ERROR");
        assert!(payload["log"]
            .as_str()
            .is_some_and(|s| s.contains("ReferenceError")));
        assert!(payload["stack"].as_str().is_some_and(|s| s.contains("at ")));
    }

    #[test]
    fn sandbox_flags_follow_configuration() {
        let args = default_launch_args(false);
        assert!(args.contains(&"--disable-blink-features=AutomationControlled"));
        assert!(!args.contains(&"--no-sandbox"));

        let args = default_launch_args(true);
        assert!(args.contains(&"--no-sandbox"));
        assert!(args.contains(&"--disable-setuid-sandbox"));
    }

    #[test]
    fn tasks_move_across_threads() {
        fn assert_send<T: Send>() {}
        assert_send::<Task>();
        assert_send::<BrowserWorkerPool>();
    }

    #[test]
    fn session_pages_are_pinned_to_their_context() {
        let context_id = BrowserContextId::new("ctx-1");
        let params = session_page_params(&context_id).unwrap();
        assert_eq!(params.browser_context_id, Some(context_id));
        assert_eq!(params.url, "about:blank");
    }

    #[tokio::test]
    async fn browser_gone_requeues_at_tail_without_settling() {
        let pool = test_pool();
        let (tx, rx) = mpsc::channel();

        // One task already waiting, one in flight.
        pool.add_task("resolve(2);", Box::new(|_, _, _| {}), None);
        let mut task = Task::new(
            "resolve(1);".to_string(),
            Box::new(move |status, payload, timing| {
                let _ = tx.send((status, payload, timing));
            }),
            crate::options::SessionOptions::default(),
        );
        let id = task.id;
        task.timing.mark_started();

        let requeued = pool.settle(
            task,
            Err((
                TaskError::Infrastructure {
                    message: "the connection is closed".to_string(),
                    retryable: true,
                },
                None,
            )),
        );

        assert!(requeued);
        // Callback has not fired and no counter moved.
        assert!(rx.try_recv().is_err());
        assert_eq!(pool.stats().failed(), 0);
        assert_eq!(pool.stats().succeeded(), 0);

        // Same task, at the tail, ready for a fresh dispatch.
        let queue = lock_recover(&pool.inner.queue);
        assert_eq!(queue.len(), 2);
        let requeued_task = queue.back().unwrap();
        assert_eq!(requeued_task.id, id);
        assert_eq!(requeued_task.script, "resolve(1);");
        assert!(requeued_task.timing.started_at.is_none());
    }

    #[tokio::test]
    async fn non_retryable_outcomes_settle_exactly_once() {
        let pool = test_pool();
        let (tx, rx) = mpsc::channel();
        let mut task = Task::new(
            "await new Promise(() => {});".to_string(),
            Box::new(move |status, payload, _| {
                let _ = tx.send((status, payload));
            }),
            crate::options::SessionOptions::default(),
        );
        task.timing.mark_started();

        let requeued = pool.settle(task, Err((TaskError::Timeout, None)));
        assert!(!requeued);

        let (status, payload) = rx.try_recv().unwrap();
        assert_eq!(status, TaskStatus::Fail);
        assert_eq!(payload["error"], "TIMEOUT");
        assert!(rx.try_recv().is_err());
        assert_eq!(pool.stats().timed_out(), 1);
        assert_eq!(pool.queue_length(), 0);
    }
}
