//! Per-type queue processor: the fetch/dispatch loop and its bounded worker
//! pool.
//!
//! On every tick the processor claims a batch of eligible rows and submits
//! one job per task into the pool. Jobs acquire a semaphore permit (FIFO, so
//! in-batch dispatch order follows the claim order), run the before-hooks,
//! the handler under its wall-clock budget, and the after-hooks. A panic in
//! a handler is contained at the job boundary: the panic handler is invoked
//! and the row is left in `processing` for the healer to resurrect.
//!
//! Graceful stop cancels the loop's token, waits for in-flight and queued
//! jobs with a budget proportional to their count, then stops the child
//! healer and cleaner.

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::cleaner::{
    QueueCleaner, DEFAULT_CLEANER_PERIOD, DEFAULT_CLEANER_TIMEOUT, DEFAULT_CLEANER_UPDATED_AGO,
};
use super::healer::{
    QueueHealer, DEFAULT_HEALER_PERIOD, DEFAULT_HEALER_TIMEOUT, DEFAULT_HEALER_UPDATED_AGO,
};
use super::hooks::{
    requeue_task, AfterProcessingHook, BeforeProcessingHook, LogAfter, LogBefore, MarkProcessing,
    PersistOutcome,
};
use super::TaskHandler;
use crate::context::QueueContext;
use crate::errors::{ProcessError, QueueError};
use crate::metrics::{QueueOperation, SharedQueueMetrics};
use crate::retry::{static_delay, NextAttemptFn};
use crate::storage::SharedTaskStorage;
use crate::task::Task;

const DEFAULT_FETCH_TICK: Duration = Duration::from_secs(30);
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_FETCH_MAX_TASKS: i64 = 100;
const DEFAULT_WORKERS: usize = 10;
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ATTEMPTS: i32 = 5;
const DEFAULT_STATIC_NEXT_ATTEMPT_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Invoked with the panic payload when a handler panics.
pub type PanicHandler = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// Tuning for a maintenance loop attached to a processor.
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceOptions {
    /// Interval between passes.
    pub period: Duration,
    /// Per-pass timeout.
    pub timeout: Duration,
    /// Staleness threshold for rows the pass touches.
    pub updated_ago: Duration,
}

/// Configuration for a [`QueueProcessor`]. All knobs have documented
/// defaults; construct with [`ProcessorOptions::default`] and override with
/// the builder methods.
#[derive(Clone)]
pub struct ProcessorOptions {
    /// Interval between claim attempts. Default 30s.
    pub fetch_tick: Duration,
    /// Upper bound per claim batch. Default 100.
    pub fetch_max_tasks: i64,
    /// Wall-clock cap on one claim. Default 30s.
    pub fetch_timeout: Duration,
    /// Concurrent handler slots. Default 10.
    pub workers: usize,
    /// Wall-clock cap on one handler call. Default 30s.
    pub task_timeout: Duration,
    /// Failed attempts before `attempts_left`. Default 5, minimum 1.
    pub max_attempts: i32,
    /// Retry-delay schedule. Default: constant 10 minutes.
    pub next_attempt_at: NextAttemptFn,
    /// Handler-panic callback. Default logs the payload.
    pub panic_handler: Option<PanicHandler>,
    /// User hooks appended after the default before-chain.
    pub before_hooks: Vec<Arc<dyn BeforeProcessingHook>>,
    /// User hooks appended after the default after-chain, or the entire
    /// after-chain when `replace_after_hooks` is set.
    pub after_hooks: Vec<Arc<dyn AfterProcessingHook>>,
    /// Replace the default after-chain (outcome classifier included)
    /// instead of appending to it.
    pub replace_after_hooks: bool,
    pub healer: MaintenanceOptions,
    pub cleaner: MaintenanceOptions,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            fetch_tick: DEFAULT_FETCH_TICK,
            fetch_max_tasks: DEFAULT_FETCH_MAX_TASKS,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            workers: DEFAULT_WORKERS,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next_attempt_at: static_delay(DEFAULT_STATIC_NEXT_ATTEMPT_PERIOD),
            panic_handler: None,
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            replace_after_hooks: false,
            healer: MaintenanceOptions {
                period: DEFAULT_HEALER_PERIOD,
                timeout: DEFAULT_HEALER_TIMEOUT,
                updated_ago: DEFAULT_HEALER_UPDATED_AGO,
            },
            cleaner: MaintenanceOptions {
                period: DEFAULT_CLEANER_PERIOD,
                timeout: DEFAULT_CLEANER_TIMEOUT,
                updated_ago: DEFAULT_CLEANER_UPDATED_AGO,
            },
        }
    }
}

impl ProcessorOptions {
    pub fn with_fetch_tick(mut self, tick: Duration) -> Self {
        self.fetch_tick = tick;
        self
    }

    pub fn with_fetch_max_tasks(mut self, max_tasks: i64) -> Self {
        self.fetch_max_tasks = max_tasks;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_next_attempt_at(mut self, next_attempt_at: NextAttemptFn) -> Self {
        self.next_attempt_at = next_attempt_at;
        self
    }

    pub fn with_panic_handler(mut self, handler: PanicHandler) -> Self {
        self.panic_handler = Some(handler);
        self
    }

    pub fn with_before_hooks(mut self, hooks: Vec<Arc<dyn BeforeProcessingHook>>) -> Self {
        self.before_hooks.extend(hooks);
        self
    }

    pub fn with_after_hooks(mut self, hooks: Vec<Arc<dyn AfterProcessingHook>>) -> Self {
        self.after_hooks.extend(hooks);
        self
    }

    /// Replace the default after-chain entirely. The caller is responsible
    /// for including a [`PersistOutcome`] if outcomes should still be
    /// persisted.
    pub fn with_after_hooks_replaced(mut self, hooks: Vec<Arc<dyn AfterProcessingHook>>) -> Self {
        self.after_hooks = hooks;
        self.replace_after_hooks = true;
        self
    }

    pub fn with_healer(mut self, options: MaintenanceOptions) -> Self {
        self.healer = options;
        self
    }

    pub fn with_cleaner(mut self, options: MaintenanceOptions) -> Self {
        self.cleaner = options;
        self
    }
}

struct RunState {
    cancel: CancellationToken,
    stopped: oneshot::Receiver<()>,
}

/// Fetch/dispatch loop for one task type.
pub struct QueueProcessor {
    core: Arc<ProcessorCore>,
    healer: QueueHealer,
    cleaner: QueueCleaner,
    run_state: Mutex<Option<RunState>>,
}

struct ProcessorCore {
    storage: SharedTaskStorage,
    task_type: String,
    handler: Arc<dyn TaskHandler>,
    fetch_tick: Duration,
    fetch_max_tasks: i64,
    fetch_timeout: Duration,
    workers: usize,
    task_timeout: Duration,
    panic_handler: PanicHandler,
    before_hooks: Vec<Arc<dyn BeforeProcessingHook>>,
    after_hooks: Vec<Arc<dyn AfterProcessingHook>>,
    metrics: SharedQueueMetrics,
}

enum HandlerRun {
    Completed(Result<(), ProcessError>),
    Panicked(Box<dyn Any + Send>),
}

impl QueueProcessor {
    pub(crate) fn new(
        storage: SharedTaskStorage,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        options: ProcessorOptions,
        metrics: SharedQueueMetrics,
    ) -> Self {
        let task_type = task_type.into();

        let healer = QueueHealer::new(Arc::clone(&storage), task_type.clone(), Arc::clone(&metrics));
        healer.set_process_period(options.healer.period);
        healer.set_process_timeout(options.healer.timeout);
        healer.set_updated_ago(options.healer.updated_ago);

        let cleaner =
            QueueCleaner::new(Arc::clone(&storage), task_type.clone(), Arc::clone(&metrics));
        cleaner.set_process_period(options.cleaner.period);
        cleaner.set_process_timeout(options.cleaner.timeout);
        cleaner.set_updated_ago(options.cleaner.updated_ago);

        let mut before_hooks: Vec<Arc<dyn BeforeProcessingHook>> = vec![
            Arc::new(MarkProcessing::new(Arc::clone(&storage))),
            Arc::new(LogBefore),
        ];
        before_hooks.extend(options.before_hooks);

        let mut after_hooks: Vec<Arc<dyn AfterProcessingHook>> = if options.replace_after_hooks {
            Vec::new()
        } else {
            vec![
                Arc::new(PersistOutcome::new(
                    Arc::clone(&storage),
                    options.max_attempts,
                    Arc::clone(&options.next_attempt_at),
                    Arc::clone(&metrics),
                )),
                Arc::new(LogAfter),
            ]
        };
        after_hooks.extend(options.after_hooks);

        let core = Arc::new(ProcessorCore {
            storage,
            task_type,
            handler,
            fetch_tick: options.fetch_tick,
            fetch_max_tasks: options.fetch_max_tasks,
            fetch_timeout: options.fetch_timeout,
            workers: options.workers.max(1),
            task_timeout: options.task_timeout,
            panic_handler: options
                .panic_handler
                .unwrap_or_else(|| Arc::new(default_panic_handler)),
            before_hooks,
            after_hooks,
            metrics,
        });

        Self {
            core,
            healer,
            cleaner,
            run_state: Mutex::new(None),
        }
    }

    /// Processor name, derived from its task type.
    pub fn name(&self) -> String {
        self.core.name()
    }

    pub fn healer(&self) -> &QueueHealer {
        &self.healer
    }

    pub fn cleaner(&self) -> &QueueCleaner {
        &self.cleaner
    }

    /// Start the healer, the cleaner, and the main loop. Non-blocking: the
    /// loop runs in a background task until [`stop`](Self::stop).
    pub fn run(&self, shutdown: &CancellationToken) -> Result<(), QueueError> {
        let mut state = self.run_state.lock();
        if state.is_some() {
            return Err(QueueError::AlreadyRunning {
                task_type: self.core.task_type.clone(),
            });
        }

        self.healer.run(shutdown);
        self.cleaner.run(shutdown);

        info!(processor = %self.name(), "start processor");

        let cancel = shutdown.child_token();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        *state = Some(RunState {
            cancel: cancel.clone(),
            stopped: stopped_rx,
        });
        drop(state);

        let core = Arc::clone(&self.core);
        tokio::spawn(async move { core.run_loop(cancel, stopped_tx).await });

        Ok(())
    }

    /// Cancel the main loop, wait for it to drain its pool, then stop the
    /// healer and cleaner.
    pub async fn stop(&self) {
        let state = self.run_state.lock().take();
        if let Some(state) = state {
            info!(processor = %self.name(), "start graceful shutdown");
            state.cancel.cancel();
            let _ = state.stopped.await;
            info!(processor = %self.name(), "graceful shutdown finished");
        }

        self.healer.stop().await;
        self.cleaner.stop().await;
    }
}

impl ProcessorCore {
    fn name(&self) -> String {
        format!("duraq-processor-{}", self.task_type)
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken, stopped: oneshot::Sender<()>) {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let tracker = TaskTracker::new();

        self.metrics.workers(&self.task_type, self.workers).await;

        let mut tick = tokio::time::interval(self.fetch_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval yields immediately once; consume that so the first
        // claim happens one full tick after start.
        tick.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let wait_jobs = tracker.len();
                    info!(
                        count = wait_jobs,
                        processor = %self.name(),
                        "wait jobs before releasing worker pool"
                    );
                    tracker.close();
                    // Queued jobs wake on the closed semaphore and requeue
                    // themselves; running handlers keep their permits.
                    semaphore.close();

                    let budget =
                        self.task_timeout * (wait_jobs as u32) + Duration::from_millis(1);
                    if tokio::time::timeout(budget, tracker.wait()).await.is_err() {
                        error!(processor = %self.name(), "failed to release workers within budget");
                    }
                    break;
                }
                _ = tick.tick() => {
                    self.fetch_and_process(&cancel, &semaphore, &tracker).await;
                }
            }
        }

        let _ = stopped.send(());
    }

    async fn fetch_and_process(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        semaphore: &Arc<Semaphore>,
        tracker: &TaskTracker,
    ) {
        for task in self.fetch_tasks().await {
            if tracker.is_closed() {
                // Remaining rows stay pending; the healer resurrects them.
                warn!(
                    processor = %self.name(),
                    "worker pool is closing, dropping remainder of batch"
                );
                break;
            }

            let core = Arc::clone(self);
            let cancel = cancel.clone();
            let semaphore = Arc::clone(semaphore);
            tracker.spawn(async move { core.process_job(cancel, semaphore, task).await });
        }
    }

    async fn fetch_tasks(&self) -> Vec<Task> {
        let started = Instant::now();
        let claim = self
            .storage
            .get_tasks_for_processing(&self.task_type, self.fetch_max_tasks);

        let tasks = match tokio::time::timeout(self.fetch_timeout, claim).await {
            Ok(Ok(tasks)) => tasks,
            Ok(Err(err)) => {
                error!(error = %err, processor = %self.name(), "failed to fetch tasks");
                return Vec::new();
            }
            Err(_) => {
                error!(
                    processor = %self.name(),
                    timeout = ?self.fetch_timeout,
                    "fetch timed out"
                );
                return Vec::new();
            }
        };

        if !tasks.is_empty() {
            debug!(
                count = tasks.len(),
                processor = %self.name(),
                "fetched tasks for processing"
            );
        }
        self.metrics
            .operation(
                &self.task_type,
                QueueOperation::Fetch,
                tasks.len(),
                started.elapsed(),
            )
            .await;

        tasks
    }

    async fn process_job(
        self: Arc<Self>,
        cancel: CancellationToken,
        semaphore: Arc<Semaphore>,
        mut task: Task,
    ) {
        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            // Pool released before this job got a slot.
            Err(_) => {
                requeue_task(self.storage.as_ref(), &mut task).await;
                return;
            }
        };

        if cancel.is_cancelled() {
            requeue_task(self.storage.as_ref(), &mut task).await;
            return;
        }

        let ctx =
            QueueContext::with_cancellation(cancel.clone()).with_values(task.metadata.clone());

        for hook in &self.before_hooks {
            hook.call(&ctx, &mut task).await;
        }

        match self.run_handler(&ctx, &task).await {
            HandlerRun::Panicked(payload) => {
                // The row stays `processing`; the healer will resurrect it
                // without blaming the handler.
                (self.panic_handler)(payload);
            }
            HandlerRun::Completed(result) => {
                for hook in &self.after_hooks {
                    hook.call(&ctx, &mut task, &result).await;
                }
            }
        }
    }

    async fn run_handler(&self, ctx: &QueueContext, task: &Task) -> HandlerRun {
        let handler_call = AssertUnwindSafe(self.handler.handle(ctx, task)).catch_unwind();

        match tokio::time::timeout(self.task_timeout, handler_call).await {
            Err(_elapsed) => HandlerRun::Completed(Err(ProcessError::Timeout {
                timeout: self.task_timeout,
            })),
            Ok(Err(panic)) => HandlerRun::Panicked(panic),
            Ok(Ok(result)) => {
                if let Err(err) = &result {
                    error!(error = %err, task_id = %task.id, "failed to process task");
                }
                HandlerRun::Completed(result)
            }
        }
    }
}

fn default_panic_handler(payload: Box<dyn Any + Send>) {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    error!(panic = %message, "worker panic while processing task");
}
