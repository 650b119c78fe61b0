//! Debounced named-task scheduler.
//!
//! `schedule_named` coalesces repeated requests for the same name into one
//! pending command (last request wins). A pool of poller tasks sweeps the
//! registry on a jittered period and runs each eligible task, never more
//! than one execution of a name at a time.

mod task;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use crate::config::SchedulerConfig;
use crate::obs;

pub use task::{Command, TaskStatus};
use task::NamedTask;

/// Shared handle to the scheduler; clones refer to the same registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    tasks: RwLock<HashMap<String, Arc<NamedTask>>>,
    epoch: Instant,
    config: SchedulerConfig,
    started: AtomicBool,
    pollers: Mutex<Vec<JoinHandle<()>>>,
    delayed: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create an idle scheduler. Pollers start on the first `schedule_named`.
    ///
    /// With `config.pollers == 0` no pollers are ever started and the caller
    /// drives execution through [`Scheduler::check_named_tasks`].
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: RwLock::new(HashMap::new()),
                epoch: Instant::now(),
                config,
                started: AtomicBool::new(false),
                pollers: Mutex::new(Vec::new()),
                delayed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Request a run of `name`. Never blocks.
    ///
    /// Replaces any command still pending for the name. The task's quiet
    /// period becomes the smallest one ever requested.
    pub fn schedule_named<F, Fut>(&self, name: &str, command: F, quiet_period: Duration)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let quiet_ms = duration_ms(quiet_period);
        let task = self.inner.task_or_insert(name, quiet_ms);
        task.request(Box::new(move || command().boxed()), quiet_ms);
        debug!(task = %name, quiet_ms, "named task scheduled");
        self.ensure_pollers();
    }

    /// Run `command` once after `delay`. No coalescing.
    pub fn invoke_later<F, Fut>(&self, command: F, delay: Duration)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let Ok(handle) = Handle::try_current() else {
            warn!("no async runtime, delayed command dropped");
            return;
        };
        let join = handle.spawn(async move {
            time::sleep(delay).await;
            execute("invokeLater", "delayed", Box::new(move || command().boxed())).await;
        });

        let mut delayed = self.inner.delayed.lock().unwrap_or_else(|e| e.into_inner());
        delayed.retain(|h| !h.is_finished());
        delayed.push(join);
    }

    /// One sweep over the registry. Returns the number of executions.
    pub async fn check_named_tasks(&self, runner: &str) -> usize {
        self.inner.check_named_tasks(runner).await
    }

    pub fn task_status(&self, name: &str) -> Option<TaskStatus> {
        let tasks = self.inner.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks.get(name).map(|t| t.status())
    }

    /// Names of all registered tasks, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let tasks = self.inner.tasks.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Abort pollers and pending delayed commands. A later
    /// `schedule_named` starts a fresh poller pool.
    pub fn stop(&self) {
        let mut pollers = self.inner.pollers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in pollers.drain(..) {
            handle.abort();
        }
        self.inner.started.store(false, Ordering::Release);
        let mut delayed = self.inner.delayed.lock().unwrap_or_else(|e| e.into_inner());
        for handle in delayed.drain(..) {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    fn ensure_pollers(&self) {
        if self.inner.config.pollers == 0 {
            return;
        }
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("no async runtime, pollers not started");
            self.inner.started.store(false, Ordering::Release);
            return;
        };

        let base = self.inner.config.poll_period().max(Duration::from_millis(1));
        let jitter_ms = duration_ms(self.inner.config.poll_jitter());
        let mut rng = rand::rng();

        let mut pollers = self.inner.pollers.lock().unwrap_or_else(|e| e.into_inner());
        for idx in 0..self.inner.config.pollers {
            let period = base + Duration::from_millis(rng.random_range(0..=jitter_ms));
            let inner = Arc::clone(&self.inner);
            let runner = format!("poller-{idx}");
            pollers.push(handle.spawn(async move {
                let mut ticker = time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    inner.check_named_tasks(&runner).await;
                }
            }));
        }
        info!(pollers = pollers.len(), period_ms = duration_ms(base), jitter_ms, "scheduler pollers started");
    }
}

impl Inner {
    fn task_or_insert(&self, name: &str, quiet_ms: u64) -> Arc<NamedTask> {
        if let Some(task) = self
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Arc::clone(task);
        }
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            tasks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(NamedTask::new(name, quiet_ms))),
        )
    }

    fn now_ms(&self) -> u64 {
        duration_ms(self.epoch.elapsed())
    }

    async fn check_named_tasks(&self, runner: &str) -> usize {
        let snapshot: Vec<Arc<NamedTask>> = {
            let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
            tasks.values().cloned().collect()
        };

        let mut executed = 0;
        for task in snapshot {
            if !task.is_eligible(self.now_ms()) {
                continue;
            }
            let Some(command) = task.try_claim(self.now_ms()) else {
                continue;
            };
            let _finish = FinishOnDrop { inner: self, task: &task };
            execute(task.name(), runner, command).await;
            executed += 1;
        }
        executed
    }
}

/// Marks a claimed task finished even when its poller is aborted mid-run.
struct FinishOnDrop<'a> {
    inner: &'a Inner,
    task: &'a NamedTask,
}

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        self.task.finish(self.inner.now_ms());
    }
}

/// Run a command, containing errors and panics.
async fn execute(name: &str, runner: &str, command: Command) {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(async move { command().await })
        .catch_unwind()
        .instrument(obs::task_span(name, runner))
        .await;

    match outcome {
        Ok(Ok(())) => obs::emit_task_finished(name, duration_ms(started.elapsed())),
        Ok(Err(e)) => obs::emit_task_failed(name, &format!("{e:#}")),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            obs::emit_task_failed(name, &format!("panicked: {msg}"));
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
