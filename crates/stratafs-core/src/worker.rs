//! Long-lived background tasks on a tokio runtime.
//!
//! A [`Worker`] runs its body on the runtime's blocking pool. Spawning waits
//! until the body has reported ready; stopping flips a `watch` channel and
//! waits for the body to return. Dropping a worker stops it.
//!
//! These calls block, so they are made from plain threads or from blocking
//! tasks, never from inside an async task.

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{FsError, FsResult};

static SHARED_RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Handle to the process-wide background runtime, built on first use.
pub fn shared_runtime() -> FsResult<Handle> {
    SHARED_RUNTIME
        .get_or_try_init(|| {
            Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("stratafs-bg")
                .enable_all()
                .build()
        })
        .map(|rt| rt.handle().clone())
        .map_err(FsError::Io)
}

/// Handle given to a worker body for cooperative cancellation.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    name: Arc<str>,
    stop: watch::Receiver<bool>,
    runtime: Handle,
}

impl WorkerContext {
    /// Worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether stop has been requested.
    pub fn should_stop(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sleeps for up to `dur`. Returns `false` if stop was requested.
    pub fn sleep(&self, dur: Duration) -> bool {
        let mut stop = self.stop.clone();
        self.runtime.block_on(async move {
            let stopped = async {
                let _ = stop.wait_for(|s| *s).await;
            };
            tokio::time::timeout(dur, stopped).await.is_err()
        })
    }

    /// Blocks until stop is requested.
    pub fn wait_stop(&self) {
        let mut stop = self.stop.clone();
        self.runtime.block_on(async move {
            let _ = stop.wait_for(|s| *s).await;
        });
    }

    /// Waits for the next tick of `interval`. Returns `false` if stop was
    /// requested first.
    pub fn wait_tick(&self, interval: &mut Interval) -> bool {
        if self.should_stop() {
            return false;
        }
        let mut stop = self.stop.clone();
        self.runtime.block_on(async move {
            tokio::select! {
                _ = stop.wait_for(|s| *s) => false,
                _ = interval.tick() => true,
            }
        })
    }
}

/// A named background task with explicit start, stop and join.
#[derive(Debug)]
pub struct Worker {
    name: Arc<str>,
    stop: watch::Sender<bool>,
    runtime: Handle,
    thread: Arc<Mutex<Option<ThreadId>>>,
    task: Option<JoinHandle<()>>,
}

impl Worker {
    /// Starts `body` on the blocking pool of `runtime` and waits for it to
    /// report ready.
    pub fn spawn<F>(runtime: &Handle, name: impl Into<String>, body: F) -> FsResult<Self>
    where
        F: FnOnce(WorkerContext) + Send + 'static,
    {
        let name: String = name.into();
        let name: Arc<str> = Arc::from(name);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let thread = Arc::new(Mutex::new(None));

        let ctx = WorkerContext {
            name: name.clone(),
            stop: stop_rx,
            runtime: runtime.clone(),
        };
        let running_on = thread.clone();
        let task = runtime.spawn_blocking(move || {
            *running_on.lock() = Some(thread::current().id());
            let _ = ready_tx.send(());
            body(ctx);
        });

        if ready_rx.blocking_recv().is_err() {
            let reason = match runtime.block_on(task) {
                Err(e) => e.to_string(),
                Ok(()) => "task exited before reporting ready".to_string(),
            };
            return Err(FsError::WorkerStart {
                worker: name.to_string(),
                reason,
            });
        }

        debug!(worker = %name, "worker started");
        Ok(Self {
            name,
            stop: stop_tx,
            runtime: runtime.clone(),
            thread,
            task: Some(task),
        })
    }

    /// Worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether the body is still running.
    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Requests stop and waits for the body to return. Idempotent.
    pub fn stop(&mut self) {
        self.stop.send_replace(true);
        let Some(task) = self.task.take() else {
            return;
        };
        // Stopped from its own body: it exits once the body returns.
        if *self.thread.lock() == Some(thread::current().id()) {
            return;
        }
        match self.runtime.block_on(task) {
            Ok(()) => debug!(worker = %self.name, "worker stopped"),
            Err(e) if e.is_panic() => warn!(worker = %self.name, "worker panicked"),
            Err(e) => warn!(worker = %self.name, error = %e, "worker cancelled"),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A worker that runs `tick` on every tick of a `tokio::time::interval`
/// until cancelled.
#[derive(Debug)]
pub struct PeriodicTask {
    worker: Worker,
}

impl PeriodicTask {
    /// Schedules `tick` to run every `period`, first after one full period.
    pub fn start<F>(
        runtime: &Handle,
        name: impl Into<String>,
        period: Duration,
        mut tick: F,
    ) -> FsResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let worker = Worker::spawn(runtime, name, move |ctx| {
            let mut interval = ctx.runtime.block_on(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval.tick().await;
                interval
            });
            while ctx.wait_tick(&mut interval) {
                tick();
            }
        })?;
        Ok(Self { worker })
    }

    /// Cancels the task and waits for an in-progress tick to finish.
    pub fn cancel(mut self) {
        self.worker.stop();
    }

    /// Task name.
    pub fn name(&self) -> &str {
        self.worker.name()
    }
}
