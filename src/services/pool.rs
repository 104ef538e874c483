//! In-process worker pool for executor runs.
//!
//! Submission hands task ids to a dispatcher over a channel; the dispatcher
//! spawns one executor run per id, bounded by a semaphore. The task row is
//! the durable handle: ids lost with a dead dispatcher stay `pending` and are
//! terminated by the reaper.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::models::task::TaskId;
use crate::services::executor::{ExecutionOutcome, Executor};

const HEARTBEAT_EVERY: Duration = Duration::from_secs(5);
const STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("worker pool is not accepting work")]
    Closed,
}

struct Channel {
    sender: mpsc::UnboundedSender<TaskId>,
    /// Held until the dispatcher starts; ids sent before then are buffered.
    receiver: Option<mpsc::UnboundedReceiver<TaskId>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Channel {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
            dispatcher: None,
        }
    }
}

pub struct WorkerPool {
    executor: Arc<Executor>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    heartbeat: Arc<AtomicI64>,
    channel: Mutex<Channel>,
}

impl WorkerPool {
    pub fn new(executor: Arc<Executor>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            heartbeat: Arc::new(AtomicI64::new(0)),
            channel: Mutex::new(Channel::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a task for execution. Does not wait for the run.
    pub fn dispatch(&self, id: TaskId) -> Result<(), DispatchError> {
        self.lock().sender.send(id).map_err(|_| DispatchError::Closed)
    }

    /// Start the dispatcher if it has not been started yet.
    pub fn start(&self) {
        let mut channel = self.lock();
        if channel.dispatcher.is_some() {
            return;
        }
        if let Some(receiver) = channel.receiver.take() {
            channel.dispatcher = Some(self.spawn_dispatcher(receiver));
            tracing::info!("Worker pool started");
        }
    }

    /// Replace the channel and dispatcher. Ids queued on the old channel are dropped.
    pub fn restart(&self) {
        let mut channel = self.lock();
        if let Some(old) = channel.dispatcher.take() {
            old.abort();
        }
        let mut fresh = Channel::new();
        if let Some(receiver) = fresh.receiver.take() {
            fresh.dispatcher = Some(self.spawn_dispatcher(receiver));
        }
        *channel = fresh;
        metrics::counter!("worker_pool_restarts_total").increment(1);
        tracing::warn!("Worker pool restarted");
    }

    /// Dispatcher running with a recent heartbeat.
    pub fn is_alive(&self) -> bool {
        let running = self
            .lock()
            .dispatcher
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        let age = Utc::now().timestamp_millis() - self.heartbeat.load(Ordering::Relaxed);
        running && age <= STALE_AFTER.as_millis() as i64
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.permits.available_permits())
    }

    fn spawn_dispatcher(&self, receiver: mpsc::UnboundedReceiver<TaskId>) -> JoinHandle<()> {
        beat(&self.heartbeat);
        tokio::spawn(dispatch_loop(
            receiver,
            self.executor.clone(),
            self.permits.clone(),
            self.heartbeat.clone(),
        ))
    }
}

fn beat(heartbeat: &AtomicI64) {
    heartbeat.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
}

async fn dispatch_loop(
    mut receiver: mpsc::UnboundedReceiver<TaskId>,
    executor: Arc<Executor>,
    permits: Arc<Semaphore>,
    heartbeat: Arc<AtomicI64>,
) {
    let mut ticker = interval(HEARTBEAT_EVERY);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let id = tokio::select! {
            _ = ticker.tick() => {
                beat(&heartbeat);
                continue;
            }
            next = receiver.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        // Keep beating while saturated so a busy pool is not mistaken for a dead one.
        let permit = loop {
            tokio::select! {
                permit = permits.clone().acquire_owned() => break permit,
                _ = ticker.tick() => beat(&heartbeat),
            }
        };
        let Ok(permit) = permit else {
            break;
        };
        beat(&heartbeat);

        let executor = executor.clone();
        tokio::spawn(async move {
            let _permit = permit;
            metrics::gauge!("worker_pool_in_flight").increment(1.0);
            match executor.run(id).await {
                Ok(ExecutionOutcome::Completed { .. }) => {}
                Ok(outcome) => tracing::debug!(task_id = %id, outcome = ?outcome, "Executor run finished"),
                Err(e) => tracing::error!(task_id = %id, error = %e, "Executor run failed"),
            }
            metrics::gauge!("worker_pool_in_flight").decrement(1.0);
        });
    }
    tracing::info!("Worker pool dispatcher stopped");
}
