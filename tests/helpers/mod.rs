//! Shared fakes and engine harness for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use imagegen_tasks::config::EngineSettings;
use imagegen_tasks::db::{MemoryStore, StoreError, TaskStore};
use imagegen_tasks::engine::{Engine, EngineDeps};
use imagegen_tasks::models::task::{
    InsertOutcome, Latch, NewTask, Stage, Task, TaskId, TaskInput, TaskLogEntry, TaskStatus,
    Transition,
};
use imagegen_tasks::services::materializer::{FetchedResult, MaterializeError, ResultFetcher};
use imagegen_tasks::services::provider::{GenerationProvider, ProviderError, ProviderErrorKind};
use imagegen_tasks::services::signal::{CancelSignal, LocalCancelSignal};
use imagegen_tasks::services::storage::MemoryStorage;

pub const OWNER: &str = "alice";
pub const OTHER_OWNER: &str = "mallory";
pub const STABLE_BASE: &str = "https://media.test";
pub const PLAIN_LOCATOR: &str = "https://cdn.acme.io/gen/red-bicycle.png";
pub const EPHEMERAL_LOCATOR: &str =
    "https://oaidalleapiprodscus.blob.core.windows.net/private/org/img-abc.png?se=2026-10-18T12%3A00%3A00Z&sig=Zm9v";
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

/// Scripted provider behaviour.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(ProviderErrorKind),
}

impl Reply {
    fn into_result(self) -> Result<String, ProviderError> {
        match self {
            Reply::Text(text) => Ok(text),
            Reply::Fail(kind) => Err(ProviderError::new(kind, "scripted failure")),
        }
    }
}

pub struct FakeProvider {
    converse: Mutex<Reply>,
    generate: Mutex<Reply>,
    delay: Mutex<Duration>,
    gated: AtomicBool,
    /// Notified when a provider call starts.
    pub entered: Notify,
    /// Releases one gated call.
    pub release: Notify,
    pub converse_calls: AtomicUsize,
    pub generate_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(converse: Reply, generate: Reply) -> Self {
        Self {
            converse: Mutex::new(converse),
            generate: Mutex::new(generate),
            delay: Mutex::new(Duration::ZERO),
            gated: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
            converse_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
        }
    }

    /// Conversational reply containing a plain, non-expiring image URL.
    pub fn succeeding() -> Self {
        Self::new(
            Reply::Text(format!("Here is your image: {PLAIN_LOCATOR}")),
            Reply::Text(PLAIN_LOCATOR.to_string()),
        )
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = delay;
        self
    }

    /// Every call blocks until `release` is notified.
    pub fn gated(self) -> Self {
        self.gated.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.converse_calls.load(Ordering::SeqCst) + self.generate_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        self.entered.notify_one();
        if self.gated.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl GenerationProvider for FakeProvider {
    async fn converse(&self, _input: &TaskInput) -> Result<String, ProviderError> {
        self.converse_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.converse.lock().unwrap().clone().into_result()
    }

    async fn generate(&self, _input: &TaskInput) -> Result<String, ProviderError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.generate.lock().unwrap().clone().into_result()
    }
}

/// Serves a tiny PNG for every locator.
#[derive(Default)]
pub struct FakeFetcher {
    pub fetches: AtomicUsize,
}

#[async_trait]
impl ResultFetcher for FakeFetcher {
    async fn fetch(&self, _locator: &str) -> Result<FetchedResult, MaterializeError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(FetchedResult {
            bytes: PNG_BYTES.to_vec(),
            content_type: Some("image/png".into()),
        })
    }
}

/// Cancel channel that never delivers, so only the store decides races.
pub struct DeafSignal;

#[async_trait]
impl CancelSignal for DeafSignal {
    async fn notify(&self, _id: TaskId) {}

    async fn is_cancelled(&self, _id: TaskId) -> bool {
        false
    }

    async fn clear(&self, _id: TaskId) {}

    fn backend(&self) -> &'static str {
        "deaf"
    }
}

/// Wraps a memory store and injects write failures.
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    /// Status transitions return an error.
    pub fail_transitions: AtomicBool,
    /// The next N status transitions return an error.
    pub fail_next_transitions: AtomicUsize,
    /// Status transitions report "not applied" without writing.
    pub drop_transitions: AtomicBool,
    /// The next N terminal transitions are written, then reported as errors.
    pub lose_terminal_acks: AtomicUsize,
    /// Applied from `processing` just before the next transition, as if a
    /// competing writer got there first.
    pub preempt_with: Mutex<Option<Transition>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_transitions: AtomicBool::new(false),
            fail_next_transitions: AtomicUsize::new(0),
            drop_transitions: AtomicBool::new(false),
            lose_terminal_acks: AtomicUsize::new(0),
            preempt_with: Mutex::new(None),
        }
    }

    async fn preempt(&self, id: TaskId) -> Result<(), StoreError> {
        let competing = self.preempt_with.lock().unwrap().take();
        if let Some(competing) = competing {
            self.inner
                .transition(id, None, &[TaskStatus::Processing], &competing)
                .await?;
        }
        Ok(())
    }

    fn injected(&self) -> Option<Result<bool, StoreError>> {
        if self.fail_transitions.load(Ordering::SeqCst) {
            return Some(Err(StoreError::Unavailable("injected failure".into())));
        }
        let pending = self.fail_next_transitions.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next_transitions.store(pending - 1, Ordering::SeqCst);
            return Some(Err(StoreError::Unavailable("injected one-off failure".into())));
        }
        if self.drop_transitions.load(Ordering::SeqCst) {
            return Some(Ok(false));
        }
        None
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn insert_task(&self, task: &NewTask) -> Result<InsertOutcome, StoreError> {
        self.inner.insert_task(task).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.inner.get_task(id).await
    }

    async fn transition(
        &self,
        id: TaskId,
        owner: Option<&str>,
        from: &[TaskStatus],
        transition: &Transition,
    ) -> Result<bool, StoreError> {
        self.preempt(id).await?;
        if let Some(result) = self.injected() {
            return result;
        }
        let applied = self.inner.transition(id, owner, from, transition).await?;
        let lost = self.lose_terminal_acks.load(Ordering::SeqCst);
        if applied && transition.to.is_terminal() && lost > 0 {
            self.lose_terminal_acks.store(lost - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("connection reset after commit".into()));
        }
        Ok(applied)
    }

    async fn transition_atomic(
        &self,
        id: TaskId,
        owner: Option<&str>,
        from: &[TaskStatus],
        transition: &Transition,
    ) -> Result<bool, StoreError> {
        self.preempt(id).await?;
        if let Some(result) = self.injected() {
            return result;
        }
        self.inner.transition_atomic(id, owner, from, transition).await
    }

    async fn record_progress(&self, id: TaskId, stage: Stage) -> Result<bool, StoreError> {
        self.inner.record_progress(id, stage).await
    }

    async fn set_latch(&self, id: TaskId, latch: Latch) -> Result<bool, StoreError> {
        self.inner.set_latch(id, latch).await
    }

    async fn set_materialized(&self, id: TaskId, stable_ref: &str) -> Result<bool, StoreError> {
        self.inner.set_materialized(id, stable_ref).await
    }

    async fn list_stuck(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Task>, StoreError> {
        self.inner.list_stuck(cutoff, limit).await
    }

    async fn list_unmaterialized(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        self.inner.list_unmaterialized(limit).await
    }

    async fn append_log(&self, entry: &TaskLogEntry) -> Result<(), StoreError> {
        self.inner.append_log(entry).await
    }

    async fn list_logs(&self, id: TaskId) -> Result<Vec<TaskLogEntry>, StoreError> {
        self.inner.list_logs(id).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

pub fn test_settings() -> EngineSettings {
    EngineSettings {
        provider_timeout: Duration::from_secs(5),
        cancel_confirm_attempts: 3,
        cancel_confirm_delay: Duration::from_millis(5),
        stuck_after: Duration::from_secs(60 * 30),
        ..EngineSettings::default()
    }
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub storage: Arc<MemoryStorage>,
    pub fetcher: Arc<FakeFetcher>,
}

pub struct HarnessBuilder {
    provider: FakeProvider,
    settings: EngineSettings,
    tasks: Option<Arc<dyn TaskStore>>,
    admin_tasks: Option<Arc<dyn TaskStore>>,
    signal: Option<Arc<dyn CancelSignal>>,
    store: Arc<MemoryStore>,
}

impl HarnessBuilder {
    pub fn new(provider: FakeProvider) -> Self {
        Self {
            provider,
            settings: test_settings(),
            tasks: None,
            admin_tasks: None,
            signal: None,
            store: MemoryStore::arc(),
        }
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    pub fn tasks(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn admin_tasks(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.admin_tasks = Some(tasks);
        self
    }

    pub fn signal(mut self, signal: Arc<dyn CancelSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn build(self) -> Harness {
        let provider = Arc::new(self.provider);
        let storage = Arc::new(MemoryStorage::new(STABLE_BASE));
        let fetcher = Arc::new(FakeFetcher::default());
        let default_tasks: Arc<dyn TaskStore> = self.store.clone();

        let engine = Engine::new(EngineDeps {
            tasks: self.tasks.unwrap_or_else(|| default_tasks.clone()),
            admin_tasks: self.admin_tasks.unwrap_or(default_tasks),
            ledger_store: self.store.clone(),
            provider: provider.clone(),
            storage: storage.clone(),
            fetcher: fetcher.clone(),
            signal: self
                .signal
                .unwrap_or_else(|| Arc::new(LocalCancelSignal::default())),
            settings: self.settings,
        });

        Harness {
            engine,
            store: self.store,
            provider,
            storage,
            fetcher,
        }
    }
}

impl Harness {
    pub fn new(provider: FakeProvider) -> Self {
        HarnessBuilder::new(provider).build()
    }

    pub async fn fund(&self, owner: &str, credits: i64) {
        self.engine.ledger.grant(owner, credits).await.unwrap();
    }

    pub async fn balance(&self, owner: &str) -> i64 {
        self.engine.ledger.balance(owner).await.unwrap()
    }

    pub async fn submit(&self, prompt: &str) -> Task {
        self.engine
            .submission
            .submit(OWNER, TaskInput::from_prompt(prompt), None)
            .await
            .unwrap()
            .task
    }

    /// Insert a task directly, bypassing submission and the pool.
    pub async fn seed_task(&self, owner: &str) -> Task {
        match self
            .store
            .insert_task(&NewTask {
                id: Uuid::new_v4(),
                owner_id: owner.to_string(),
                input: TaskInput::from_prompt("a red bicycle"),
            })
            .await
            .unwrap()
        {
            InsertOutcome::Created(task) | InsertOutcome::Existing(task) => task,
        }
    }

    pub async fn task(&self, id: TaskId) -> Task {
        self.store.get_task(id).await.unwrap().unwrap()
    }

    /// Poll until the task is terminal and the pool is idle, so charging and
    /// inline materialization have finished. Panics after `timeout`.
    pub async fn wait_terminal(&self, id: TaskId, timeout: Duration) -> Task {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self.task(id).await;
            if task.status.is_terminal() && self.engine.pool.in_flight() == 0 {
                return self.task(id).await;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {id} still {} after {timeout:?}",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
