//! Wires the lifecycle services together over a set of backends.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::EngineSettings;
use crate::db::{LedgerStore, TaskStore};
use crate::services::cancellation::CancellationService;
use crate::services::executor::Executor;
use crate::services::ledger::CreditLedger;
use crate::services::materializer::{Materializer, ResultFetcher};
use crate::services::pool::WorkerPool;
use crate::services::progress::ProgressReporter;
use crate::services::provider::GenerationProvider;
use crate::services::reaper::Reaper;
use crate::services::signal::CancelSignal;
use crate::services::storage::ObjectStorage;
use crate::services::submission::SubmissionService;

/// Backends the engine runs against.
pub struct EngineDeps {
    pub tasks: Arc<dyn TaskStore>,
    /// Same schema, privileged credentials.
    pub admin_tasks: Arc<dyn TaskStore>,
    pub ledger_store: Arc<dyn LedgerStore>,
    pub provider: Arc<dyn GenerationProvider>,
    pub storage: Arc<dyn ObjectStorage>,
    pub fetcher: Arc<dyn ResultFetcher>,
    pub signal: Arc<dyn CancelSignal>,
    pub settings: EngineSettings,
}

#[derive(Clone)]
pub struct Engine {
    pub tasks: Arc<dyn TaskStore>,
    pub signal: Arc<dyn CancelSignal>,
    pub ledger: Arc<CreditLedger>,
    pub submission: Arc<SubmissionService>,
    pub cancellation: Arc<CancellationService>,
    pub executor: Arc<Executor>,
    pub pool: Arc<WorkerPool>,
    pub reaper: Arc<Reaper>,
    pub materializer: Arc<Materializer>,
    pub progress: ProgressReporter,
    pub settings: EngineSettings,
}

impl Engine {
    /// Build every service. The worker pool is created but not started.
    pub fn new(deps: EngineDeps) -> Self {
        let EngineDeps {
            tasks,
            admin_tasks,
            ledger_store,
            provider,
            storage,
            fetcher,
            signal,
            settings,
        } = deps;

        let ledger = Arc::new(CreditLedger::new(
            tasks.clone(),
            ledger_store,
            settings.credit_cost,
        ));
        let materializer = Arc::new(Materializer::new(
            tasks.clone(),
            storage,
            fetcher,
            settings.materialize_batch_limit,
            settings.materialize_concurrency,
        ));
        let executor = Arc::new(Executor::new(
            tasks.clone(),
            ledger.clone(),
            provider,
            materializer.clone(),
            signal.clone(),
            settings.provider_mode,
            settings.provider_timeout,
        ));
        let pool = Arc::new(WorkerPool::new(
            executor.clone(),
            settings.max_concurrent_tasks,
        ));
        let submission = Arc::new(SubmissionService::new(
            tasks.clone(),
            ledger.clone(),
            pool.clone(),
            settings.limits.clone(),
            settings.require_balance_on_submit,
        ));
        let cancellation = Arc::new(CancellationService::new(
            tasks.clone(),
            admin_tasks.clone(),
            ledger.clone(),
            signal.clone(),
            settings.cancel_confirm_attempts,
            settings.cancel_confirm_delay,
        ));
        let reaper = Arc::new(Reaper::new(
            admin_tasks,
            ledger.clone(),
            signal.clone(),
            Some(pool.clone()),
            settings.stuck_after,
        ));
        let progress = ProgressReporter::new(settings.typical_generation, settings.provider_timeout);

        Self {
            tasks,
            signal,
            ledger,
            submission,
            cancellation,
            executor,
            pool,
            reaper,
            materializer,
            progress,
            settings,
        }
    }

    /// Start the worker pool and, optionally, the periodic sweeps.
    pub fn start(&self, sweeps: bool, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.pool.start();
        if !sweeps {
            return Vec::new();
        }
        vec![
            self.reaper
                .clone()
                .spawn(self.settings.reaper_interval, shutdown.clone()),
            self.materializer
                .clone()
                .spawn(self.settings.materialize_interval, shutdown),
        ]
    }
}
