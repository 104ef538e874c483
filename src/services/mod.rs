pub mod audit;
pub mod cancellation;
pub mod chain;
pub mod executor;
pub mod extract;
pub mod ledger;
pub mod materializer;
pub mod pool;
pub mod progress;
pub mod provider;
pub mod reaper;
pub mod retry;
pub mod signal;
pub mod storage;
pub mod submission;
