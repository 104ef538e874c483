//! Task lifecycle and credit ledger engine for image generation jobs.
//!
//! Tasks are submitted over HTTP, executed against an external provider by an
//! in-process worker pool, and driven to exactly one terminal state by racing
//! writers (executor, cancellation, reaper) that only use conditional updates.
//! Credits are charged once on success and refunded at most once.

pub mod app_state;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
