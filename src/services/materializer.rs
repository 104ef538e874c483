//! Re-hosts ephemeral provider results in durable object storage.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::db::{StoreError, TaskStore};
use crate::models::task::{Actor, Task, TaskLogEntry, TaskStatus};
use crate::services::audit;
use crate::services::extract::host_matches;
use crate::services::storage::{ObjectStorage, StorageError};

/// Query parameters that mark a signed, expiring URL.
const EXPIRY_PARAMS: &[&str] = &[
    "x-amz-signature",
    "x-amz-expires",
    "x-goog-signature",
    "x-goog-expires",
    "expires",
    "signature",
    "sig",
    "se",
    "st",
    "sp",
    "token",
];

/// Provider hosts whose URLs expire regardless of query string.
const EPHEMERAL_HOSTS: &[&str] = &[
    "oaidalleapiprodscus.blob.core.windows.net",
    "blob.core.windows.net",
    "files.oaiusercontent.com",
    "replicate.delivery",
];

/// Whether a provider locator is expected to stop resolving.
pub fn is_ephemeral(locator: &str) -> bool {
    let Ok(url) = Url::parse(locator) else {
        return false;
    };
    if url
        .host_str()
        .is_some_and(|host| host_matches(host, EPHEMERAL_HOSTS))
    {
        return true;
    }
    url.query_pairs()
        .any(|(name, _)| EXPIRY_PARAMS.contains(&name.to_ascii_lowercase().as_str()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeOutcome {
    Stored(String),
    Unchanged,
}

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("result is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct FetchedResult {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ResultFetcher: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<FetchedResult, MaterializeError>;
}

pub struct HttpFetcher {
    http: Client,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, MaterializeError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MaterializeError::Fetch(e.to_string()))?;
        Ok(Self { http, max_bytes })
    }
}

#[async_trait]
impl ResultFetcher for HttpFetcher {
    async fn fetch(&self, locator: &str) -> Result<FetchedResult, MaterializeError> {
        let fetch_err = |e: reqwest::Error| MaterializeError::Fetch(e.to_string());

        let response = self
            .http
            .get(locator)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(fetch_err)?;

        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(MaterializeError::TooLarge {
                    size: len as usize,
                    limit: self.max_bytes,
                });
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await.map_err(fetch_err)?;
        if bytes.len() > self.max_bytes {
            return Err(MaterializeError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }

        Ok(FetchedResult {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// Counts from one batch sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaterializeReport {
    pub scanned: usize,
    pub stored: usize,
    pub unchanged: usize,
    pub failed: usize,
}

pub struct Materializer {
    tasks: Arc<dyn TaskStore>,
    storage: Arc<dyn ObjectStorage>,
    fetcher: Arc<dyn ResultFetcher>,
    batch_limit: i64,
    concurrency: usize,
}

impl Materializer {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        storage: Arc<dyn ObjectStorage>,
        fetcher: Arc<dyn ResultFetcher>,
        batch_limit: i64,
        concurrency: usize,
    ) -> Self {
        Self {
            tasks,
            storage,
            fetcher,
            batch_limit,
            concurrency: concurrency.max(1),
        }
    }

    /// Re-host one completed task's result. Already-marked tasks are left alone.
    pub async fn materialize(&self, task: &Task) -> Result<MaterializeOutcome, MaterializeError> {
        if task.status != TaskStatus::Completed || task.materialized_at.is_some() {
            return Ok(MaterializeOutcome::Unchanged);
        }
        let Some(locator) = task.provider_result_ref.as_deref() else {
            return Ok(MaterializeOutcome::Unchanged);
        };

        if !is_ephemeral(locator) {
            let current = task.result_ref.as_deref().unwrap_or(locator);
            self.tasks.set_materialized(task.id, current).await?;
            return Ok(MaterializeOutcome::Unchanged);
        }

        let fetched = self.fetcher.fetch(locator).await?;
        let (extension, content_type) = detect_format(&fetched);
        let key = object_key(task, extension);
        let stable = self.storage.put(&key, &fetched.bytes, &content_type).await?;

        if !self.tasks.set_materialized(task.id, &stable).await? {
            tracing::debug!(task_id = %task.id, "Result already materialized by another run");
            return Ok(MaterializeOutcome::Unchanged);
        }

        metrics::counter!("results_materialized_total").increment(1);
        tracing::info!(
            task_id = %task.id,
            owner_id = %task.owner_id,
            key = %key,
            bytes = fetched.bytes.len(),
            "Result materialized"
        );
        audit::record(
            self.tasks.as_ref(),
            TaskLogEntry::note(task.id, Actor::Materializer, format!("result stored at {stable}")),
        )
        .await;

        Ok(MaterializeOutcome::Stored(stable))
    }

    /// Materialize up to `batch_limit` completed tasks, a few at a time.
    pub async fn sweep(&self) -> Result<MaterializeReport, StoreError> {
        let candidates = self.tasks.list_unmaterialized(self.batch_limit).await?;
        let mut report = MaterializeReport {
            scanned: candidates.len(),
            ..Default::default()
        };

        let results: Vec<_> = stream::iter(candidates)
            .map(|task| async move {
                let result = self.materialize(&task).await;
                (task.id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (task_id, result) in results {
            match result {
                Ok(MaterializeOutcome::Stored(_)) => report.stored += 1,
                Ok(MaterializeOutcome::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(task_id = %task_id, error = %e, "Materialization failed");
                }
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                stored = report.stored,
                unchanged = report.unchanged,
                failed = report.failed,
                "Materialization sweep finished"
            );
        }
        Ok(report)
    }

    /// Runs `sweep` every `period` until `shutdown` flips to `true`. The flag
    /// is level-triggered, so a signal sent mid-sweep is still seen.
    pub fn spawn(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                        tracing::info!("Materializer received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::error!(error = %e, "Materialization sweep failed");
                        }
                    }
                }
            }
        })
    }
}

fn detect_format(fetched: &FetchedResult) -> (&'static str, String) {
    let declared = fetched
        .content_type
        .as_deref()
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase());

    let from_header = match declared.as_deref() {
        Some("image/png") => Some("png"),
        Some("image/jpeg") | Some("image/jpg") => Some("jpg"),
        Some("image/webp") => Some("webp"),
        Some("image/gif") => Some("gif"),
        _ => None,
    };
    if let (Some(ext), Some(ct)) = (from_header, declared.clone()) {
        return (ext, ct);
    }

    match image::guess_format(&fetched.bytes) {
        Ok(image::ImageFormat::Png) => ("png", "image/png".into()),
        Ok(image::ImageFormat::Jpeg) => ("jpg", "image/jpeg".into()),
        Ok(image::ImageFormat::WebP) => ("webp", "image/webp".into()),
        Ok(image::ImageFormat::Gif) => ("gif", "image/gif".into()),
        _ => ("bin", "application/octet-stream".into()),
    }
}

/// `owner/task/timestamp.ext`, stable for a given task.
fn object_key(task: &Task, extension: &str) -> String {
    let owner: String = task
        .owner_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let stamp = task.completed_at.unwrap_or(task.created_at).timestamp();
    format!("{owner}/{}/{stamp}.{extension}", task.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    #[test]
    fn test_signed_urls_are_ephemeral() {
        assert!(is_ephemeral(
            "https://bucket.s3.amazonaws.com/a.png?X-Amz-Expires=3600&X-Amz-Signature=abc"
        ));
        assert!(is_ephemeral(
            "https://oaidalleapiprodscus.blob.core.windows.net/private/img.png"
        ));
        assert!(is_ephemeral("https://cdn.acme.io/a.png?se=2026-01-01&sig=xyz"));
    }

    #[test]
    fn test_plain_urls_are_not_ephemeral() {
        assert!(!is_ephemeral("https://media.acme.io/alice/1/2.png"));
        assert!(!is_ephemeral("https://cdn.acme.io/a.png?v=2"));
        assert!(!is_ephemeral("not a url"));
    }

    #[test]
    fn test_format_from_header_then_magic_bytes() {
        let declared = FetchedResult {
            bytes: vec![0, 1, 2],
            content_type: Some("image/webp; charset=binary".into()),
        };
        assert_eq!(detect_format(&declared), ("webp", "image/webp".to_string()));

        let sniffed = FetchedResult {
            bytes: b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec(),
            content_type: Some("application/octet-stream".into()),
        };
        assert_eq!(detect_format(&sniffed), ("png", "image/png".to_string()));
    }

    #[test]
    fn test_object_key_is_deterministic() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut task = crate::models::task::NewTask {
            id: Uuid::nil(),
            owner_id: "user/42".into(),
            input: crate::models::task::TaskInput::from_prompt("x"),
        }
        .into_task(now);
        task.completed_at = Some(now);

        let key = object_key(&task, "png");
        assert_eq!(key, format!("user_42/{}/{}.png", Uuid::nil(), now.timestamp()));
        assert_eq!(key, object_key(&task, "png"));
    }
}
