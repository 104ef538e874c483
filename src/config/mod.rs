use serde::Deserialize;
use std::time::Duration;

use crate::models::task::InputLimits;
use crate::services::provider::ProviderMode;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Ignored by the sweeper.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string for the application role
    pub database_url: String,

    /// PostgreSQL connection string for the privileged role used by the
    /// reaper and forced cancellations. Defaults to `database_url`.
    pub database_admin_url: Option<String>,

    /// Redis connection string. When set, cancel notices are shared across processes.
    pub redis_url: Option<String>,

    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,

    pub provider_api_key: String,

    #[serde(default = "default_chat_model")]
    pub provider_chat_model: String,

    #[serde(default = "default_image_model")]
    pub provider_image_model: String,

    #[serde(default)]
    pub provider_mode: ProviderMode,

    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// Public base URL objects in the bucket are served from
    pub r2_public_url: String,

    /// HS256 secret for bearer tokens
    pub jwt_secret: String,

    #[serde(default = "default_credit_cost")]
    pub credit_cost_per_task: i64,

    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,

    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,

    #[serde(default = "default_materialize_interval_secs")]
    pub materialize_interval_secs: u64,

    #[serde(default = "default_materialize_batch_limit")]
    pub materialize_batch_limit: i64,

    #[serde(default = "default_materialize_concurrency")]
    pub materialize_concurrency: usize,

    #[serde(default = "default_cancel_confirm_attempts")]
    pub cancel_confirm_attempts: u32,

    #[serde(default = "default_cancel_confirm_delay_ms")]
    pub cancel_confirm_delay_ms: u64,

    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,

    #[serde(default = "default_max_reference_image_bytes")]
    pub max_reference_image_bytes: usize,

    #[serde(default = "default_true")]
    pub require_balance_on_submit: bool,

    /// Run the reaper and materializer loops inside the API server.
    #[serde(default = "default_true")]
    pub embedded_sweeps: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_provider_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o".to_string()
}

fn default_image_model() -> String {
    "dall-e-3".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    180
}

fn default_credit_cost() -> i64 {
    1
}

fn default_max_concurrent_tasks() -> usize {
    8
}

fn default_reaper_interval_secs() -> u64 {
    300
}

fn default_stuck_after_secs() -> u64 {
    1800
}

fn default_materialize_interval_secs() -> u64 {
    600
}

fn default_materialize_batch_limit() -> i64 {
    100
}

fn default_materialize_concurrency() -> usize {
    3
}

fn default_cancel_confirm_attempts() -> u32 {
    3
}

fn default_cancel_confirm_delay_ms() -> u64 {
    200
}

fn default_max_prompt_chars() -> usize {
    2000
}

fn default_max_reference_image_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn admin_database_url(&self) -> &str {
        self.database_admin_url.as_deref().unwrap_or(&self.database_url)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            provider_mode: self.provider_mode,
            provider_timeout: Duration::from_secs(self.provider_timeout_secs),
            credit_cost: self.credit_cost_per_task,
            max_concurrent_tasks: self.max_concurrent_tasks,
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
            stuck_after: Duration::from_secs(self.stuck_after_secs),
            materialize_interval: Duration::from_secs(self.materialize_interval_secs),
            materialize_batch_limit: self.materialize_batch_limit,
            materialize_concurrency: self.materialize_concurrency,
            cancel_confirm_attempts: self.cancel_confirm_attempts,
            cancel_confirm_delay: Duration::from_millis(self.cancel_confirm_delay_ms),
            limits: InputLimits {
                max_prompt_chars: self.max_prompt_chars,
                max_reference_image_bytes: self.max_reference_image_bytes,
            },
            require_balance_on_submit: self.require_balance_on_submit,
            ..EngineSettings::default()
        }
    }
}

/// Typed engine knobs derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub provider_mode: ProviderMode,
    pub provider_timeout: Duration,
    /// Used for remaining-time estimates before a task reports progress.
    pub typical_generation: Duration,
    pub credit_cost: i64,
    pub max_concurrent_tasks: usize,
    pub reaper_interval: Duration,
    pub stuck_after: Duration,
    pub materialize_interval: Duration,
    pub materialize_batch_limit: i64,
    pub materialize_concurrency: usize,
    pub cancel_confirm_attempts: u32,
    pub cancel_confirm_delay: Duration,
    pub limits: InputLimits,
    pub require_balance_on_submit: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            provider_mode: ProviderMode::ConversationalFirst,
            provider_timeout: Duration::from_secs(default_provider_timeout_secs()),
            typical_generation: Duration::from_secs(45),
            credit_cost: default_credit_cost(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            reaper_interval: Duration::from_secs(default_reaper_interval_secs()),
            stuck_after: Duration::from_secs(default_stuck_after_secs()),
            materialize_interval: Duration::from_secs(default_materialize_interval_secs()),
            materialize_batch_limit: default_materialize_batch_limit(),
            materialize_concurrency: default_materialize_concurrency(),
            cancel_confirm_attempts: default_cancel_confirm_attempts(),
            cancel_confirm_delay: Duration::from_millis(default_cancel_confirm_delay_ms()),
            limits: InputLimits::default(),
            require_balance_on_submit: true,
        }
    }
}
