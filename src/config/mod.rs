use serde::Deserialize;

/// Process configuration, read from the environment (and `.env` if present).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address. Unused by standalone worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for the job store. The server falls back to an
    /// in-process store when unset.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Workers started by each dispatcher.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Run a dispatcher inside the API server process.
    #[serde(default = "default_true")]
    pub embedded_workers: bool,

    #[serde(default = "default_max_stage_attempts")]
    pub max_stage_attempts: u32,

    /// Upper bound on a single executor call.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// Delay before retrying a failed stage, multiplied by the attempt number.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Retention of job records and blobs in Redis.
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    #[serde(default = "default_min_import_chars")]
    pub min_import_chars: usize,

    /// OpenAI-compatible API root.
    #[serde(default = "default_ai_base_url")]
    pub ai_base_url: String,

    pub ai_api_key: String,

    #[serde(default = "default_ai_model")]
    pub ai_model: String,

    /// Rate-limit retries inside a single AI call.
    #[serde(default = "default_ai_max_retries")]
    pub ai_max_retries: u32,

    /// Document text extraction service.
    pub extraction_url: String,

    /// PDF/DOCX rendering service.
    pub renderer_url: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_worker_count() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_max_stage_attempts() -> u32 {
    3
}

fn default_stage_timeout_secs() -> u64 {
    540
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_job_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_min_import_chars() -> usize {
    50
}

fn default_ai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ai_model() -> String {
    "gpt-4o".to_string()
}

fn default_ai_max_retries() -> u32 {
    5
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
