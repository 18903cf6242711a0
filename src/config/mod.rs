use std::env;

/// Tuning knobs for staged transfers
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Hard cap on concurrent workers per request (default: 64)
    pub max_parallelism: usize,

    /// Parallelism used when the request does not ask for one (default: 4)
    pub default_parallelism: usize,

    /// Size of one multipart upload part in bytes (default: 8 MiB)
    pub part_size: usize,

    /// Files at or above this size go through multipart upload (default: 64 MiB)
    pub multipart_threshold: u64,

    /// Attempts per storage call before giving up (default: 3)
    pub retry_attempts: u32,

    /// Base backoff between retries in milliseconds, doubled per attempt (default: 100)
    pub retry_backoff_ms: u64,

    /// Lifetime assumed for a scoped credential when the control-plane
    /// response carries no expiry, in seconds (default: 3600)
    pub credential_ttl_secs: i64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 64,
            default_parallelism: 4,
            part_size: 8 * 1024 * 1024,            // 8 MiB
            multipart_threshold: 64 * 1024 * 1024, // 64 MiB
            retry_attempts: 3,
            retry_backoff_ms: 100,
            credential_ttl_secs: 3600,
        }
    }
}

impl TransferConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_parallelism: env::var("STAGE_MAX_PARALLELISM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_parallelism),

            default_parallelism: env::var("STAGE_DEFAULT_PARALLELISM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.default_parallelism),

            part_size: env::var("STAGE_PART_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.part_size),

            multipart_threshold: env::var("STAGE_MULTIPART_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.multipart_threshold),

            retry_attempts: env::var("STAGE_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.retry_attempts),

            retry_backoff_ms: env::var("STAGE_RETRY_BACKOFF_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.retry_backoff_ms),

            credential_ttl_secs: env::var("STAGE_CREDENTIAL_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.credential_ttl_secs),
        }
    }
}
