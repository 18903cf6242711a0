use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Temporary, scoped object-storage credential issued by the control-plane.
///
/// The value is opaque and time-bounded: the storage layer rejects anything
/// outside the path prefix it was minted for, and anything after
/// `expires_at`. One credential is shared read-only across every worker of
/// a single transfer request; a refresh is a brand new value, never an
/// in-place mutation.
#[derive(Clone, PartialEq, Eq)]
pub struct StageCredential {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Session token; required by S3 scoped credentials. `None` models a
    /// credential the provider will refuse.
    pub session_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StageCredential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => now >= at,
            None => false,
        }
    }
}

// Secrets stay out of logs. Only the access key id is printable.
impl fmt::Debug for StageCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageCredential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"****")
            .field("session_token", &self.session_token.as_ref().map(|_| "****"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Cloud provider backing a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageProvider {
    S3,
    Gcs,
    Azure,
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageProvider::S3 => write!(f, "S3"),
            StorageProvider::Gcs => write!(f, "GCS"),
            StorageProvider::Azure => write!(f, "AZURE"),
        }
    }
}

/// Resolved storage target of a stage. Derived once per transfer session
/// from the control-plane response; immutable after parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLocation {
    pub provider: StorageProvider,
    pub bucket: String,
    /// Object-key prefix, empty or ending with '/'. Every key used for this
    /// stage is `prefix` + basename, so transfers cannot walk outside the
    /// stage namespace.
    pub prefix: String,
}

impl StageLocation {
    /// Object key for a file staged under this location.
    pub fn key_for(&self, file_name: &str) -> String {
        format!("{}{}", self.prefix, file_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Compression state of a local source file, either declared by the caller
/// or sniffed from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCompression {
    None,
    Gzip,
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Gzip files before upload unless they are already compressed
    pub auto_compress: bool,
    /// Requested worker count; capped by `TransferConfig::max_parallelism`
    pub parallelism: Option<usize>,
    /// Regex filtering remote object names on download
    pub name_pattern: Option<String>,
    /// Re-upload files that already exist on the stage
    pub overwrite: bool,
    /// Caller-declared source compression; detected from content when `None`
    pub source_compression: Option<SourceCompression>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            auto_compress: true,
            parallelism: None,
            name_pattern: None,
            overwrite: false,
            source_compression: None,
        }
    }
}

/// One PUT or GET as issued by the caller. `source` is a local path or
/// wildcard pattern for uploads, and the target directory for downloads.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: PathBuf,
    pub stage_ref: String,
    pub direction: TransferDirection,
    pub options: TransferOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    #[serde(rename = "UPLOADED")]
    Uploaded,
    #[serde(rename = "DOWNLOADED")]
    Downloaded,
    #[serde(rename = "SKIPPED")]
    Skipped,
    #[serde(rename = "ERROR")]
    Error,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Uploaded => write!(f, "UPLOADED"),
            TransferStatus::Downloaded => write!(f, "DOWNLOADED"),
            TransferStatus::Skipped => write!(f, "SKIPPED"),
            TransferStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Per-file result row. Exactly one per file touched by a request,
/// immutable once returned.
#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub file_name: String,
    pub source_size: u64,
    pub target_size: u64,
    pub status: TransferStatus,
    /// Empty on success
    pub error_message: String,
    /// SHA-256 of the bytes actually sent, hex encoded; `None` for
    /// skipped or failed files
    pub digest: Option<String>,
}

impl TransferOutcome {
    pub fn error(file_name: impl Into<String>, source_size: u64, message: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            source_size,
            target_size: 0,
            status: TransferStatus::Error,
            error_message: message.into(),
            digest: None,
        }
    }

    pub fn skipped(file_name: impl Into<String>, source_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            source_size,
            target_size: 0,
            status: TransferStatus::Skipped,
            error_message: String::new(),
            digest: None,
        }
    }
}
