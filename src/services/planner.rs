use crate::config::TransferConfig;
use crate::error::StageError;
use crate::models::{SourceCompression, TransferOptions};
use crate::services::compress::{GZIP_SUFFIX, is_gzip};
use crate::services::storage::RemoteObject;
use crate::utils::pattern;
use std::path::Path;

/// Execution strategy for one file upload. Pure output of the planner; the
/// executor performs all I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    /// Local basename, as reported in the outcome row
    pub file_name: String,
    /// Object basename on the stage (compression suffix applied)
    pub remote_file_name: String,
    /// Compress before upload
    pub compress: bool,
    pub part_size: usize,
    /// Payloads at or above this size are uploaded in parts
    pub multipart_threshold: u64,
    /// Concurrent part uploads for this file
    pub parallelism: usize,
}

/// Worker count for a request, bounded by configuration. Never zero.
pub fn effective_parallelism(options: &TransferOptions, config: &TransferConfig) -> usize {
    options
        .parallelism
        .unwrap_or(config.default_parallelism)
        .clamp(1, config.max_parallelism)
}

/// Decides compression, remote naming, and part sizing for one local file.
/// Deterministic given its inputs; does no I/O.
pub fn plan_upload(
    path: &Path,
    head: &[u8],
    options: &TransferOptions,
    config: &TransferConfig,
) -> Result<UploadPlan, StageError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StageError::Parse(format!("invalid file path: {}", path.display())))?
        .to_string();

    let already_compressed = match options.source_compression {
        Some(SourceCompression::Gzip) => true,
        Some(SourceCompression::None) => false,
        None => is_gzip(head) || file_name.ends_with(GZIP_SUFFIX),
    };
    let compress = options.auto_compress && !already_compressed;

    let remote_file_name = if compress {
        format!("{}{}", file_name, GZIP_SUFFIX)
    } else {
        file_name.clone()
    };

    Ok(UploadPlan {
        file_name,
        remote_file_name,
        compress,
        part_size: config.part_size,
        multipart_threshold: config.multipart_threshold,
        parallelism: effective_parallelism(options, config),
    })
}

/// Selects download candidates from a stage listing, in listing order. The
/// pattern matches the object basename, not the full key.
pub fn plan_download(
    listing: Vec<RemoteObject>,
    name_pattern: Option<&str>,
) -> Result<Vec<RemoteObject>, StageError> {
    let Some(raw) = name_pattern else {
        return Ok(listing);
    };
    let matcher = pattern::compile_name_pattern(raw)?;
    Ok(listing
        .into_iter()
        .filter(|obj| {
            let base = obj.key.rsplit('/').next().unwrap_or(&obj.key);
            matcher.is_match(base)
        })
        .collect())
}
