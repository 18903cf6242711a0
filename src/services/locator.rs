use crate::error::StageError;
use crate::models::{StageLocation, StorageProvider};

/// Parses the control-plane's stage location descriptor.
///
/// The descriptor is `bucket[/path...]`; everything before the first '/'
/// is the bucket or container, the remainder the object-key prefix. The
/// prefix is normalized to end with '/' so that later concatenation with a
/// file basename (plus an optional compression suffix) can never produce a
/// key outside the stage namespace.
pub fn parse(location_type: &str, descriptor: &str) -> Result<StageLocation, StageError> {
    let provider = match location_type.to_ascii_uppercase().as_str() {
        "S3" => StorageProvider::S3,
        "GCS" => StorageProvider::Gcs,
        "AZURE" => StorageProvider::Azure,
        other => {
            return Err(StageError::Parse(format!(
                "unknown stage location type: {}",
                other
            )));
        }
    };

    let trimmed = descriptor.trim();
    if trimmed.is_empty() {
        return Err(StageError::Parse("empty stage location".to_string()));
    }

    let (bucket, path) = match trimmed.split_once('/') {
        Some((bucket, path)) => (bucket, path),
        None => (trimmed, ""),
    };
    if bucket.is_empty() {
        return Err(StageError::Parse(format!(
            "stage location has no bucket: {}",
            descriptor
        )));
    }

    let mut prefix = path.trim_start_matches('/').to_string();
    if !prefix.is_empty() && !prefix.ends_with('/') {
        prefix.push('/');
    }

    Ok(StageLocation {
        provider,
        bucket: bucket.to_string(),
        prefix,
    })
}
