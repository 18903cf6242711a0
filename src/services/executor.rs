use crate::config::TransferConfig;
use crate::error::StageError;
use crate::models::{
    StageCredential, StageLocation, TransferOptions, TransferOutcome, TransferStatus,
};
use crate::services::compress::PartReader;
use crate::services::planner::{self, UploadPlan};
use crate::services::storage::{RemoteObject, StageStorage};
use crate::utils::digest::sha256_hex;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Performs the storage I/O for one transfer request through a bounded
/// worker pool. Files are independent units of work: one file failing after
/// retries becomes an ERROR outcome without disturbing its siblings.
/// Outcomes carry their dispatch index so the reporter can restore
/// deterministic ordering.
pub struct TransferExecutor {
    storage: Arc<dyn StageStorage>,
    config: TransferConfig,
    cancel: CancellationToken,
}

impl TransferExecutor {
    pub fn new(
        storage: Arc<dyn StageStorage>,
        config: TransferConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            storage,
            config,
            cancel,
        }
    }

    /// Uploads the expanded file set, returning `(input_index, outcome)`
    /// pairs in completion order.
    pub async fn upload_files(
        &self,
        files: Vec<PathBuf>,
        location: &StageLocation,
        credential: &Arc<StageCredential>,
        options: &TransferOptions,
    ) -> Vec<(usize, TransferOutcome)> {
        let parallelism = planner::effective_parallelism(options, &self.config);

        stream::iter(files.into_iter().enumerate())
            .map(|(idx, path)| {
                let credential = Arc::clone(credential);
                async move {
                    let outcome = match self
                        .upload_one(&path, location, &credential, options)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            let file_name = path
                                .file_name()
                                .and_then(|n| n.to_str())
                                .unwrap_or_default()
                                .to_string();
                            tracing::warn!(file = %file_name, error = %err, "upload failed");
                            let size = tokio::fs::metadata(&path)
                                .await
                                .map(|m| m.len())
                                .unwrap_or(0);
                            TransferOutcome::error(file_name, size, err.to_string())
                        }
                    };
                    (idx, outcome)
                }
            })
            .buffer_unordered(parallelism)
            .collect()
            .await
    }

    /// Downloads the selected objects into `target_dir`, returning
    /// `(listing_index, outcome)` pairs in completion order.
    pub async fn download_objects(
        &self,
        objects: Vec<RemoteObject>,
        location: &StageLocation,
        credential: &Arc<StageCredential>,
        options: &TransferOptions,
        target_dir: &Path,
    ) -> Vec<(usize, TransferOutcome)> {
        let parallelism = planner::effective_parallelism(options, &self.config);

        stream::iter(objects.into_iter().enumerate())
            .map(|(idx, object)| {
                let credential = Arc::clone(credential);
                async move {
                    let file_name = object
                        .key
                        .rsplit('/')
                        .next()
                        .unwrap_or(&object.key)
                        .to_string();
                    let outcome = match self
                        .download_one(&object, location, &credential, target_dir)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            tracing::warn!(file = %file_name, error = %err, "download failed");
                            TransferOutcome::error(file_name, object.size, err.to_string())
                        }
                    };
                    (idx, outcome)
                }
            })
            .buffer_unordered(parallelism)
            .collect()
            .await
    }

    /// Lists the stage contents with the same retry policy as transfers.
    pub async fn list_stage(
        &self,
        location: &StageLocation,
        credential: &StageCredential,
    ) -> Result<Vec<RemoteObject>, StageError> {
        self.ensure_active()?;
        ensure_live(credential)?;
        self.with_retries("list_objects", || {
            self.storage
                .list_objects(&location.bucket, &location.prefix, credential)
        })
        .await
    }

    async fn upload_one(
        &self,
        path: &Path,
        location: &StageLocation,
        credential: &StageCredential,
        options: &TransferOptions,
    ) -> Result<TransferOutcome, StageError> {
        self.ensure_active()?;
        let source_size = tokio::fs::metadata(path).await?.len();

        let mut head = [0u8; 4];
        let head_len = {
            let mut file = tokio::fs::File::open(path).await?;
            let mut filled = 0;
            while filled < head.len() {
                let n = file.read(&mut head[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            filled
        };
        let plan = planner::plan_upload(path, &head[..head_len], options, &self.config)?;
        let key = location.key_for(&plan.remote_file_name);

        if !options.overwrite {
            ensure_live(credential)?;
            let exists = self
                .with_retries("object_exists", || {
                    self.storage.object_exists(&location.bucket, &key, credential)
                })
                .await?;
            if exists {
                tracing::info!(file = %plan.file_name, key = %key, "already staged, skipping");
                return Ok(TransferOutcome::skipped(plan.file_name, source_size));
            }
        }

        // Stream the payload in parts, buffering only up to the multipart
        // threshold before choosing between single-shot and multipart. The
        // payload size is not knowable up front when compressing.
        let mut reader = {
            let path = path.to_owned();
            let compress = plan.compress;
            let part_size = plan.part_size;
            run_blocking(move || PartReader::open(&path, compress, part_size)).await?
        };
        let mut head_parts: Vec<Bytes> = Vec::new();
        let mut buffered: u64 = 0;
        while buffered < plan.multipart_threshold && !reader.finished() {
            let (returned, part) = run_blocking(move || {
                let mut reader = reader;
                let part = reader.next_part()?;
                Ok((reader, part))
            })
            .await?;
            reader = returned;
            match part {
                Some(data) => {
                    buffered += data.len() as u64;
                    head_parts.push(Bytes::from(data));
                }
                None => break,
            }
        }

        self.ensure_active()?;
        ensure_live(credential)?;
        let (target_size, digest) = if reader.finished() && buffered < plan.multipart_threshold {
            let summary = reader.into_summary();
            let payload = match head_parts.len() {
                0 => Bytes::new(),
                1 => head_parts.remove(0),
                _ => {
                    let mut whole = Vec::with_capacity(buffered as usize);
                    for part in &head_parts {
                        whole.extend_from_slice(part);
                    }
                    Bytes::from(whole)
                }
            };
            self.with_retries("upload_object", || {
                self.storage
                    .upload_object(&location.bucket, &key, payload.clone(), credential)
            })
            .await?;
            summary
        } else {
            self.upload_multipart(&plan, &key, head_parts, reader, location, credential)
                .await?
        };

        tracing::info!(
            file = %plan.file_name,
            key = %key,
            source_size,
            target_size,
            "uploaded"
        );
        Ok(TransferOutcome {
            file_name: plan.file_name,
            source_size,
            target_size,
            status: TransferStatus::Uploaded,
            error_message: String::new(),
            digest: Some(digest),
        })
    }

    /// Concurrent multipart upload fed by a streaming producer: parts are
    /// read (and compressed) on a blocking worker and handed over a bounded
    /// channel, so only a window of parts is ever in memory. Any part
    /// failing after retries, a source read error, or a request
    /// cancellation aborts the whole upload so no partial object is ever
    /// marked complete. Returns the payload size and digest.
    async fn upload_multipart(
        &self,
        plan: &UploadPlan,
        key: &str,
        head_parts: Vec<Bytes>,
        reader: PartReader,
        location: &StageLocation,
        credential: &StageCredential,
    ) -> Result<(u64, String), StageError> {
        let upload_id = self
            .with_retries("begin_multipart", || {
                self.storage.begin_multipart(&location.bucket, key, credential)
            })
            .await?;
        tracing::debug!(key, parallelism = plan.parallelism, "multipart upload started");

        let (tx, rx) = mpsc::channel::<Bytes>(plan.parallelism);
        let producer = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            while let Some(part) = reader.next_part()? {
                // A refused send means the upload failed or was cancelled.
                if tx.blocking_send(Bytes::from(part)).is_err() {
                    break;
                }
            }
            Ok::<_, StageError>(reader.into_summary())
        });

        let parts_result = {
            let streamed = stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|part| (part, rx))
            });
            let upload_parts = stream::iter(head_parts)
                .chain(streamed)
                .enumerate()
                .map(|(part_idx, body)| {
                    let part_number = (part_idx + 1) as i32;
                    let upload_id = upload_id.as_str();
                    async move {
                        self.ensure_active()?;
                        ensure_live(credential)?;
                        let etag = self
                            .with_retries("upload_part", || {
                                self.storage.upload_part(
                                    &location.bucket,
                                    key,
                                    upload_id,
                                    part_number,
                                    body.clone(),
                                    credential,
                                )
                            })
                            .await?;
                        Ok::<(i32, String), StageError>((part_number, etag))
                    }
                })
                .buffer_unordered(plan.parallelism)
                .collect::<Vec<_>>();

            tokio::select! {
                results = upload_parts => {
                    results.into_iter().collect::<Result<Vec<_>, _>>()
                }
                _ = self.cancel.cancelled() => {
                    Err(StageError::Cancelled("request cancelled".to_string()))
                }
            }
        };

        let finished = match parts_result {
            Ok(parts) => producer
                .await
                .map_err(|e| StageError::Transfer(format!("part producer failed: {}", e)))
                .and_then(|summary| summary)
                .map(|summary| (parts, summary)),
            Err(err) => Err(err),
        };

        let (mut parts, summary) = match finished {
            Ok(done) => done,
            Err(err) => {
                // Best effort: leave nothing behind.
                if let Err(abort_err) = self
                    .storage
                    .abort_multipart(&location.bucket, key, &upload_id, credential)
                    .await
                {
                    tracing::warn!(key, error = %abort_err, "failed to abort multipart upload");
                }
                return Err(err);
            }
        };
        parts.sort_by_key(|(number, _)| *number);

        self.with_retries("complete_multipart", || {
            self.storage.complete_multipart(
                &location.bucket,
                key,
                &upload_id,
                parts.clone(),
                credential,
            )
        })
        .await?;
        Ok(summary)
    }

    async fn download_one(
        &self,
        object: &RemoteObject,
        location: &StageLocation,
        credential: &StageCredential,
        target_dir: &Path,
    ) -> Result<TransferOutcome, StageError> {
        self.ensure_active()?;
        let file_name = object
            .key
            .rsplit('/')
            .next()
            .unwrap_or(&object.key)
            .to_string();

        ensure_live(credential)?;
        let data = self
            .with_retries("download_object", || {
                self.storage
                    .download_object(&location.bucket, &object.key, credential)
            })
            .await?;

        let target = target_dir.join(&file_name);
        tokio::fs::write(&target, &data).await?;

        tracing::info!(file = %file_name, size = data.len(), "downloaded");
        Ok(TransferOutcome {
            file_name,
            source_size: object.size,
            target_size: data.len() as u64,
            status: TransferStatus::Downloaded,
            error_message: String::new(),
            digest: Some(sha256_hex(&data)),
        })
    }

    /// Bounded retry with doubling backoff. Only Transfer-class errors are
    /// retried; Authorization and NotFound are surfaced immediately.
    async fn with_retries<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.config.retry_attempts => {
                    let backoff = backoff_delay(self.config.retry_backoff_ms, attempt);
                    tracing::warn!(
                        op,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying storage call"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Session-level cancellation check; every dispatched unit of work
    /// passes through here so close() halts still-queued files, not just
    /// in-flight multipart uploads.
    fn ensure_active(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            return Err(StageError::Cancelled("transfer cancelled".to_string()));
        }
        Ok(())
    }
}

/// Doubling backoff, capped so a large configured attempt count cannot
/// overflow the multiplier.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << (attempt - 1).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

async fn run_blocking<T, F>(task: F) -> Result<T, StageError>
where
    F: FnOnce() -> Result<T, StageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| StageError::Transfer(format!("blocking task failed: {}", e)))?
}

fn ensure_live(credential: &StageCredential) -> Result<(), StageError> {
    if credential.is_expired(Utc::now()) {
        return Err(StageError::Authorization(
            "stage credential has expired".to_string(),
        ));
    }
    Ok(())
}
