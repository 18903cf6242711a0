//! Staged file transfer subsystem for a database client.
//!
//! A stage is a named storage location managed by the database service
//! (the control-plane). Uploading to or downloading from a stage is a
//! four-step pipeline: resolve the stage's storage target, obtain a
//! short-lived scoped credential from the control-plane, plan the transfer
//! (compression, parts, parallelism), then execute it against the storage
//! capability and report one outcome row per file.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::TransferConfig;
use crate::error::StageError;
use crate::models::{TransferDirection, TransferOutcome, TransferRequest};
use crate::services::control_plane::{ControlPlane, CredentialBroker, StageCommand};
use crate::services::executor::TransferExecutor;
use crate::services::storage::StageStorage;
use crate::services::{planner, reporter};
use crate::utils::pattern;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// One open transfer session against a database connection.
///
/// Explicit lifecycle: open before the first request, close after the
/// last. Closing cancels in-flight work; abandoned multipart uploads are
/// aborted so no partial remote object is left marked complete. Each
/// `put`/`get` call fetches its own scoped credential; credentials are
/// never reused across requests.
pub struct StageTransferSession {
    broker: CredentialBroker,
    executor: TransferExecutor,
    storage_provider: models::StorageProvider,
    config: TransferConfig,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl StageTransferSession {
    pub fn open(
        control_plane: Arc<dyn ControlPlane>,
        storage: Arc<dyn StageStorage>,
        config: TransferConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            broker: CredentialBroker::new(control_plane, &config),
            executor: TransferExecutor::new(Arc::clone(&storage), config.clone(), cancel.clone()),
            storage_provider: storage.provider(),
            config,
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    /// Cancels in-flight transfers and refuses further requests.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Uploads local files (path or wildcard pattern) onto a stage.
    /// Request-level failures return `Err`; per-file failures come back as
    /// ERROR rows with their siblings unaffected.
    pub async fn put(&self, request: &TransferRequest) -> Result<Vec<TransferOutcome>, StageError> {
        self.ensure_open()?;
        if request.direction != TransferDirection::Upload {
            return Err(StageError::Parse(
                "put() requires an upload request".to_string(),
            ));
        }

        let files = pattern::expand_local_source(&request.source)?;
        tracing::info!(
            stage = %request.stage_ref,
            files = files.len(),
            "starting PUT"
        );

        let parallelism = planner::effective_parallelism(&request.options, &self.config);
        let command = StageCommand::for_request(request, parallelism);
        let (location, credential) = self.broker.request(&command).await?;
        self.ensure_provider(&location)?;

        let credential = Arc::new(credential);
        let indexed = self
            .executor
            .upload_files(files, &location, &credential, &request.options)
            .await;
        Ok(reporter::aggregate(indexed))
    }

    /// Downloads stage objects matching the request's name pattern into the
    /// local target directory.
    pub async fn get(&self, request: &TransferRequest) -> Result<Vec<TransferOutcome>, StageError> {
        self.ensure_open()?;
        if request.direction != TransferDirection::Download {
            return Err(StageError::Parse(
                "get() requires a download request".to_string(),
            ));
        }

        let parallelism = planner::effective_parallelism(&request.options, &self.config);
        let command = StageCommand::for_request(request, parallelism);
        let (location, credential) = self.broker.request(&command).await?;
        self.ensure_provider(&location)?;

        let credential = Arc::new(credential);
        let listing = self.executor.list_stage(&location, &credential).await?;
        let selected = planner::plan_download(listing, request.options.name_pattern.as_deref())?;
        tracing::info!(
            stage = %request.stage_ref,
            matched = selected.len(),
            "starting GET"
        );

        tokio::fs::create_dir_all(&request.source).await?;
        let indexed = self
            .executor
            .download_objects(
                selected,
                &location,
                &credential,
                &request.options,
                &request.source,
            )
            .await;
        Ok(reporter::aggregate(indexed))
    }

    fn ensure_open(&self) -> Result<(), StageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StageError::Cancelled("session is closed".to_string()));
        }
        Ok(())
    }

    fn ensure_provider(&self, location: &models::StageLocation) -> Result<(), StageError> {
        if location.provider != self.storage_provider {
            return Err(StageError::Protocol(format!(
                "stage resolved to {} but session storage is {}",
                location.provider, self.storage_provider
            )));
        }
        Ok(())
    }
}
