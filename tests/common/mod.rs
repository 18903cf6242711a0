//! Shared fixtures: an in-process stage backend consisting of the
//! scope-enforcing `MemoryStageStorage` and a fake control-plane that
//! issues credentials against it. PUT commands receive upload-only
//! credentials; GET commands receive download+list credentials. Upload
//! credentials deliberately do not grant listing.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use stage_transfer::error::StageError;
use stage_transfer::services::control_plane::{ControlPlane, StageCommand};
use stage_transfer::services::storage::{MemoryStageStorage, StageGrant};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const BUCKET: &str = "stage-bucket";

pub struct FakeControlPlane {
    storage: Arc<MemoryStageStorage>,
    stages: Mutex<HashMap<String, String>>,
}

impl FakeControlPlane {
    pub fn new(storage: Arc<MemoryStageStorage>) -> Self {
        Self {
            storage,
            stages: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a stage reference and the storage prefix backing it.
    pub fn register_stage(&self, stage_ref: &str, prefix: &str) {
        self.stages
            .lock()
            .unwrap()
            .insert(stage_ref.to_string(), prefix.to_string());
    }
}

fn stage_ref_of(command: &str) -> Option<&str> {
    command
        .split_whitespace()
        .find(|token| token.starts_with('@'))
        .map(|token| &token[1..])
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn execute(&self, command: &StageCommand) -> Result<Value, StageError> {
        let grants = if command.text.starts_with("PUT") {
            vec![StageGrant::Put]
        } else {
            vec![StageGrant::Get, StageGrant::List]
        };

        let Some(stage_ref) = stage_ref_of(&command.text) else {
            return Err(StageError::Protocol(format!(
                "command names no stage: {}",
                command.text
            )));
        };

        let prefix = match self.stages.lock().unwrap().get(stage_ref) {
            Some(prefix) => prefix.clone(),
            None => {
                return Ok(json!({
                    "success": false,
                    "message": format!("Stage '{}' does not exist or not authorized.", stage_ref),
                }));
            }
        };

        let expires = Utc::now() + Duration::minutes(10);
        let credential = self
            .storage
            .issue_credential(BUCKET, &prefix, grants, Some(expires));

        Ok(json!({
            "data": {
                "stageInfo": {
                    "location": format!("{}/{}", BUCKET, prefix),
                    "locationType": "S3",
                    "creds": {
                        "AWS_ID": credential.access_key_id,
                        "AWS_KEY": credential.secret_access_key,
                        "AWS_TOKEN": credential.session_token,
                        "AWS_EXPIRY": expires.to_rfc3339(),
                    }
                }
            },
            "success": true,
        }))
    }
}

/// One in-process stage backend wired together the way production wires the
/// database service and S3.
pub struct StageBackend {
    pub storage: Arc<MemoryStageStorage>,
    pub control_plane: Arc<FakeControlPlane>,
}

pub fn stage_backend() -> StageBackend {
    let storage = Arc::new(MemoryStageStorage::new());
    let control_plane = Arc::new(FakeControlPlane::new(Arc::clone(&storage)));
    StageBackend {
        storage,
        control_plane,
    }
}
