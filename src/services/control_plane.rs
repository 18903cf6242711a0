use crate::config::TransferConfig;
use crate::error::StageError;
use crate::models::{StageCredential, StageLocation, TransferDirection, TransferRequest};
use crate::services::locator;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::fmt;

/// Transfer command sent to the control-plane, equivalent to the SQL
/// `PUT file://<path> @<stage> ...` / `GET @<stage> file://<dir> ...` forms.
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub text: String,
}

impl StageCommand {
    pub fn for_request(request: &TransferRequest, parallelism: usize) -> Self {
        let text = match request.direction {
            TransferDirection::Upload => {
                let mut text = format!(
                    "PUT file://{} @{} auto_compress={} parallel={}",
                    request.source.display(),
                    request.stage_ref,
                    request.options.auto_compress,
                    parallelism
                );
                if request.options.overwrite {
                    text.push_str(" overwrite=true");
                }
                text
            }
            TransferDirection::Download => {
                let mut text = format!(
                    "GET @{} file://{}",
                    request.stage_ref,
                    request.source.display()
                );
                if let Some(pattern) = &request.options.name_pattern {
                    text.push_str(&format!(" pattern='{}'", pattern));
                }
                text
            }
        };
        Self { text }
    }
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// The database service that authorizes transfers and issues scoped
/// credentials. Returns the raw response body; the broker owns the schema.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn execute(&self, command: &StageCommand) -> Result<serde_json::Value, StageError>;
}

/// HTTP control-plane client.
pub struct HttpControlPlane {
    client: reqwest::Client,
    endpoint: String,
    session_token: String,
}

impl HttpControlPlane {
    pub fn new(endpoint: impl Into<String>, session_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            session_token: session_token.into(),
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn execute(&self, command: &StageCommand) -> Result<serde_json::Value, StageError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.session_token))
            .json(&serde_json::json!({ "sqlText": command.text }))
            .send()
            .await
            .map_err(|e| StageError::Transfer(format!("control-plane request failed: {}", e)))?;

        response
            .json()
            .await
            .map_err(|e| StageError::Protocol(format!("control-plane response not JSON: {}", e)))
    }
}

/// Typed control-plane response schema. Required fields are enforced at
/// deserialization so a malformed payload fails fast as ProtocolError
/// instead of blowing up mid-transfer.
#[derive(Debug, Deserialize)]
pub struct ExecResponse {
    #[serde(default)]
    pub data: Option<ExecResponseData>,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecResponseData {
    #[serde(rename = "stageInfo")]
    pub stage_info: StageInfo,
}

#[derive(Deserialize)]
pub struct StageInfo {
    pub location: String,
    #[serde(rename = "locationType")]
    pub location_type: String,
    pub creds: StageCreds,
}

#[derive(Deserialize)]
pub struct StageCreds {
    #[serde(rename = "AWS_ID")]
    pub aws_id: String,
    #[serde(rename = "AWS_KEY")]
    pub aws_key: String,
    #[serde(rename = "AWS_TOKEN", default)]
    pub aws_token: Option<String>,
    #[serde(rename = "AWS_EXPIRY", default)]
    pub aws_expiry: Option<DateTime<Utc>>,
}

impl fmt::Debug for StageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageInfo")
            .field("location", &self.location)
            .field("location_type", &self.location_type)
            .field("creds", &"<redacted>")
            .finish()
    }
}

/// Requests scoped credentials from the control-plane and resolves the
/// stage target. One broker call backs one transfer request; the returned
/// credential is owned by that request alone.
pub struct CredentialBroker {
    control_plane: std::sync::Arc<dyn ControlPlane>,
    credential_ttl: Duration,
}

impl CredentialBroker {
    pub fn new(control_plane: std::sync::Arc<dyn ControlPlane>, config: &TransferConfig) -> Self {
        Self {
            control_plane,
            credential_ttl: Duration::seconds(config.credential_ttl_secs),
        }
    }

    pub async fn request(
        &self,
        command: &StageCommand,
    ) -> Result<(StageLocation, StageCredential), StageError> {
        tracing::debug!(command = %command, "requesting scoped stage credentials");
        let raw = self.control_plane.execute(command).await?;

        let response: ExecResponse = serde_json::from_value(raw)
            .map_err(|e| StageError::Protocol(format!("malformed control-plane response: {}", e)))?;

        if !response.success {
            return Err(StageError::NotFound(
                response
                    .message
                    .unwrap_or_else(|| "stage reference rejected by control-plane".to_string()),
            ));
        }

        let stage_info = response
            .data
            .ok_or_else(|| StageError::Protocol("control-plane response missing data".to_string()))?
            .stage_info;
        let location = locator::parse(&stage_info.location_type, &stage_info.location)?;

        let expires_at = stage_info
            .creds
            .aws_expiry
            .unwrap_or_else(|| Utc::now() + self.credential_ttl);

        let credential = StageCredential {
            access_key_id: stage_info.creds.aws_id,
            secret_access_key: stage_info.creds.aws_key,
            session_token: stage_info.creds.aws_token,
            expires_at: Some(expires_at),
        };

        tracing::info!(
            bucket = %location.bucket,
            prefix = %location.prefix,
            expires_at = %expires_at,
            "stage resolved"
        );
        Ok((location, credential))
    }
}
