use crate::error::StageError;
use crate::models::{StageCredential, StorageProvider};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;

/// Remote object as returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
}

/// The storage-plane capability. Every call presents the scoped credential
/// it was handed; the storage layer is the authorization boundary and
/// rejects calls whose credential is absent, expired, or out of scope.
#[async_trait]
pub trait StageStorage: Send + Sync {
    /// Provider this capability talks to; a session refuses to pair it with
    /// a stage resolved to a different provider.
    fn provider(&self) -> StorageProvider;

    async fn upload_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        credential: &StageCredential,
    ) -> Result<(), StageError>;

    /// Starts a multipart upload, returning its upload id.
    async fn begin_multipart(
        &self,
        bucket: &str,
        key: &str,
        credential: &StageCredential,
    ) -> Result<String, StageError>;

    /// Uploads one part, returning its etag. Part numbers start at 1.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
        credential: &StageCredential,
    ) -> Result<String, StageError>;

    /// Completes a multipart upload from `(part_number, etag)` pairs.
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
        credential: &StageCredential,
    ) -> Result<(), StageError>;

    /// Abandons a multipart upload; no partial object remains visible.
    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        credential: &StageCredential,
    ) -> Result<(), StageError>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        credential: &StageCredential,
    ) -> Result<Vec<RemoteObject>, StageError>;

    async fn download_object(
        &self,
        bucket: &str,
        key: &str,
        credential: &StageCredential,
    ) -> Result<Vec<u8>, StageError>;

    async fn object_exists(
        &self,
        bucket: &str,
        key: &str,
        credential: &StageCredential,
    ) -> Result<bool, StageError>;
}

/// S3 storage plane. A fresh client is built per scoped credential, never
/// from ambient environment credentials, so a request can only ever act
/// with the exact credential handed to it. Clients are deliberately not
/// cached: every request carries a newly minted credential, so a cache
/// entry would outlive its credential and never be hit again.
pub struct S3StageStorage {
    region: String,
    endpoint_url: Option<String>,
}

impl S3StageStorage {
    pub fn new(region: impl Into<String>, endpoint_url: Option<String>) -> Self {
        Self {
            region: region.into(),
            endpoint_url,
        }
    }

    async fn client_for(&self, credential: &StageCredential) -> Client {
        let creds = aws_sdk_s3::config::Credentials::new(
            credential.access_key_id.clone(),
            credential.secret_access_key.clone(),
            credential.session_token.clone(),
            credential.expires_at.map(SystemTime::from),
            "stage-scoped",
        );

        let mut loader = aws_config::from_env()
            .region(Region::new(self.region.clone()))
            .credentials_provider(creds);
        if let Some(endpoint) = &self.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let aws_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .force_path_style(self.endpoint_url.is_some())
            .build();
        Client::from_conf(s3_config)
    }
}

/// Maps an SDK failure onto the transfer error taxonomy. Access-denied
/// class errors surface verbatim as Authorization and are never retried;
/// missing keys map to NotFound; everything else is a retryable Transfer
/// error.
fn classify_sdk_error<E>(op: &str, err: SdkError<E>) -> StageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let code = err.code().unwrap_or_default().to_string();
    let detail = format!("{}: {}", op, DisplayErrorContext(&err));
    match code.as_str() {
        "AccessDenied"
        | "ExpiredToken"
        | "InvalidAccessKeyId"
        | "InvalidToken"
        | "SignatureDoesNotMatch"
        | "TokenRefreshRequired" => StageError::Authorization(detail),
        "NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "NotFound" => StageError::NotFound(detail),
        _ => StageError::Transfer(detail),
    }
}

#[async_trait]
impl StageStorage for S3StageStorage {
    fn provider(&self) -> StorageProvider {
        StorageProvider::S3
    }

    async fn upload_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        credential: &StageCredential,
    ) -> Result<(), StageError> {
        self.client_for(credential)
            .await
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify_sdk_error("put_object", e))?;
        Ok(())
    }

    async fn begin_multipart(
        &self,
        bucket: &str,
        key: &str,
        credential: &StageCredential,
    ) -> Result<String, StageError> {
        let res = self
            .client_for(credential)
            .await
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("create_multipart_upload", e))?;

        res.upload_id()
            .map(str::to_string)
            .ok_or_else(|| StageError::Protocol("multipart upload returned no upload id".into()))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
        credential: &StageCredential,
    ) -> Result<String, StageError> {
        let res = self
            .client_for(credential)
            .await
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify_sdk_error("upload_part", e))?;
        Ok(res.e_tag().unwrap_or_default().to_string())
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
        credential: &StageCredential,
    ) -> Result<(), StageError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|(number, etag)| {
                        CompletedPart::builder()
                            .part_number(number)
                            .e_tag(etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client_for(credential)
            .await
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify_sdk_error("complete_multipart_upload", e))?;
        Ok(())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        credential: &StageCredential,
    ) -> Result<(), StageError> {
        self.client_for(credential)
            .await
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify_sdk_error("abort_multipart_upload", e))?;
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        credential: &StageCredential,
    ) -> Result<Vec<RemoteObject>, StageError> {
        let client = self.client_for(credential).await;
        let mut objects = Vec::new();
        let mut continuation_token = None;

        loop {
            let res = client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token)
                .send()
                .await
                .map_err(|e| classify_sdk_error("list_objects_v2", e))?;

            if let Some(contents) = res.contents {
                for object in contents {
                    if let Some(key) = object.key {
                        objects.push(RemoteObject {
                            key,
                            size: object.size.unwrap_or(0) as u64,
                        });
                    }
                }
            }

            if res.is_truncated.unwrap_or(false) {
                continuation_token = res.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(objects)
    }

    async fn download_object(
        &self,
        bucket: &str,
        key: &str,
        credential: &StageCredential,
    ) -> Result<Vec<u8>, StageError> {
        let res = self
            .client_for(credential)
            .await
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("get_object", e))?;

        let data = res
            .body
            .collect()
            .await
            .map_err(|e| StageError::Transfer(format!("get_object body: {}", e)))?;
        Ok(data.to_vec())
    }

    async fn object_exists(
        &self,
        bucket: &str,
        key: &str,
        credential: &StageCredential,
    ) -> Result<bool, StageError> {
        let res = self
            .client_for(credential)
            .await
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await;

        match res {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    Ok(false)
                } else {
                    Err(classify_sdk_error("head_object", e))
                }
            }
        }
    }
}

/// Permissions a scoped credential can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageGrant {
    Put,
    Get,
    List,
}

#[derive(Debug, Clone)]
struct IssuedScope {
    secret_access_key: String,
    session_token: Option<String>,
    bucket: String,
    scope_prefix: String,
    grants: HashSet<StageGrant>,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<(String, String), Vec<u8>>,
    multiparts: HashMap<String, MultipartState>,
    issued: HashMap<String, IssuedScope>,
    transient_upload_failures: u32,
}

struct MultipartState {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, Vec<u8>>,
}

/// In-process storage plane used by tests and local development. It
/// enforces the same authorization boundary a real provider does: a call
/// must present a registered credential whose secret and session token
/// match, that has not expired, whose scope prefix covers the key, and
/// whose grant set covers the operation.
#[derive(Default)]
pub struct MemoryStageStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints and registers a scoped credential, the way the control-plane
    /// would against the real storage provider.
    pub fn issue_credential(
        &self,
        bucket: &str,
        scope_prefix: &str,
        grants: impl IntoIterator<Item = StageGrant>,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> StageCredential {
        let access_key_id = format!("STAGE{}", Uuid::new_v4().simple());
        let secret_access_key = Uuid::new_v4().to_string();
        let session_token = Uuid::new_v4().to_string();

        let mut state = self.state.lock().expect("memory storage poisoned");
        state.issued.insert(
            access_key_id.clone(),
            IssuedScope {
                secret_access_key: secret_access_key.clone(),
                session_token: Some(session_token.clone()),
                bucket: bucket.to_string(),
                scope_prefix: scope_prefix.to_string(),
                grants: grants.into_iter().collect(),
                expires_at,
            },
        );

        StageCredential {
            access_key_id,
            secret_access_key,
            session_token: Some(session_token),
            expires_at,
        }
    }

    /// Next `count` upload calls fail with a retryable Transfer error.
    pub fn inject_transient_upload_failures(&self, count: u32) {
        self.state
            .lock()
            .expect("memory storage poisoned")
            .transient_upload_failures = count;
    }

    /// Writes an object directly, bypassing credentials. This models the
    /// storage plane's own view (e.g. the database service materializing
    /// query results onto a stage).
    pub fn insert_object(&self, bucket: &str, key: &str, data: Vec<u8>) {
        self.state
            .lock()
            .expect("memory storage poisoned")
            .objects
            .insert((bucket.to_string(), key.to_string()), data);
    }

    /// Number of multipart uploads begun but neither completed nor aborted.
    /// Test inspection.
    pub fn pending_multiparts(&self) -> usize {
        self.state
            .lock()
            .expect("memory storage poisoned")
            .multiparts
            .len()
    }

    /// Reads an object directly, bypassing credentials. Test inspection.
    pub fn read_object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .expect("memory storage poisoned")
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    fn authorize(
        state: &MemoryState,
        credential: &StageCredential,
        bucket: &str,
        key_or_prefix: &str,
        grant: StageGrant,
    ) -> Result<(), StageError> {
        let scope = state
            .issued
            .get(&credential.access_key_id)
            .ok_or_else(|| StageError::Authorization("InvalidAccessKeyId".to_string()))?;

        if scope.secret_access_key != credential.secret_access_key {
            return Err(StageError::Authorization("SignatureDoesNotMatch".to_string()));
        }
        // S3 scoped credentials are a triplet; a missing or wrong session
        // token can never silently succeed.
        if credential.session_token != scope.session_token {
            return Err(StageError::Authorization(
                "InvalidToken: session token missing or mismatched".to_string(),
            ));
        }
        if let Some(at) = scope.expires_at {
            if Utc::now() >= at {
                return Err(StageError::Authorization("ExpiredToken".to_string()));
            }
        }
        if bucket != scope.bucket || !key_or_prefix.starts_with(&scope.scope_prefix) {
            return Err(StageError::Authorization(format!(
                "AccessDenied: {}/{} is outside the credential scope",
                bucket, key_or_prefix
            )));
        }
        if !scope.grants.contains(&grant) {
            return Err(StageError::Authorization(format!(
                "AccessDenied: credential does not grant {:?}",
                grant
            )));
        }
        Ok(())
    }

    fn take_transient_failure(state: &mut MemoryState) -> Option<StageError> {
        if state.transient_upload_failures > 0 {
            state.transient_upload_failures -= 1;
            return Some(StageError::Transfer(
                "injected transient storage failure".to_string(),
            ));
        }
        None
    }
}

#[async_trait]
impl StageStorage for MemoryStageStorage {
    // S3-compatible semantics; tests pair it with S3-typed stages.
    fn provider(&self) -> StorageProvider {
        StorageProvider::S3
    }

    async fn upload_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        credential: &StageCredential,
    ) -> Result<(), StageError> {
        let mut state = self.state.lock().expect("memory storage poisoned");
        Self::authorize(&state, credential, bucket, key, StageGrant::Put)?;
        if let Some(err) = Self::take_transient_failure(&mut state) {
            return Err(err);
        }
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    async fn begin_multipart(
        &self,
        bucket: &str,
        key: &str,
        credential: &StageCredential,
    ) -> Result<String, StageError> {
        let mut state = self.state.lock().expect("memory storage poisoned");
        Self::authorize(&state, credential, bucket, key, StageGrant::Put)?;
        let upload_id = Uuid::new_v4().to_string();
        state.multiparts.insert(
            upload_id.clone(),
            MultipartState {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
        credential: &StageCredential,
    ) -> Result<String, StageError> {
        let mut state = self.state.lock().expect("memory storage poisoned");
        Self::authorize(&state, credential, bucket, key, StageGrant::Put)?;
        if let Some(err) = Self::take_transient_failure(&mut state) {
            return Err(err);
        }
        let etag = format!("etag-{}", part_number);
        let upload = state
            .multiparts
            .get_mut(upload_id)
            .ok_or_else(|| StageError::NotFound(format!("NoSuchUpload: {}", upload_id)))?;
        upload.parts.insert(part_number, data.to_vec());
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
        credential: &StageCredential,
    ) -> Result<(), StageError> {
        let mut state = self.state.lock().expect("memory storage poisoned");
        Self::authorize(&state, credential, bucket, key, StageGrant::Put)?;
        let upload = state
            .multiparts
            .remove(upload_id)
            .ok_or_else(|| StageError::NotFound(format!("NoSuchUpload: {}", upload_id)))?;

        let mut assembled = Vec::new();
        for (number, _etag) in &parts {
            let part = upload.parts.get(number).ok_or_else(|| {
                StageError::Protocol(format!("multipart completion missing part {}", number))
            })?;
            assembled.extend_from_slice(part);
        }
        state
            .objects
            .insert((upload.bucket, upload.key), assembled);
        Ok(())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        credential: &StageCredential,
    ) -> Result<(), StageError> {
        let mut state = self.state.lock().expect("memory storage poisoned");
        Self::authorize(&state, credential, bucket, key, StageGrant::Put)?;
        state.multiparts.remove(upload_id);
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        credential: &StageCredential,
    ) -> Result<Vec<RemoteObject>, StageError> {
        let state = self.state.lock().expect("memory storage poisoned");
        Self::authorize(&state, credential, bucket, prefix, StageGrant::List)?;
        Ok(state
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), data)| RemoteObject {
                key: k.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn download_object(
        &self,
        bucket: &str,
        key: &str,
        credential: &StageCredential,
    ) -> Result<Vec<u8>, StageError> {
        let state = self.state.lock().expect("memory storage poisoned");
        Self::authorize(&state, credential, bucket, key, StageGrant::Get)?;
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StageError::NotFound(format!("NoSuchKey: {}", key)))
    }

    async fn object_exists(
        &self,
        bucket: &str,
        key: &str,
        credential: &StageCredential,
    ) -> Result<bool, StageError> {
        let state = self.state.lock().expect("memory storage poisoned");
        Self::authorize(&state, credential, bucket, key, StageGrant::Put)?;
        Ok(state
            .objects
            .contains_key(&(bucket.to_string(), key.to_string())))
    }
}
