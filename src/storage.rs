//! Object storage access.
//!
//! The transfer engine talks to storage only through [`ObjectStore`]; the
//! production implementation is [`S3Store`], built by [`S3Connector`] from a
//! set of temporary credentials.

use crate::config::TransferSettings;
use crate::types::Credentials;
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, ObjectCannedAcl},
    Client,
};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::debug;

/// Errors reported by an object store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The key does not exist.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The session credentials are no longer accepted.
    #[error("Storage credentials expired: {0}")]
    ExpiredCredentials(String),

    /// Any other request failure.
    #[error("Storage request failed: {0}")]
    Request(String),

    /// Local I/O while streaming to or from storage.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A part of a multipart upload that has been accepted by storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Durable key-value blob store scoped to one bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Size of the object at `key`, `None` when it does not exist.
    async fn head(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Writes a whole object, verified server-side against `md5_base64` when given.
    async fn put(&self, key: &str, body: Vec<u8>, md5_base64: Option<&str>) -> Result<(), StoreError>;

    /// Starts a multipart upload and returns its upload id.
    async fn create_multipart(&self, key: &str) -> Result<String, StoreError>;

    /// Uploads one part and returns its ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, StoreError>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError>;

    /// Releases the server-side resources of an unfinished upload.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StoreError>;

    /// Downloads an object to `dest`, returning the number of bytes written.
    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StoreError>;

    /// Keys directly or indirectly under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Builds a store session for a bucket from temporary credentials.
pub trait StoreConnector: Send + Sync {
    fn connect(&self, bucket: &str, credentials: &Credentials)
        -> Result<Arc<dyn ObjectStore>, StoreError>;
}

/// Connects to S3 (or an S3-compatible endpoint).
#[derive(Debug, Clone)]
pub struct S3Connector {
    region: String,
    endpoint_url: Option<String>,
}

impl S3Connector {
    pub fn new(settings: &TransferSettings) -> Self {
        Self {
            region: settings.region.clone(),
            endpoint_url: settings.endpoint_url.clone(),
        }
    }
}

impl StoreConnector for S3Connector {
    fn connect(
        &self,
        bucket: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ObjectStore>, StoreError> {
        if bucket.is_empty() {
            return Err(StoreError::Request("empty destination bucket name".into()));
        }
        Ok(Arc::new(S3Store::new(
            bucket,
            credentials,
            &self.region,
            self.endpoint_url.as_deref(),
        )))
    }
}

/// S3 bucket accessed with static session credentials.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(
        bucket: &str,
        credentials: &Credentials,
        region: &str,
        endpoint_url: Option<&str>,
    ) -> Self {
        let session = aws_sdk_s3::config::Credentials::new(
            &credentials.access_key,
            &credentials.secret_key,
            Some(credentials.session_token.clone()),
            credentials.expires_at.map(SystemTime::from),
            "batchup-temp-credentials",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(session)
            .region(Region::new(region.to_string()));

        if let Some(endpoint) = endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        debug!("Storage client initialized for bucket: {}", bucket);

        Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
        }
    }
}

const EXPIRED_CODES: &[&str] = &["ExpiredToken", "TokenRefreshRequired", "RequestExpired"];

fn classify<E, R>(operation: &str, key: &str, err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err.code() {
        Some(code) if EXPIRED_CODES.contains(&code) => StoreError::ExpiredCredentials(format!(
            "{} {}: {}",
            operation,
            key,
            err.message().unwrap_or(code)
        )),
        Some("NoSuchKey") | Some("NotFound") => StoreError::NotFound(key.to_string()),
        _ => StoreError::Request(format!(
            "{} {}: {}",
            operation,
            key,
            DisplayErrorContext(&err)
        )),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head(&self, key: &str) -> Result<Option<u64>, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => Ok(Some(out.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(classify("HeadObject", key, e))
                }
            }
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>, md5_base64: Option<&str>) -> Result<(), StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .acl(ObjectCannedAcl::BucketOwnerFullControl)
            .body(ByteStream::from(body));

        if let Some(md5) = md5_base64 {
            request = request.content_md5(md5);
        }

        request
            .send()
            .await
            .map_err(|e| classify("PutObject", key, e))?;
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> Result<String, StoreError> {
        let out = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .acl(ObjectCannedAcl::BucketOwnerFullControl)
            .send()
            .await
            .map_err(|e| classify("CreateMultipartUpload", key, e))?;

        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Request(format!("no upload id returned for {}", key)))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, StoreError> {
        let out = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify("UploadPart", key, e))?;

        out.e_tag().map(str::to_string).ok_or_else(|| {
            StoreError::Request(format!("no ETag returned for part {} of {}", part_number, key))
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        aws_sdk_s3::types::CompletedPart::builder()
                            .part_number(p.part_number)
                            .e_tag(&p.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify("CompleteMultipartUpload", key, e))?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify("AbortMultipartUpload", key, e))?;
        Ok(())
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StoreError> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    StoreError::NotFound(key.to_string())
                } else {
                    classify("GetObject", key, e)
                }
            })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut reader = out.body.into_async_read();
        let mut file = tokio::fs::File::create(dest).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        debug!(
            "Downloaded {} bytes from s3://{}/{}",
            written, self.bucket, key
        );
        Ok(written)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(t) = token.as_deref() {
                request = request.continuation_token(t);
            }
            let resp = request
                .send()
                .await
                .map_err(|e| classify("ListObjectsV2", prefix, e))?;

            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            match resp.next_continuation_token() {
                Some(next) if resp.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string())
                }
                _ => break,
            }
        }
        Ok(keys)
    }
}
