//! Backend batch-tracking API.
//!
//! [`BackendApi`] is the contract the pipeline needs; [`GraphQlClient`] is the
//! production implementation, posting GraphQL documents with a bearer token.

use crate::error::{Result, UploadError};
use crate::types::{Batch, BatchType, BatchUpdate, Credentials, FileNodeConfig, FileResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Largest request body the backend accepts.
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Default timeout for backend requests.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 120;

const CREATE_TEMP_CREDENTIALS: &str = r#"
mutation CreateTempCredentials($submissionID: String!) {
  createTempCredentials(submissionID: $submissionID) {
    accessKeyId
    secretAccessKey
    sessionToken
    expiration
  }
}"#;

const CREATE_BATCH: &str = r#"
mutation CreateBatch($submissionID: ID!, $type: String, $files: [String!]!) {
  createBatch(submissionID: $submissionID, type: $type, files: $files) {
    _id
    bucketName
    filePrefix
    type
    fileCount
    files { fileID fileName }
    status
    createdAt
  }
}"#;

const UPDATE_BATCH: &str = r#"
mutation UpdateBatch($batchID: ID!, $files: [UploadResult], $uploading: Boolean) {
  updateBatch(batchID: $batchID, files: $files, uploading: $uploading) {
    _id
    status
    updatedAt
  }
}"#;

const RETRIEVE_FILE_NODE_CONFIG: &str = r#"
query RetrieveFileNodeConfig($submissionID: ID!) {
  retrieveFileNodeConfig(submissionID: $submissionID) {
    name_field
    size_field
    md5_field
    id_field
    omit_DCF_prefix
    heartbeat_interval
  }
}"#;

const RETRIEVE_CLI_VERSION: &str = r#"
query {
  retrieveCLIUploaderVersion
}"#;

/// Operations the uploader performs against the backend.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Short-lived storage credentials for the submission's bucket.
    async fn create_temp_credentials(&self) -> Result<Credentials>;

    /// Registers a new batch for `files`.
    async fn create_batch(&self, batch_type: BatchType, files: &[String]) -> Result<Batch>;

    /// Sends either a heartbeat (`files == None`, `uploading == true`) or the
    /// terminal per-file results.
    async fn update_batch(
        &self,
        batch_id: &str,
        files: Option<&[FileResult]>,
        uploading: bool,
    ) -> Result<BatchUpdate>;

    async fn retrieve_file_node_config(&self) -> Result<FileNodeConfig>;

    /// Latest published uploader version, if the backend advertises one.
    async fn retrieve_cli_version(&self) -> Result<Option<String>>;
}

/// The only backend call a heartbeat task may make.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    async fn beat(&self, batch_id: &str) -> Result<()>;
}

#[async_trait]
impl<T: BackendApi + ?Sized> Heartbeat for T {
    async fn beat(&self, batch_id: &str) -> Result<()> {
        self.update_batch(batch_id, None, true).await.map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

/// GraphQL client for the submission backend.
pub struct GraphQlClient {
    client: Client,
    url: String,
    token: String,
    submission_id: String,
}

impl GraphQlClient {
    pub fn new(url: impl Into<String>, token: impl Into<String>, submission_id: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_API_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            token: token.into(),
            submission_id: submission_id.into(),
        })
    }

    /// Posts a document and deserializes `data.<operation>`.
    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &str,
        query: &str,
        variables: Value,
        authenticated: bool,
    ) -> Result<T> {
        let body = serde_json::to_vec(&json!({ "query": query, "variables": variables }))?;
        if body.len() > MAX_PAYLOAD_BYTES {
            return Err(UploadError::PayloadTooLarge {
                operation: operation.to_string(),
                size: body.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        debug!("POST {} ({}, {} bytes)", self.url, operation, body.len());
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if authenticated {
            request = request.bearer_auth(&self.token);
        }

        let response: GraphQlResponse = request.send().await?.error_for_status()?.json().await?;

        if let Some(first) = response.errors.first() {
            return Err(UploadError::Api {
                operation: operation.to_string(),
                message: first.message.clone(),
            });
        }

        let value = response
            .data
            .and_then(|mut data| data.get_mut(operation).map(Value::take))
            .filter(|v| !v.is_null())
            .ok_or_else(|| UploadError::Api {
                operation: operation.to_string(),
                message: "response contains no data".to_string(),
            })?;

        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl BackendApi for GraphQlClient {
    async fn create_temp_credentials(&self) -> Result<Credentials> {
        self.execute(
            "createTempCredentials",
            CREATE_TEMP_CREDENTIALS,
            json!({ "submissionID": self.submission_id }),
            true,
        )
        .await
    }

    async fn create_batch(&self, batch_type: BatchType, files: &[String]) -> Result<Batch> {
        self.execute(
            "createBatch",
            CREATE_BATCH,
            json!({
                "submissionID": self.submission_id,
                "type": batch_type.as_str(),
                "files": files,
            }),
            true,
        )
        .await
    }

    async fn update_batch(
        &self,
        batch_id: &str,
        files: Option<&[FileResult]>,
        uploading: bool,
    ) -> Result<BatchUpdate> {
        let mut variables = json!({ "batchID": batch_id, "uploading": uploading });
        if let Some(files) = files {
            variables["files"] = serde_json::to_value(files)?;
        }
        self.execute("updateBatch", UPDATE_BATCH, variables, true).await
    }

    async fn retrieve_file_node_config(&self) -> Result<FileNodeConfig> {
        self.execute(
            "retrieveFileNodeConfig",
            RETRIEVE_FILE_NODE_CONFIG,
            json!({ "submissionID": self.submission_id }),
            true,
        )
        .await
    }

    async fn retrieve_cli_version(&self) -> Result<Option<String>> {
        match self
            .execute::<String>("retrieveCLIUploaderVersion", RETRIEVE_CLI_VERSION, json!({}), false)
            .await
        {
            Ok(v) => Ok(Some(v)),
            Err(UploadError::Api { message, .. }) if message == "response contains no data" => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// True when `latest` is a strictly newer dotted version than `current`.
pub fn is_newer_version(current: &str, latest: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .trim_start_matches('v')
            .split('.')
            .map(|p| p.parse().unwrap_or(0))
            .collect()
    };
    parse(latest) > parse(current)
}
