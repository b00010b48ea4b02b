//! Presigned direct-to-bucket uploads.
//!
//! Clients never stream image bytes through this service: they ask for a
//! short-lived PUT URL scoped to `{user_id}/{type}/{filename}` and upload to
//! the S3-compatible store themselves.

use async_trait::async_trait;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;

use crate::models::Id;

pub const UPLOAD_URL_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_UPLOAD_CATEGORY: &str = "default";

#[derive(Debug, Error, PartialEq)]
pub enum UploadError {
    #[error("missing upload configuration: {}", .0.join(", "))]
    MissingSettings(Vec<String>),
    #[error("authorization required")]
    Unauthorized,
    #[error("{0}")]
    InvalidRequest(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSettings {
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    pub endpoint: String,
}

impl UploadSettings {
    pub const REQUIRED: [&'static str; 5] =
        ["S3_UPLOAD_KEY", "S3_UPLOAD_SECRET", "S3_UPLOAD_BUCKET", "S3_UPLOAD_REGION", "S3_UPLOAD_ENDPOINT"];

    pub fn from_env() -> Result<Self, Vec<String>> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Empty values count as missing. On failure every missing name is
    /// reported, in `REQUIRED` order.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Vec<String>> {
        let values = Self::REQUIRED.map(|name| lookup(name).filter(|v| !v.trim().is_empty()));
        match values {
            [Some(access_key), Some(secret_key), Some(bucket), Some(region), Some(endpoint)] => {
                Ok(Self { access_key, secret_key, bucket, region, endpoint })
            }
            values => Err(Self::REQUIRED
                .iter()
                .zip(values.iter())
                .filter(|(_, v)| v.is_none())
                .map(|(name, _)| name.to_string())
                .collect()),
        }
    }
}

#[async_trait]
pub trait UploadSigner: Send + Sync {
    fn bucket(&self) -> &str;
    /// Presigned PUT URL for `key`, valid for `ttl`.
    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String, UploadError>;
}

// ---------------- S3 implementation (MinIO compatible) ----------------
pub struct S3UploadSigner {
    bucket: String,
    client: aws_sdk_s3::Client,
}

impl S3UploadSigner {
    pub async fn new(settings: &UploadSettings) -> Self {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let creds = Credentials::new(&settings.access_key, &settings.secret_key, None, None, "static");
        let conf = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(settings.region.clone()))
            .endpoint_url(&settings.endpoint)
            .credentials_provider(SharedCredentialsProvider::new(creds))
            .load()
            .await;
        // path-style: most MinIO/local endpoints lack wildcard DNS
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf).force_path_style(true).build();
        info!("Initialized S3 upload signer for bucket '{}'", settings.bucket);
        Self { bucket: settings.bucket.clone(), client: aws_sdk_s3::Client::from_conf(s3_conf) }
    }
}

#[async_trait]
impl UploadSigner for S3UploadSigner {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String, UploadError> {
        use aws_sdk_s3::presigning::PresigningConfig;
        let cfg = PresigningConfig::expires_in(ttl).map_err(|e| UploadError::Signing(e.to_string()))?;
        let req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(cfg)
            .await
            .map_err(|e| {
                error!("presign put_object failed key={key} bucket={} err={e:?}", self.bucket);
                UploadError::Signing(e.to_string())
            })?;
        Ok(req.uri().to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct UploadRequest {
    pub filename: String,
    /// Upload category; becomes the middle key segment.
    #[serde(rename = "type")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema, PartialEq)]
pub struct UploadCredential {
    pub url: String,
    pub bucket: String,
    pub key: String,
}

/// Issues upload credentials, or reports which settings are missing.
#[derive(Clone)]
pub struct UploadIssuer {
    signer: Result<Arc<dyn UploadSigner>, Vec<String>>,
}

impl UploadIssuer {
    pub fn new(signer: Arc<dyn UploadSigner>) -> Self {
        Self { signer: Ok(signer) }
    }

    pub fn unconfigured(missing: Vec<String>) -> Self {
        Self { signer: Err(missing) }
    }

    pub async fn issue(&self, caller: Option<Id>, req: &UploadRequest) -> Result<UploadCredential, UploadError> {
        // configuration problems win over caller problems
        let signer = self.signer.as_ref().map_err(|missing| UploadError::MissingSettings(missing.clone()))?;
        let user_id = caller.ok_or(UploadError::Unauthorized)?;
        let key = upload_key(user_id, req)?;
        let url = signer.presign_put(&key, UPLOAD_URL_TTL).await?;
        Ok(UploadCredential { url, bucket: signer.bucket().to_string(), key })
    }
}

fn upload_key(user_id: Id, req: &UploadRequest) -> Result<String, UploadError> {
    if req.filename.is_empty() || req.filename.contains('/') {
        return Err(UploadError::InvalidRequest("filename must be non-empty and must not contain '/'".into()));
    }
    let category = req.category.as_deref().filter(|c| !c.is_empty()).unwrap_or(DEFAULT_UPLOAD_CATEGORY);
    if category.contains('/') {
        return Err(UploadError::InvalidRequest("type must not contain '/'".into()));
    }
    Ok(format!("{user_id}/{category}/{}", req.filename))
}

// Factory used in main; a missing setting is not fatal, only uploads fail.
pub async fn build_upload_issuer() -> UploadIssuer {
    match UploadSettings::from_env() {
        Ok(settings) => UploadIssuer::new(Arc::new(S3UploadSigner::new(&settings).await)),
        Err(missing) => {
            warn!("uploads disabled, missing: {}", missing.join(", "));
            UploadIssuer::unconfigured(missing)
        }
    }
}
