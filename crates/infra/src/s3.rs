//! S3-backed object store for result artifacts.
//!
//! Artifact metadata rides on the object itself as user metadata
//! (`x-amz-meta-*`), so a `HEAD` is enough for the reconciler to recover the
//! executor-reported cost without downloading the body.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use packflow_core::Money;

use crate::object_store::{ArtifactMetadata, ObjectStore, ObjectStoreError};

const META_ACTUAL_COST: &str = "actual-cost-micros";
const META_SHA256: &str = "result-sha256";

/// Configuration for the S3 artifact store.
#[derive(Debug, Clone)]
pub struct S3ObjectStoreConfig {
    pub bucket: String,
    /// AWS region; falls back to environment configuration.
    pub region: Option<String>,
    /// Custom endpoint URL (S3-compatible stores, localstack).
    pub endpoint: Option<String>,
    /// Force path-style addressing (required by most S3-compatible stores).
    pub force_path_style: bool,
}

/// S3-backed artifact store.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: S3ObjectStoreConfig) -> Result<Self, ObjectStoreError> {
        if config.bucket.trim().is_empty() {
            return Err(ObjectStoreError::Storage("bucket must be set".to_string()));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: ArtifactMetadata,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type("application/json; charset=utf-8")
            .metadata(META_ACTUAL_COST, metadata.actual_cost.as_micros().to_string())
            .metadata(META_SHA256, &metadata.sha256)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Storage(format!("put {key}: {e}")))?;
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ArtifactMetadata>, ObjectStoreError> {
        let head = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => head,
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_not_found())
                {
                    return Ok(None);
                }
                return Err(ObjectStoreError::Storage(format!("head {key}: {err}")));
            }
        };

        let user_metadata = head.metadata().cloned().unwrap_or_default();
        let actual_cost = user_metadata
            .get(META_ACTUAL_COST)
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(Money::from_micros)
            .ok_or_else(|| {
                ObjectStoreError::Storage(format!("object {key} is missing {META_ACTUAL_COST}"))
            })?;
        let sha256 = user_metadata
            .get(META_SHA256)
            .cloned()
            .unwrap_or_default();

        Ok(Some(ArtifactMetadata {
            actual_cost,
            sha256,
            size_bytes: head.content_length().unwrap_or(0).max(0) as u64,
        }))
    }

    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<Option<String>, ObjectStoreError> {
        if self.head(key).await?.is_none() {
            return Ok(None);
        }

        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| ObjectStoreError::Storage(e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| ObjectStoreError::Storage(format!("presign {key}: {e}")))?;

        Ok(Some(presigned.uri().to_string()))
    }
}
