//! S3-compatible object storage for backups.
//!
//! Credentials, endpoint and region come from the storage relation rather
//! than the environment. Path-style addressing is forced so self-hosted
//! stores without wildcard DNS work.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client as S3Client;
use maas_operator_reconciler::backup::{Listing, ObjectEntry};
use maas_operator_reconciler::desired::ObjectStorage;
use maas_operator_reconciler::{Error, ObjectStore, ObjectStoreProvider, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Region that rejects an explicit location constraint.
const DEFAULT_REGION: &str = "us-east-1";

fn failed(operation: &str, err: impl std::error::Error) -> Error {
    Error::storage(operation, DisplayErrorContext(err).to_string())
}

/// One bucket reached through the S3 API.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    region: String,
}

impl S3ObjectStore {
    /// Build a client for the relation's credentials.
    pub async fn connect(storage: &ObjectStorage) -> Self {
        let region = if storage.region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            storage.region.clone()
        };
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .load()
            .await;

        let credentials = Credentials::new(
            &storage.access_key,
            &storage.secret_key,
            None,
            None,
            "object-storage-relation",
        );
        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .credentials_provider(credentials)
            .force_path_style(true);
        if !storage.endpoint.is_empty() {
            s3_config = s3_config.endpoint_url(&storage.endpoint);
        }
        if storage.tls_ca_chain.is_some() {
            warn!("custom CA chains are not supported; using the system trust store");
        }

        Self {
            client: S3Client::from_conf(s3_config.build()),
            bucket: storage.bucket.clone(),
            region,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn ensure_bucket(&self) -> Result<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            debug!(bucket = %self.bucket, "bucket exists");
            return Ok(());
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| failed("create-bucket", e))?;
        info!(bucket = %self.bucket, region = %self.region, "bucket created");
        Ok(())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| failed("upload", e))?;
        debug!(key, "object uploaded");
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| Error::io(path, e.to_string()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| failed("upload", e))?;
        debug!(key, path = %path.display(), "file uploaded");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => {
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| failed("download", e))?;
                Ok(Some(body.into_bytes().to_vec()))
            }
            Err(SdkError::ServiceError(e)) if matches!(e.err(), GetObjectError::NoSuchKey(_)) => {
                Ok(None)
            }
            Err(e) => Err(failed("download", e)),
        }
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<bool> {
        let mut body = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => output.body,
            Err(SdkError::ServiceError(e)) if matches!(e.err(), GetObjectError::NoSuchKey(_)) => {
                return Ok(false);
            }
            Err(e) => return Err(failed("download", e)),
        };

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| Error::io(dest, e.to_string()))?;
        while let Some(chunk) = body.try_next().await.map_err(|e| failed("download", e))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io(dest, e.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|e| Error::io(dest, e.to_string()))?;
        debug!(key, path = %dest.display(), "file downloaded");
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Listing> {
        let mut listing = Listing::default();
        let mut continuation_token = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter("/")
                .max_keys(1000);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }
            let response = request.send().await.map_err(|e| failed("list", e))?;

            for object in response.contents.unwrap_or_default() {
                if let Some(key) = object.key {
                    listing.objects.push(ObjectEntry {
                        key,
                        size: object.size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                    });
                }
            }
            listing.prefixes.extend(
                response
                    .common_prefixes
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| p.prefix),
            );

            if response.is_truncated != Some(true) {
                break;
            }
            continuation_token = response.next_continuation_token;
        }
        Ok(listing)
    }
}

/// Opens an [`S3ObjectStore`] per action.
#[derive(Debug, Clone, Copy, Default)]
pub struct S3Stores;

#[async_trait]
impl ObjectStoreProvider for S3Stores {
    async fn connect(&self, storage: &ObjectStorage) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3ObjectStore::connect(storage).await))
    }
}
