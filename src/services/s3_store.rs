//! S3-compatible `ObjectStore` (MinIO, RustFS, AWS) backed by aws-sdk-s3.

use crate::services::object_store::{
    ObjectStore, ObjectStoreError, ObjectStoreResult, StoredObject,
};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    Client,
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{BucketLocationConstraint, CreateBucketConfiguration},
};
use bytes::Bytes;
use tracing::debug;

/// Region S3 treats as the default; it must not be sent as a location constraint.
const DEFAULT_REGION: &str = "us-east-1";

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Shared, pooled S3 client. Cloning is cheap.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub async fn connect(settings: S3Settings) -> Self {
        let credentials = Credentials::new(
            settings.access_key_id,
            settings.secret_access_key,
            None,
            None,
            "document-store",
        );

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region))
            .credentials_provider(credentials)
            .endpoint_url(settings.endpoint_url)
            .load()
            .await;

        // MinIO only supports path-style addressing.
        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(true)
                .build(),
        );

        Self { client }
    }
}

/// Location constraint for `CreateBucket`; S3 rejects one naming the default region.
fn bucket_configuration(region: &str) -> Option<CreateBucketConfiguration> {
    if region.eq_ignore_ascii_case(DEFAULT_REGION) {
        return None;
    }
    Some(
        CreateBucketConfiguration::builder()
            .location_constraint(BucketLocationConstraint::from(region))
            .build(),
    )
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> ObjectStoreResult<()> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .content_length(size as i64)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| ObjectStoreError::backend(DisplayErrorContext(&err)))?;

        debug!(bucket, key, size, "stored object in s3");
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<StoredObject> {
        let output = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(ObjectStoreError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(ObjectStoreError::backend(DisplayErrorContext(&err))),
        };

        let content_type = output.content_type.clone();
        let body = output
            .body
            .collect()
            .await
            .map_err(ObjectStoreError::backend)?;

        Ok(StoredObject {
            bytes: body.into_bytes(),
            content_type,
        })
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| ObjectStoreError::backend(DisplayErrorContext(&err)))?;
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> ObjectStoreResult<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(ObjectStoreError::backend(DisplayErrorContext(&err))),
        }
    }

    async fn make_bucket(&self, bucket: &str, region: &str) -> ObjectStoreResult<()> {
        let request = self
            .client
            .create_bucket()
            .bucket(bucket)
            .set_create_bucket_configuration(bucket_configuration(region));

        match request.send().await {
            Ok(_) => Ok(()),
            // Another instance won the check-then-create race.
            Err(err)
                if err.as_service_error().is_some_and(|e| {
                    e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists()
                }) =>
            {
                debug!(bucket, "bucket created concurrently");
                Ok(())
            }
            Err(err) => Err(ObjectStoreError::backend(DisplayErrorContext(&err))),
        }
    }
}
