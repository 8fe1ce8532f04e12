//! S3 transfers through [object_store](https://docs.rs/object_store).

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, instrument};

use crate::remote::{ObjectStoreClient, S3Params};
use crate::{Result, TransportError};

/// S3 client configured from `AWS_*` variables overlaid with the action params.
#[derive(Debug, Default, Clone, Copy)]
pub struct S3Store;

fn build(params: &S3Params) -> Result<impl ObjectStore> {
    if params.bucket.is_empty() {
        return Err(TransportError::InvalidParams("s3 bucket is required".into()));
    }

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&params.bucket)
        .with_virtual_hosted_style_request(!params.path_style)
        .with_allow_http(params.allow_http);

    if let Some(region) = &params.region {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = &params.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if let Some(key) = &params.access_key_id {
        builder = builder.with_access_key_id(key);
    }
    if let Some(secret) = &params.secret_access_key {
        builder = builder.with_secret_access_key(secret);
    }
    if let Some(token) = &params.session_token {
        builder = builder.with_token(token);
    }

    Ok(builder.build()?)
}

#[async_trait]
impl ObjectStoreClient for S3Store {
    #[instrument(skip_all, err, fields(bucket = %params.bucket, key = %params.key))]
    async fn upload(&self, params: &S3Params) -> Result<()> {
        let source = params
            .source
            .as_ref()
            .ok_or_else(|| TransportError::InvalidParams("s3 upload needs a source file".into()))?;
        let store = build(params)?;
        let body = tokio::fs::read(source).await?;
        let size = body.len();
        store
            .put(&ObjectPath::from(params.key.as_str()), PutPayload::from(body))
            .await?;
        debug!("Uploaded {size} bytes from {}", source.display());
        Ok(())
    }

    #[instrument(skip_all, err, fields(bucket = %params.bucket, key = %params.key))]
    async fn download(&self, params: &S3Params) -> Result<u64> {
        let target = params
            .target
            .as_ref()
            .ok_or_else(|| TransportError::InvalidParams("s3 download needs a target file".into()))?;
        let store = build(params)?;
        let bytes = store
            .get(&ObjectPath::from(params.key.as_str()))
            .await?
            .bytes()
            .await?;
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}
