//! S3 objects.

use std::path::Path;

use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

/// Upload the file at `path` to `s3://<bucket>/<key>`.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn put_file(client: &Client, bucket: &str, key: &str, path: &Path) -> Result<()> {
    let body = ByteStream::from_path(path).await.with_context(|| format!("error reading {}", path.display()))?;
    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body)
        .send()
        .await
        .with_context(|| format!("error uploading s3://{}/{}", bucket, key))?;
    tracing::info!(%bucket, %key, "uploaded object");
    Ok(())
}

/// Download `s3://<bucket>/<key>` to `path`. Returns `false` without touching `path` when the
/// object does not exist.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn get_file(client: &Client, bucket: &str, key: &str, path: &Path) -> Result<bool> {
    let res = match client.get_object().bucket(bucket).key(key).send().await {
        Ok(res) => res,
        Err(err) if err.as_service_error().map(|err| err.is_no_such_key()).unwrap_or(false) => {
            tracing::info!(%bucket, %key, "object does not exist");
            return Ok(false);
        }
        Err(err) => return Err(err).with_context(|| format!("error downloading s3://{}/{}", bucket, key)),
    };
    let body = res
        .body
        .collect()
        .await
        .with_context(|| format!("error reading s3://{}/{}", bucket, key))?
        .into_bytes();
    tokio::fs::write(path, &body)
        .await
        .with_context(|| format!("error writing {}", path.display()))?;
    tracing::info!(%bucket, %key, path = %path.display(), "downloaded object");
    Ok(true)
}

/// Remove `s3://<bucket>/<key>`.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn delete_object(client: &Client, bucket: &str, key: &str) -> Result<()> {
    client
        .delete_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .with_context(|| format!("error removing s3://{}/{}", bucket, key))?;
    tracing::info!(%bucket, %key, "removed object");
    Ok(())
}
