//! KMS keys protecting the salt tree.

use anyhow::{Context, Result};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::DataKeySpec;
use aws_sdk_kms::Client;

/// The page size of alias listings.
const ALIAS_PAGE_LIMIT: i32 = 50;

/// Get the ID of the key behind the given alias, if any.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn get_key_id(client: &Client, alias: &str) -> Result<Option<String>> {
    let mut marker = None;
    loop {
        let res = client
            .list_aliases()
            .limit(ALIAS_PAGE_LIMIT)
            .set_marker(marker.take())
            .send()
            .await
            .context("error listing KMS aliases")?;
        if let Some(key_id) = res
            .aliases()
            .iter()
            .find(|entry| entry.alias_name() == Some(alias))
            .and_then(|entry| entry.target_key_id())
        {
            return Ok(Some(key_id.to_string()));
        }
        match res.next_marker() {
            Some(next) if res.truncated() => marker = Some(next.to_string()),
            _ => return Ok(None),
        }
    }
}

/// Create a new key behind the given alias.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn create_key(client: &Client, alias: &str) -> Result<String> {
    let res = client.create_key().send().await.context("error creating KMS key")?;
    let key_id = res
        .key_metadata()
        .map(|meta| meta.key_id().to_string())
        .context("no metadata returned for new KMS key")?;
    client
        .create_alias()
        .alias_name(alias)
        .target_key_id(&key_id)
        .send()
        .await
        .with_context(|| format!("error creating KMS alias {}", alias))?;
    tracing::info!(%alias, %key_id, "created KMS key");
    Ok(key_id)
}

/// Get the ID of the key behind the given alias, creating it when needed.
pub async fn ensure_key(client: &Client, alias: &str) -> Result<String> {
    match get_key_id(client, alias).await? {
        Some(key_id) => Ok(key_id),
        None => create_key(client, alias).await,
    }
}

/// Generate a new AES-256 data key under the given key, returning its base64 encoded ciphertext.
pub async fn generate_data_key(client: &Client, key_id: &str) -> Result<String> {
    let res = client
        .generate_data_key()
        .key_id(key_id)
        .key_spec(DataKeySpec::Aes256)
        .send()
        .await
        .with_context(|| format!("error generating data key under {}", key_id))?;
    let blob = res.ciphertext_blob().context("no ciphertext returned for data key")?;
    Ok(base64::encode(blob.as_ref()))
}

/// Decrypt the given ciphertext.
pub async fn decrypt(client: &Client, ciphertext: Vec<u8>) -> Result<Vec<u8>> {
    let res = client
        .decrypt()
        .ciphertext_blob(Blob::new(ciphertext))
        .send()
        .await
        .context("error decrypting data key")?;
    let plaintext = res.plaintext().context("no plaintext returned for data key")?;
    Ok(plaintext.as_ref().to_vec())
}
