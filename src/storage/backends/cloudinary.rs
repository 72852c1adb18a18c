use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use percent_encoding::percent_decode_str;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::key::{StorageKey, IMAGE_SUFFIX};
use crate::StorageBackend;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: String,
    public_id: String,
}

#[derive(Debug, Deserialize)]
struct DestroyResponse {
    result: String,
}

#[derive(Debug, Deserialize)]
struct DeleteResourcesResponse {
    #[serde(default)]
    deleted: HashMap<String, String>,

    /// Set when more resources remain under the prefix.
    #[serde(default)]
    partial: bool,

    #[serde(default)]
    next_cursor: Option<String>,
}

/// Credentials for the remote image host.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

pub struct CloudinaryBackend {
    client: Client,
    api_base: String,
    credentials: Credentials,
    folder: String,
}

impl CloudinaryBackend {
    pub fn new(
        api_base: &str,
        credentials: Credentials,
        folder: &str,
        request_timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            api_base: api_base.trim_end_matches('/').to_string(),
            credentials,
            folder: folder.trim_matches('/').to_string(),
        })
    }

    #[inline]
    fn format_endpoint(&self, action: &str) -> String {
        format!("{}/v1_1/{}/{}", self.api_base, self.credentials.cloud_name, action)
    }

    #[inline]
    fn format_public_id(&self, key: &StorageKey) -> String {
        format!("{}/{}", self.folder, key)
    }

    /// Signs the given parameters the way the upload API expects: sorted
    /// `k=v` pairs joined by `&`, followed by the secret, hashed with SHA-256.
    fn sign(&self, params: &BTreeMap<&str, String>) -> String {
        let to_sign = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let mut hasher = Sha256::new();
        hasher.update(to_sign.as_bytes());
        hasher.update(self.credentials.api_secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Adds the authentication fields to a set of parameters.
    fn signed_params(&self, mut params: BTreeMap<&'static str, String>) -> Vec<(&'static str, String)> {
        params.insert("timestamp", unix_timestamp().to_string());

        let signature = self.sign(&params);
        let mut fields: Vec<_> = params.into_iter().collect();
        fields.push(("api_key", self.credentials.api_key.clone()));
        fields.push(("signature", signature));
        fields.push(("signature_algorithm", "sha256".to_string()));
        fields
    }

    /// Deletes one batch of resources under `prefix`.
    async fn delete_page(&self, prefix: &str, cursor: Option<&str>) -> Result<DeleteResourcesResponse> {
        let mut query = vec![("prefix", prefix)];
        if let Some(cursor) = cursor {
            query.push(("next_cursor", cursor));
        }

        let resp = self
            .client
            .delete(self.format_endpoint("resources/image/upload"))
            .query(&query)
            .basic_auth(&self.credentials.api_key, Some(&self.credentials.api_secret))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!(
                "Remote storage did not respond correctly, expected a success status got {}",
                status,
            ));
        }

        Ok(resp.json().await?)
    }
}

#[async_trait]
impl StorageBackend for CloudinaryBackend {
    async fn store(&self, key: &StorageKey, data: Bytes) -> Result<String> {
        let public_id = key.to_string();

        let mut params = BTreeMap::new();
        params.insert("folder", self.folder.clone());
        params.insert("format", "webp".to_string());
        params.insert("overwrite", "true".to_string());
        params.insert("public_id", public_id);

        let part = Part::bytes(data.to_vec())
            .file_name(key.file_name())
            .mime_str("image/webp")?;

        let form = self
            .signed_params(params)
            .into_iter()
            .fold(Form::new(), |form, (k, v)| form.text(k, v))
            .part("file", part);

        debug!("Uploading image to folder {} as {}", &self.folder, key);
        let resp = self
            .client
            .post(self.format_endpoint("image/upload"))
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Remote storage did not respond correctly, expected a success status got {}: {}",
                status,
                body.trim(),
            ));
        }

        let uploaded: UploadResponse = resp.json().await?;
        debug!("Uploaded image as {} @ {}", &uploaded.public_id, &uploaded.secure_url);

        Ok(uploaded.secure_url)
    }

    async fn delete(&self, key: &StorageKey) -> Result<bool> {
        let mut params = BTreeMap::new();
        params.insert("public_id", self.format_public_id(key));

        debug!("Destroying remote image {}", self.format_public_id(key));
        let resp = self
            .client
            .post(self.format_endpoint("image/destroy"))
            .form(&self.signed_params(params))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!(
                "Remote storage did not respond correctly, expected a success status got {}",
                status,
            ));
        }

        let destroyed: DestroyResponse = resp.json().await?;
        match destroyed.result.as_str() {
            "ok" => Ok(true),
            "not found" => Ok(false),
            other => Err(anyhow!("Remote storage refused to destroy image: {}", other)),
        }
    }

    async fn purge(&self) -> Result<usize> {
        let prefix = format!("{}/", self.folder);

        debug!("Purging remote images with prefix {}", &prefix);
        let mut purged = 0;
        let mut cursor: Option<String> = None;
        loop {
            let page = self.delete_page(&prefix, cursor.as_deref()).await?;
            for (public_id, state) in page.deleted.iter() {
                debug!("Purged {} ({})", public_id, state);
            }

            let removed = page.deleted.values().filter(|state| *state == "deleted").count();
            purged += removed;

            if !page.partial {
                break;
            }

            if page.next_cursor.is_none() && removed == 0 {
                warn!("Remote purge of {} stalled with resources remaining", &prefix);
                break;
            }

            cursor = page.next_cursor;
        }

        Ok(purged)
    }

    /// Hosted URLs look like
    /// `https://<host>/<cloud>/image/upload[/v<version>]/<folder>/<key>.webp`.
    fn key_for_url(&self, access_url: &str) -> Option<StorageKey> {
        let url = Url::parse(access_url).ok()?;
        let segments = url
            .path_segments()?
            .map(|segment| percent_decode_str(segment).decode_utf8().ok())
            .collect::<Option<Vec<_>>>()?;

        let head = [self.credentials.cloud_name.as_str(), "image", "upload"];
        if segments.len() < head.len() + 1 || segments.iter().zip(head).any(|(segment, part)| segment != part) {
            return None;
        }

        let mut rest = &segments[head.len()..];
        if let Some(version) = rest.first() {
            let is_version = version.len() > 1
                && version.starts_with('v')
                && version[1..].chars().all(|c| c.is_ascii_digit());
            if is_version {
                rest = &rest[1..];
            }
        }

        let (file_name, folder) = rest.split_last()?;
        if folder.join("/") != self.folder || !file_name.ends_with(IMAGE_SUFFIX) {
            return None;
        }

        StorageKey::from_file_name(file_name)
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
