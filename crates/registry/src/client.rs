//! HTTP model fetcher
//!
//! Resolves `model_ref` to a `model_url` via the registry, then downloads
//! the artifact into the content-addressed cache. Downloads land in a
//! sibling temp file and are renamed into place so concurrent readers
//! never observe a partial artifact.

use serde::Deserialize;
use std::path::PathBuf;
use uuid::Uuid;

use crate::{cache_path, FetchError, ModelFetcher, RegistryConfig};

#[derive(Debug, Deserialize)]
struct ModelRecord {
    model_url: String,
}

pub struct HttpModelFetcher {
    http: reqwest::Client,
    config: RegistryConfig,
}

impl HttpModelFetcher {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn resolve_url(&self, model_ref: &str, bearer: &str) -> Result<String, FetchError> {
        let url = format!(
            "{}/models/{}",
            self.config.base_url.trim_end_matches('/'),
            model_ref
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        match response.status().as_u16() {
            200 => {
                let record: ModelRecord = response
                    .json()
                    .await
                    .map_err(|e| FetchError::Response(e.to_string()))?;
                Ok(record.model_url)
            }
            404 => Err(FetchError::NotFound(model_ref.to_string())),
            401 | 403 => Err(FetchError::Forbidden(model_ref.to_string())),
            status if status >= 500 => Err(FetchError::Request(format!(
                "registry returned {}",
                status
            ))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(FetchError::Response(format!(
                    "registry returned {}: {}",
                    status, body
                )))
            }
        }
    }

    async fn download(&self, model_url: &str, dest: &PathBuf) -> Result<(), FetchError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::Io(e.to_string()))?;
        }

        let response = self
            .http
            .get(model_url)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Request(format!(
                "artifact download returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        // Temp-file-then-rename: readers only ever see complete artifacts
        let tmp = dest.with_extension(format!("tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;

        tracing::info!(dest = %dest.display(), size = bytes.len(), "model artifact cached");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ModelFetcher for HttpModelFetcher {
    async fn ensure_local(
        &self,
        owner_id: Uuid,
        model_ref: &str,
        bearer: &str,
    ) -> Result<PathBuf, FetchError> {
        let dest = cache_path(&self.config.cache_root, owner_id, model_ref);

        if tokio::fs::try_exists(&dest)
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?
        {
            tracing::debug!(%model_ref, "model cache hit");
            return Ok(dest);
        }

        let model_url = self.resolve_url(model_ref, bearer).await?;
        self.download(&model_url, &dest).await?;
        Ok(dest)
    }
}
