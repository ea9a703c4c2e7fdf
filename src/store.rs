//! Whole-document access to a dataset location, remote or local.

use crate::error::StoreError;
use log::debug;
use serde::de::DeserializeOwned;
use std::path::PathBuf;

#[derive(Debug, Clone)]
enum Location {
    Remote(String),
    Local(PathBuf),
}

/// A base location that strain-scoped paths are resolved against.
///
/// `http://` and `https://` bases are fetched with a shared `reqwest` client,
/// `file://` prefixes and plain paths are read from disk.
#[derive(Clone)]
pub struct DataStore {
    location: Location,
    client: reqwest::Client,
}

impl DataStore {
    pub fn new(base: &str) -> Self {
        let location = if base.starts_with("http://") || base.starts_with("https://") {
            Location::Remote(base.trim_end_matches('/').to_string())
        } else {
            let raw = base.strip_prefix("file://").unwrap_or(base);
            Location::Local(PathBuf::from(raw))
        };
        DataStore {
            location,
            client: reqwest::Client::new(),
        }
    }

    pub fn describe(&self) -> String {
        match &self.location {
            Location::Remote(url) => url.clone(),
            Location::Local(dir) => dir.display().to_string(),
        }
    }

    /// Fetch `path` (relative to the base) as raw bytes.
    pub async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        match &self.location {
            Location::Remote(base) => {
                let url = format!("{}/{}", base, path.trim_start_matches('/'));
                debug!("GET {}", url);
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|source| StoreError::Http { url: url.clone(), source })?;
                let status = response.status();
                if !status.is_success() {
                    return Err(StoreError::Status {
                        url,
                        status: status.as_u16(),
                    });
                }
                let body = response
                    .bytes()
                    .await
                    .map_err(|source| StoreError::Http { url, source })?;
                Ok(body.to_vec())
            }
            Location::Local(root) => {
                let full = root.join(path.trim_start_matches('/'));
                debug!("read {}", full.display());
                tokio::fs::read(&full).await.map_err(|source| StoreError::Io {
                    path: full.display().to_string(),
                    source,
                })
            }
        }
    }

    /// Fetch `path` and parse it as a JSON document.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, StoreError> {
        let bytes = self.get_bytes(path).await?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            path: path.to_string(),
            source,
        })
    }
}
