use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use dxb_core::cloud_options::optional_string;
use dxb_core::credentials::Credentials;
use dxb_core::schema_cache::{
    parse_schema_document, SchemaDefinition, SchemaSource, SchemaSourceError,
};
use tracing::debug;

use crate::cloud::CloudHttpClient;

pub const DEFAULT_EXPORT_PATH: &str = "/export";

/// Remote export endpoint plus an optional schema bundle on disk.
#[derive(Debug, Clone)]
pub struct HttpSchemaSource {
    client: CloudHttpClient,
    fallback_path: Option<PathBuf>,
}

impl HttpSchemaSource {
    #[must_use]
    pub fn new(client: CloudHttpClient, fallback_path: Option<PathBuf>) -> Self {
        Self {
            client,
            fallback_path,
        }
    }
}

#[async_trait]
impl SchemaSource for HttpSchemaSource {
    async fn fetch_remote(
        &self,
        credentials: &Credentials,
    ) -> Result<SchemaDefinition, SchemaSourceError> {
        let path = optional_string(&credentials.export_path)
            .unwrap_or_else(|| DEFAULT_EXPORT_PATH.to_string());
        let document = self
            .client
            .get_json(credentials, &path, &[("format", "json".to_string())])
            .await
            .map_err(|error| SchemaSourceError::new(error.to_string()))?
            .ok_or_else(|| SchemaSourceError::new("Dexie Cloud export returned no content"))?;
        parse_schema_document(&document)
    }

    async fn load_local(&self) -> Result<SchemaDefinition, SchemaSourceError> {
        let Some(path) = &self.fallback_path else {
            return Ok(SchemaDefinition::new());
        };

        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no local schema bundle");
                return Ok(SchemaDefinition::new());
            }
            Err(error) => {
                return Err(SchemaSourceError::new(format!(
                    "failed to read schema bundle at {}: {error}",
                    path.display()
                )))
            }
        };

        let document = serde_json::from_str(&raw).map_err(|error| {
            SchemaSourceError::new(format!(
                "failed to parse schema bundle at {}: {error}",
                path.display()
            ))
        })?;
        parse_schema_document(&document)
    }
}
