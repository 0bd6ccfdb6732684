use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::Credentials;

/// Table name to index specification, e.g. `"users" -> "@id, name, email"`.
pub type SchemaDefinition = BTreeMap<String, String>;

/// Signature under which the local fallback schema is cached.
pub const FALLBACK_SCHEMA_SIGNATURE: &str = "fallback";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SchemaSourceError {
    message: String,
}

impl SchemaSourceError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn fetch_remote(
        &self,
        credentials: &Credentials,
    ) -> Result<SchemaDefinition, SchemaSourceError>;
    async fn load_local(&self) -> Result<SchemaDefinition, SchemaSourceError>;
}

/// Cache key for the schema of `credentials`. Only fields that change which
/// schema the server returns take part; incomplete credentials map to
/// [`FALLBACK_SCHEMA_SIGNATURE`].
#[must_use]
pub fn schema_signature(credentials: Option<&Credentials>) -> String {
    match credentials {
        Some(credentials) if credentials.is_complete() => json!({
            "databaseUrl": credentials.database_url,
            "apiKey": credentials.api_key,
            "accessToken": credentials.access_token,
            "exportPath": credentials.export_path,
        })
        .to_string(),
        _ => FALLBACK_SCHEMA_SIGNATURE.to_string(),
    }
}

/// Extracts the table mapping from `{"schema": …}`, `{"stores": …}` or a bare
/// mapping. Non-string values are skipped.
pub fn parse_schema_document(document: &Value) -> Result<SchemaDefinition, SchemaSourceError> {
    let Value::Object(root) = document else {
        return Err(SchemaSourceError::new(
            "Dexie Cloud export did not include a schema description",
        ));
    };

    let tables = ["schema", "stores"]
        .iter()
        .find_map(|key| match root.get(*key) {
            Some(Value::Object(inner)) => Some(inner),
            _ => None,
        })
        .unwrap_or(root);

    Ok(tables
        .iter()
        .filter_map(|(name, spec)| spec.as_str().map(|spec| (name.clone(), spec.to_string())))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    /// First member of the key; the field records are addressed by.
    pub field: String,
    /// Every member; more than one for compound keys.
    pub members: Vec<String>,
    pub auto_generated: bool,
    pub auto_increment: bool,
    pub unique: bool,
}

impl PrimaryKey {
    #[must_use]
    pub fn is_compound(&self) -> bool {
        self.members.len() > 1
    }
}

#[must_use]
pub fn parse_primary_key(spec: &str) -> PrimaryKey {
    let mut token = spec.split(',').next().unwrap_or_default().trim();
    let mut auto_generated = false;
    let mut auto_increment = false;
    let mut unique = false;

    loop {
        if let Some(rest) = token.strip_prefix("++") {
            auto_increment = true;
            token = rest;
        } else if let Some(rest) = token.strip_prefix('&') {
            unique = true;
            token = rest;
        } else if let Some(rest) = token.strip_prefix('@') {
            auto_generated = true;
            token = rest;
        } else if let Some(rest) = token.strip_prefix('*') {
            token = rest;
        } else {
            break;
        }
    }

    let inner = token.trim_start_matches('[').trim_end_matches(']');
    let members = inner
        .split('+')
        .map(str::trim)
        .filter(|member| !member.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    PrimaryKey {
        field: members.first().cloned().unwrap_or_default(),
        members,
        auto_generated,
        auto_increment,
        unique,
    }
}

#[must_use]
pub fn primary_key_field(spec: &str) -> String {
    parse_primary_key(spec).field
}

#[derive(Debug)]
struct CachedSchema {
    signature: String,
    schema: Arc<SchemaDefinition>,
}

#[derive(Debug)]
pub struct SchemaCacheService<S: SchemaSource> {
    source: S,
    cache: Option<CachedSchema>,
}

impl<S: SchemaSource> SchemaCacheService<S> {
    #[must_use]
    pub fn new(source: S) -> Self {
        Self {
            source,
            cache: None,
        }
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Schema cached under exactly `signature`, without any I/O.
    #[must_use]
    pub fn cached(&self, signature: &str) -> Option<Arc<SchemaDefinition>> {
        self.cache
            .as_ref()
            .filter(|cache| cache.signature == signature)
            .map(|cache| Arc::clone(&cache.schema))
    }

    #[must_use]
    pub fn cached_signature(&self) -> Option<&str> {
        self.cache.as_ref().map(|cache| cache.signature.as_str())
    }

    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Resolves the schema for `credentials`. Never fails: a failed remote fetch
    /// degrades to the local schema, and a failed local load to an empty one.
    pub async fn load(&mut self, credentials: Option<&Credentials>) -> Arc<SchemaDefinition> {
        let signature = schema_signature(credentials);
        if let Some(schema) = self.cached(&signature) {
            debug!("schema cache hit");
            return schema;
        }

        if let Some(credentials) = credentials.filter(|credentials| credentials.is_complete()) {
            match self.source.fetch_remote(credentials).await {
                Ok(schema) => return self.store(signature, schema),
                Err(error) => {
                    warn!(error = %error, "failed to fetch remote schema; using fallback");
                }
            }
            if let Some(schema) = self.cached(FALLBACK_SCHEMA_SIGNATURE) {
                return schema;
            }
        }

        let schema = self.source.load_local().await.unwrap_or_else(|error| {
            warn!(error = %error, "failed to load local schema; using empty schema");
            SchemaDefinition::new()
        });
        self.store(FALLBACK_SCHEMA_SIGNATURE.to_string(), schema)
    }

    pub async fn list_tables(&mut self, credentials: Option<&Credentials>) -> Vec<String> {
        self.load(credentials).await.keys().cloned().collect()
    }

    pub async fn table_spec(
        &mut self,
        credentials: Option<&Credentials>,
        table_name: &str,
    ) -> Option<String> {
        self.load(credentials).await.get(table_name).cloned()
    }

    pub async fn primary_key_for(
        &mut self,
        credentials: Option<&Credentials>,
        table_name: &str,
    ) -> Option<PrimaryKey> {
        self.table_spec(credentials, table_name)
            .await
            .map(|spec| parse_primary_key(&spec))
    }

    fn store(&mut self, signature: String, schema: SchemaDefinition) -> Arc<SchemaDefinition> {
        let schema = Arc::new(schema);
        self.cache = Some(CachedSchema {
            signature,
            schema: Arc::clone(&schema),
        });
        schema
    }
}
