use std::time::Duration;

use async_trait::async_trait;
use dxb_core::cloud_options::{
    request_url, ClientCredentialsGrant, CloudOptions, LoginHints, OptionsError, RequireAuth,
};
use dxb_core::connection_session::{BackendError, ConnectionBackend};
use dxb_core::credentials::Credentials;
use dxb_core::schema_cache::SchemaDefinition;
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Debug, Error)]
pub enum CloudRequestError {
    #[error(transparent)]
    Options(#[from] OptionsError),
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Dexie Cloud request failed ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("Token request failed ({status}): {body}")]
    TokenStatus { status: u16, body: String },
    #[error("Failed to parse JSON response{}", json_detail(.body))]
    InvalidJson { body: String },
}

fn json_detail(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(": {body}")
    }
}

/// Tokens returned by a client-credentials grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub access_token: String,
    #[serde(default)]
    pub access_token_expiration: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub refresh_token_expiration: Option<u64>,
    #[serde(default)]
    pub claims: Value,
}

/// Authenticated JSON requests against a database URL.
#[derive(Debug, Clone)]
pub struct CloudHttpClient {
    http: reqwest::Client,
}

impl CloudHttpClient {
    pub fn new(timeout: Duration) -> Result<Self, CloudRequestError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CloudRequestError::Client)?;
        Ok(Self { http })
    }

    #[must_use]
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Sends a request and decodes the JSON body. `None` for HEAD requests and
    /// `204 No Content`.
    pub async fn request_json(
        &self,
        credentials: &Credentials,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>, CloudRequestError> {
        let url = request_url(&credentials.database_url, path, query)?;
        let is_head = method == Method::HEAD;

        let mut request = self.http.request(method, url.clone());
        if !credentials.api_key.is_empty() {
            request = request.header(API_KEY_HEADER, &credentials.api_key);
        }
        if !credentials.access_token.is_empty() {
            request = request.bearer_auth(&credentials.access_token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(url = %url, "sending Dexie Cloud request");
        let response = request
            .send()
            .await
            .map_err(|source| CloudRequestError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CloudRequestError::Status {
                status: status.as_u16(),
                body: error_body(response).await,
            });
        }

        if is_head || status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let raw = response
            .text()
            .await
            .map_err(|source| CloudRequestError::Transport {
                url: url.to_string(),
                source,
            })?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|_| CloudRequestError::InvalidJson { body: raw })
    }

    pub async fn get_json(
        &self,
        credentials: &Credentials,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<Value>, CloudRequestError> {
        self.request_json(credentials, Method::GET, path, query, None)
            .await
    }

    pub async fn fetch_tokens(
        &self,
        grant: &ClientCredentialsGrant,
        public_key: &str,
        hints: &LoginHints,
    ) -> Result<TokenResponse, CloudRequestError> {
        debug!(endpoint = %grant.endpoint, "requesting client-credentials tokens");
        let response = self
            .http
            .post(&grant.endpoint)
            .json(&grant.request_body(public_key, hints))
            .send()
            .await
            .map_err(|source| CloudRequestError::Transport {
                url: grant.endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CloudRequestError::TokenStatus {
                status: status.as_u16(),
                body: error_body(response).await,
            });
        }

        let raw = response
            .text()
            .await
            .map_err(|source| CloudRequestError::Transport {
                url: grant.endpoint.clone(),
                source,
            })?;
        serde_json::from_str(&raw).map_err(|_| CloudRequestError::InvalidJson { body: raw })
    }
}

async fn error_body(response: Response) -> String {
    let status = response.status();
    response.text().await.unwrap_or_else(|_| {
        status
            .canonical_reason()
            .unwrap_or_default()
            .to_string()
    })
}

/// A configured database: its options, the schema it was opened with and,
/// with client credentials, the current tokens.
#[derive(Debug, Clone)]
pub struct CloudConnection {
    options: CloudOptions,
    schema: SchemaDefinition,
    tokens: Option<TokenResponse>,
}

impl CloudConnection {
    #[must_use]
    pub fn options(&self) -> &CloudOptions {
        &self.options
    }

    #[must_use]
    pub fn database_url(&self) -> &str {
        &self.options.database_url
    }

    #[must_use]
    pub fn tables(&self) -> Vec<&str> {
        self.schema.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn tokens(&self) -> Option<&TokenResponse> {
        self.tokens.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct HttpCloudBackend {
    client: CloudHttpClient,
    public_key: String,
}

impl HttpCloudBackend {
    #[must_use]
    pub fn new(client: CloudHttpClient, public_key: impl Into<String>) -> Self {
        Self {
            client,
            public_key: public_key.into(),
        }
    }
}

#[async_trait]
impl ConnectionBackend for HttpCloudBackend {
    type Connection = CloudConnection;

    async fn open(
        &self,
        options: &CloudOptions,
        schema: &SchemaDefinition,
    ) -> Result<Self::Connection, BackendError> {
        let tokens = match &options.fetch_tokens {
            Some(grant) => {
                let hints = LoginHints {
                    email: match &options.require_auth {
                        Some(RequireAuth::RequiredWithEmail(email)) => Some(email.clone()),
                        _ => None,
                    },
                    user_id: None,
                };
                Some(
                    self.client
                        .fetch_tokens(grant, &self.public_key, &hints)
                        .await
                        .map_err(to_backend_error)?,
                )
            }
            None => None,
        };

        info!(
            database_url = %options.database_url,
            tables = schema.len(),
            "opened Dexie Cloud database"
        );
        Ok(CloudConnection {
            options: options.clone(),
            schema: schema.clone(),
            tokens,
        })
    }

    async fn close(&self, connection: Self::Connection) -> Result<(), BackendError> {
        debug!(database_url = %connection.options.database_url, "closed Dexie Cloud database");
        Ok(())
    }

    async fn login(
        &self,
        connection: &mut Self::Connection,
        hints: &LoginHints,
    ) -> Result<(), BackendError> {
        let grant = connection.options.fetch_tokens.as_ref().ok_or_else(|| {
            BackendError::new("interactive login is not supported; configure client credentials")
        })?;
        let tokens = self
            .client
            .fetch_tokens(grant, &self.public_key, hints)
            .await
            .map_err(to_backend_error)?;
        connection.tokens = Some(tokens);
        Ok(())
    }
}

fn to_backend_error(error: CloudRequestError) -> BackendError {
    BackendError::new(error.to_string())
}
