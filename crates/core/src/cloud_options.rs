use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

use crate::credentials::Credentials;

pub const DEFAULT_TOKEN_PATH: &str = "/token";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionsError {
    #[error("Dexie Cloud database URL is required")]
    MissingDatabaseUrl,
    #[error("invalid Dexie Cloud URL `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequireAuth {
    Required,
    RequiredWithEmail(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodicSync {
    pub min_interval_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoginHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Client-credentials token grant, present when both client id and secret are set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentialsGrant {
    pub endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    pub audience: Option<String>,
}

impl ClientCredentialsGrant {
    #[must_use]
    pub fn request_body(&self, public_key: &str, hints: &LoginHints) -> Value {
        let mut body = json!({
            "client_id": self.client_id,
            "client_secret": self.client_secret,
            "public_key": public_key,
            "hints": hints,
            "grant_type": "client_credentials",
        });
        if let (Some(audience), Value::Object(map)) = (&self.audience, &mut body) {
            map.insert("audience".to_string(), Value::String(audience.clone()));
        }
        body
    }
}

/// Options handed to the connection backend when a database is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudOptions {
    pub database_url: String,
    pub custom_login_gui: bool,
    pub require_auth: Option<RequireAuth>,
    pub try_use_service_worker: bool,
    pub disable_web_socket: bool,
    pub disable_eager_sync: bool,
    pub periodic_sync: Option<PeriodicSync>,
    pub fetch_tokens: Option<ClientCredentialsGrant>,
}

impl CloudOptions {
    pub fn from_credentials(credentials: &Credentials) -> Result<Self, OptionsError> {
        let database_url = normalize_base_url(&credentials.database_url)?;

        let require_auth = match optional_string(&credentials.default_email) {
            Some(email) => Some(RequireAuth::RequiredWithEmail(email)),
            None if credentials.require_auth => Some(RequireAuth::Required),
            None => None,
        };

        let periodic_sync = credentials
            .periodic_sync_interval_minutes
            .filter(|minutes| minutes.is_finite() && *minutes > 0.0)
            .map(|minutes| PeriodicSync {
                min_interval_secs: minutes * 60.0,
            });

        let fetch_tokens = match (
            optional_string(&credentials.client_id),
            optional_string(&credentials.client_secret),
        ) {
            (Some(client_id), Some(client_secret)) => {
                let token_url = optional_string(&credentials.token_url);
                Some(ClientCredentialsGrant {
                    endpoint: build_absolute_url(
                        token_url.as_deref().unwrap_or(DEFAULT_TOKEN_PATH),
                        &database_url,
                    ),
                    client_id,
                    client_secret,
                    audience: optional_string(&credentials.audience),
                })
            }
            _ => None,
        };

        Ok(Self {
            database_url,
            custom_login_gui: true,
            require_auth,
            try_use_service_worker: credentials.try_use_service_worker,
            disable_web_socket: credentials.disable_web_socket,
            disable_eager_sync: credentials.disable_eager_sync,
            periodic_sync,
            fetch_tokens,
        })
    }
}

/// Trims the URL and drops trailing slashes; an empty result is an error.
pub fn normalize_base_url(url: &str) -> Result<String, OptionsError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(OptionsError::MissingDatabaseUrl);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

#[must_use]
pub fn ensure_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

/// Roots a request path; empty means `/`.
#[must_use]
pub fn resolve_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Resolves `maybe_relative` against `base_url`, falling back to plain
/// concatenation when the base does not parse.
#[must_use]
pub fn build_absolute_url(maybe_relative: &str, base_url: &str) -> String {
    let base = ensure_trailing_slash(base_url);
    Url::parse(&base)
        .and_then(|parsed| parsed.join(maybe_relative))
        .map_or_else(
            |_| format!("{base}{}", maybe_relative.trim_start_matches('/')),
            String::from,
        )
}

/// Builds the absolute URL of an API request against the database URL.
pub fn request_url(
    database_url: &str,
    path: &str,
    query: &[(&str, String)],
) -> Result<Url, OptionsError> {
    let base = ensure_trailing_slash(&normalize_base_url(database_url)?);
    let invalid = |source| OptionsError::InvalidUrl {
        url: base.clone(),
        source,
    };
    let mut url = Url::parse(&base)
        .and_then(|parsed| parsed.join(&resolve_path(path)))
        .map_err(invalid)?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// Trimmed value, or `None` when blank.
#[must_use]
pub fn optional_string(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        build_absolute_url, request_url, CloudOptions, LoginHints, OptionsError, PeriodicSync,
        RequireAuth,
    };
    use crate::credentials::Credentials;

    #[test]
    fn maps_credentials_to_options() {
        let mut credentials = Credentials::with_database_url("  https://x.dexie.cloud// ");
        credentials.require_auth = true;
        credentials.disable_web_socket = true;
        credentials.periodic_sync_interval_minutes = Some(2.0);

        let options = CloudOptions::from_credentials(&credentials).expect("options should build");

        assert_eq!(options.database_url, "https://x.dexie.cloud");
        assert!(options.custom_login_gui);
        assert_eq!(options.require_auth, Some(RequireAuth::Required));
        assert!(options.try_use_service_worker);
        assert!(options.disable_web_socket);
        assert!(!options.disable_eager_sync);
        assert_eq!(
            options.periodic_sync,
            Some(PeriodicSync {
                min_interval_secs: 120.0
            })
        );
        assert_eq!(options.fetch_tokens, None);
    }

    #[test]
    fn default_email_takes_precedence_over_require_auth_flag() {
        let mut credentials = Credentials::with_database_url("https://x.dexie.cloud");
        credentials.default_email = " me@example.com ".to_string();

        let options = CloudOptions::from_credentials(&credentials).expect("options should build");
        assert_eq!(
            options.require_auth,
            Some(RequireAuth::RequiredWithEmail("me@example.com".to_string()))
        );
    }

    #[test]
    fn non_positive_sync_interval_is_ignored() {
        for minutes in [0.0, -3.0, f64::NAN] {
            let mut credentials = Credentials::with_database_url("https://x.dexie.cloud");
            credentials.periodic_sync_interval_minutes = Some(minutes);
            let options =
                CloudOptions::from_credentials(&credentials).expect("options should build");
            assert_eq!(options.periodic_sync, None);
        }
    }

    #[test]
    fn missing_database_url_is_rejected() {
        let err = CloudOptions::from_credentials(&Credentials::default())
            .expect_err("blank URL should fail");
        assert_eq!(err, OptionsError::MissingDatabaseUrl);
        assert_eq!(err.to_string(), "Dexie Cloud database URL is required");
    }

    #[test]
    fn token_grant_resolves_endpoint_and_builds_body() {
        let mut credentials = Credentials::with_database_url("https://x.dexie.cloud/");
        credentials.client_id = "id".to_string();
        credentials.client_secret = "secret".to_string();

        let grant = CloudOptions::from_credentials(&credentials)
            .expect("options should build")
            .fetch_tokens
            .expect("grant should be configured");
        assert_eq!(grant.endpoint, "https://x.dexie.cloud/token");

        let hints = LoginHints {
            email: Some("a@b.c".to_string()),
            user_id: None,
        };
        assert_eq!(
            grant.request_body("pk", &hints),
            json!({
                "client_id": "id",
                "client_secret": "secret",
                "public_key": "pk",
                "hints": {"email": "a@b.c"},
                "grant_type": "client_credentials",
            })
        );

        credentials.audience = "aud".to_string();
        credentials.token_url = "https://auth.example.com/oauth/token".to_string();
        let grant = CloudOptions::from_credentials(&credentials)
            .expect("options should build")
            .fetch_tokens
            .expect("grant should be configured");
        assert_eq!(grant.endpoint, "https://auth.example.com/oauth/token");
        assert_eq!(grant.request_body("pk", &hints)["audience"], "aud");
    }

    #[test]
    fn secret_without_client_id_configures_no_grant() {
        let mut credentials = Credentials::with_database_url("https://x.dexie.cloud");
        credentials.client_secret = "secret".to_string();
        let options = CloudOptions::from_credentials(&credentials).expect("options should build");
        assert_eq!(options.fetch_tokens, None);
    }

    #[test]
    fn absolute_url_falls_back_to_concatenation() {
        assert_eq!(
            build_absolute_url("token", "https://x.dexie.cloud/db"),
            "https://x.dexie.cloud/db/token"
        );
        assert_eq!(build_absolute_url("/token", "relative"), "relative/token");
    }

    #[test]
    fn request_url_roots_path_and_appends_query() {
        let url = request_url(
            "https://x.dexie.cloud/",
            "export",
            &[("format", "json".to_string())],
        )
        .expect("URL should build");
        assert_eq!(url.as_str(), "https://x.dexie.cloud/export?format=json");

        assert_eq!(
            request_url(" ", "/export", &[]).expect_err("blank URL should fail"),
            OptionsError::MissingDatabaseUrl
        );
    }
}
