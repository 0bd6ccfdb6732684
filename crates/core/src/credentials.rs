use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::{Storage, StorageError, CREDENTIALS_STORAGE_KEY};

/// Connection parameters for one remote database.
///
/// Every value is the result of [`merge_with_defaults`], so no field is ever missing;
/// deserialization goes through [`PartialCredentials`] for the same reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "PartialCredentials")]
pub struct Credentials {
    pub database_url: String,
    pub api_key: String,
    pub access_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub audience: String,
    pub require_auth: bool,
    pub default_email: String,
    pub try_use_service_worker: bool,
    pub disable_web_socket: bool,
    pub disable_eager_sync: bool,
    pub periodic_sync_interval_minutes: Option<f64>,
    pub export_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialsError {
    #[error("unknown credential field `{field}`")]
    UnknownField { field: String },
    #[error("invalid value `{value}` for `{field}`")]
    InvalidValue { field: String, value: String },
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            api_key: String::new(),
            access_token: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            token_url: String::new(),
            audience: String::new(),
            require_auth: false,
            default_email: String::new(),
            try_use_service_worker: true,
            disable_web_socket: false,
            disable_eager_sync: false,
            periodic_sync_interval_minutes: None,
            export_path: String::new(),
        }
    }
}

impl Credentials {
    #[must_use]
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// True when `database_url` is non-blank. Nothing touches the network otherwise.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.database_url.trim().is_empty()
    }

    /// Serialization of every field; two credentials with equal signatures
    /// configure an identical connection.
    #[must_use]
    pub fn signature(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Sets one field by its stored (camelCase) name from a textual value.
    /// An empty value clears the periodic sync interval.
    pub fn set_field(&mut self, field: &str, value: &str) -> Result<(), CredentialsError> {
        let invalid = || CredentialsError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        };
        let parse_flag = |raw: &str| match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(invalid()),
        };

        match field {
            "databaseUrl" => self.database_url = value.to_string(),
            "apiKey" => self.api_key = value.to_string(),
            "accessToken" => self.access_token = value.to_string(),
            "clientId" => self.client_id = value.to_string(),
            "clientSecret" => self.client_secret = value.to_string(),
            "tokenUrl" => self.token_url = value.to_string(),
            "audience" => self.audience = value.to_string(),
            "defaultEmail" => self.default_email = value.to_string(),
            "exportPath" => self.export_path = value.to_string(),
            "requireAuth" => self.require_auth = parse_flag(value)?,
            "tryUseServiceWorker" => self.try_use_service_worker = parse_flag(value)?,
            "disableWebSocket" => self.disable_web_socket = parse_flag(value)?,
            "disableEagerSync" => self.disable_eager_sync = parse_flag(value)?,
            "periodicSyncIntervalMinutes" => {
                let trimmed = value.trim();
                self.periodic_sync_interval_minutes = if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.parse::<f64>().map_err(|_| invalid())?)
                        .filter(|minutes| minutes.is_finite())
                };
            }
            _ => {
                return Err(CredentialsError::UnknownField {
                    field: field.to_string(),
                })
            }
        }
        Ok(())
    }
}

#[must_use]
pub fn credentials_are_complete(credentials: Option<&Credentials>) -> bool {
    credentials.is_some_and(Credentials::is_complete)
}

/// A stored or user-supplied record in which any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartialCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_auth: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub try_use_service_worker: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_web_socket: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_eager_sync: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periodic_sync_interval_minutes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_path: Option<String>,
}

impl From<Credentials> for PartialCredentials {
    fn from(credentials: Credentials) -> Self {
        Self {
            database_url: Some(credentials.database_url),
            api_key: Some(credentials.api_key),
            access_token: Some(credentials.access_token),
            client_id: Some(credentials.client_id),
            client_secret: Some(credentials.client_secret),
            token_url: Some(credentials.token_url),
            audience: Some(credentials.audience),
            require_auth: Some(credentials.require_auth),
            default_email: Some(credentials.default_email),
            try_use_service_worker: Some(credentials.try_use_service_worker),
            disable_web_socket: Some(credentials.disable_web_socket),
            disable_eager_sync: Some(credentials.disable_eager_sync),
            periodic_sync_interval_minutes: credentials.periodic_sync_interval_minutes,
            export_path: Some(credentials.export_path),
        }
    }
}

impl From<PartialCredentials> for Credentials {
    fn from(partial: PartialCredentials) -> Self {
        merge_with_defaults(partial)
    }
}

/// Fills every absent field of `partial` from [`Credentials::default`].
#[must_use]
pub fn merge_with_defaults(partial: PartialCredentials) -> Credentials {
    let defaults = Credentials::default();
    Credentials {
        database_url: partial.database_url.unwrap_or(defaults.database_url),
        api_key: partial.api_key.unwrap_or(defaults.api_key),
        access_token: partial.access_token.unwrap_or(defaults.access_token),
        client_id: partial.client_id.unwrap_or(defaults.client_id),
        client_secret: partial.client_secret.unwrap_or(defaults.client_secret),
        token_url: partial.token_url.unwrap_or(defaults.token_url),
        audience: partial.audience.unwrap_or(defaults.audience),
        require_auth: partial.require_auth.unwrap_or(defaults.require_auth),
        default_email: partial.default_email.unwrap_or(defaults.default_email),
        try_use_service_worker: partial
            .try_use_service_worker
            .unwrap_or(defaults.try_use_service_worker),
        disable_web_socket: partial
            .disable_web_socket
            .unwrap_or(defaults.disable_web_socket),
        disable_eager_sync: partial
            .disable_eager_sync
            .unwrap_or(defaults.disable_eager_sync),
        periodic_sync_interval_minutes: partial
            .periodic_sync_interval_minutes
            .or(defaults.periodic_sync_interval_minutes),
        export_path: partial.export_path.unwrap_or(defaults.export_path),
    }
}

/// Decodes a stored credentials value field by field. `null`, non-objects and
/// fields of the wrong type fall back to the defaults instead of failing the
/// whole record.
#[must_use]
pub fn credentials_from_value(value: &Value) -> Credentials {
    let Value::Object(fields) = value else {
        if !value.is_null() {
            warn!("stored credentials are not an object; using defaults");
        }
        return Credentials::default();
    };

    let usable: Map<String, Value> = fields
        .iter()
        .filter(|(key, field)| {
            let single = Value::Object(Map::from_iter([((*key).clone(), (*field).clone())]));
            let usable = serde_json::from_value::<PartialCredentials>(single).is_ok();
            if !usable {
                warn!(field = %key, "ignoring stored credential field of the wrong type");
            }
            usable
        })
        .map(|(key, field)| (key.clone(), field.clone()))
        .collect();

    serde_json::from_value::<PartialCredentials>(Value::Object(usable))
        .map(merge_with_defaults)
        .unwrap_or_default()
}

/// Reads and writes the active credential profile.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    storage: Storage,
}

impl CredentialStore {
    #[must_use]
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// `None` when nothing is stored or the stored value cannot be parsed.
    #[must_use]
    pub fn load(&self) -> Option<Credentials> {
        self.storage
            .read_json::<PartialCredentials>(CREDENTIALS_STORAGE_KEY)
            .map(merge_with_defaults)
    }

    /// Writes `credentials` unless they already equal the stored value.
    /// Returns whether a write (and its change notification) happened.
    pub fn save(&self, credentials: &Credentials) -> Result<bool, StorageError> {
        if self.load().as_ref() == Some(credentials) {
            debug!("stored credentials unchanged; skipping write");
            return Ok(false);
        }

        self.storage
            .write_json(CREDENTIALS_STORAGE_KEY, credentials)?;
        Ok(true)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.storage.remove_item(CREDENTIALS_STORAGE_KEY)
    }
}
