use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::credentials::{
    credentials_from_value, merge_with_defaults, Credentials, PartialCredentials,
};
use crate::location::normalize_id_str;
use crate::storage::{
    Storage, StorageError, KNOWN_DATABASES_STORAGE_KEY, SELECTED_KNOWN_DATABASE_ID_STORAGE_KEY,
};

pub const DEFAULT_DATABASE_NAME: &str = "New database";
const UNTITLED_DATABASE_LABEL: &str = "Untitled database";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownDatabase {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub credentials: Credentials,
}

impl KnownDatabase {
    #[must_use]
    pub fn new(name: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            credentials,
        }
    }

    /// Decodes one stored entry. Only the id is required; a missing or `null`
    /// name or credentials record falls back to the defaults.
    #[must_use]
    pub fn from_stored(value: &Value) -> Option<Self> {
        let id = normalize_id(value.get("id")?)?;
        Some(Self {
            id,
            name: value
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            credentials: value
                .get("credentials")
                .map(credentials_from_value)
                .unwrap_or_default(),
        })
    }

    /// Display label: the name, else the database URL, else a placeholder.
    #[must_use]
    pub fn label(&self) -> &str {
        let name = self.name.trim();
        if !name.is_empty() {
            return name;
        }
        let url = self.credentials.database_url.trim();
        if !url.is_empty() {
            return url;
        }
        UNTITLED_DATABASE_LABEL
    }
}

/// Accepts string or numeric ids, trimmed.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    normalize_id(&value).ok_or_else(|| serde::de::Error::custom("known database id is empty"))
}

pub(crate) fn normalize_id(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => normalize_id_str(raw),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Re-merges every member's credentials with the defaults.
#[must_use]
pub fn normalize_known_databases(databases: Vec<KnownDatabase>) -> Vec<KnownDatabase> {
    databases
        .into_iter()
        .map(|database| KnownDatabase {
            credentials: merge_with_defaults(PartialCredentials::from(database.credentials)),
            ..database
        })
        .collect()
}

/// Returns `base` (or the default name when blank), suffixed with " 2", " 3", …
/// until it collides with none of `names`. Comparison is trimmed and case-insensitive.
#[must_use]
pub fn ensure_unique_name<S: AsRef<str>>(base: &str, names: &[S]) -> String {
    let taken = names
        .iter()
        .map(|name| name.as_ref().trim().to_lowercase())
        .collect::<HashSet<_>>();
    let trimmed = base.trim();
    let fallback = if trimmed.is_empty() {
        DEFAULT_DATABASE_NAME
    } else {
        trimmed
    };

    if !taken.contains(&fallback.to_lowercase()) {
        return fallback.to_string();
    }

    let mut index = 2_u32;
    loop {
        let candidate = format!("{fallback} {index}");
        if !taken.contains(&candidate.to_lowercase()) {
            return candidate;
        }
        index += 1;
    }
}

/// Derives a display name from the database URL's host (or path), falling back to the
/// raw string when it does not parse and to [`DEFAULT_DATABASE_NAME`] when empty.
#[must_use]
pub fn guess_database_name<S: AsRef<str>>(credentials: &Credentials, names: &[S]) -> String {
    let url = credentials.database_url.trim();
    if url.is_empty() {
        return ensure_unique_name(DEFAULT_DATABASE_NAME, names);
    }

    let base = match Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default();
            if !host.is_empty() {
                host.to_string()
            } else if !parsed.path().is_empty() {
                parsed.path().to_string()
            } else {
                url.to_string()
            }
        }
        Err(_) => url.to_string(),
    };
    ensure_unique_name(&base, names)
}

/// Ordered known databases plus the selected id.
///
/// While the list is non-empty the selection always names one of its entries;
/// when it is empty the selection is `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownDatabaseRegistry {
    databases: Vec<KnownDatabase>,
    selected_id: Option<String>,
    /// Set when a stored list exists but could not be read. Persisting is skipped
    /// until the registry is edited.
    stored_list_unreadable: bool,
}

/// `None` when a list is stored but is not a readable array.
fn read_stored_list(storage: &Storage) -> Option<Vec<KnownDatabase>> {
    let raw = match storage.get_item(KNOWN_DATABASES_STORAGE_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Some(Vec::new()),
        Err(error) => {
            warn!(error = %error, "failed to read stored known databases");
            return None;
        }
    };

    let entries = match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Array(entries)) => entries,
        Ok(Value::Null) => return Some(Vec::new()),
        Ok(_) => {
            warn!("stored known databases are not a list; leaving them untouched");
            return None;
        }
        Err(error) => {
            warn!(error = %error, "failed to parse stored known databases; leaving them untouched");
            return None;
        }
    };

    let databases = entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let database = KnownDatabase::from_stored(entry);
            if database.is_none() {
                warn!(index, "dropping stored known database without a usable id");
            }
            database
        })
        .collect();
    Some(databases)
}

impl KnownDatabaseRegistry {
    #[must_use]
    pub fn new(databases: Vec<KnownDatabase>, selected_id: Option<String>) -> Self {
        let mut registry = Self {
            databases,
            selected_id,
            stored_list_unreadable: false,
        };
        registry.resolve_selection();
        registry
    }

    /// Loads the stored list and selection. Entries are decoded one by one, so a
    /// bad entry only loses itself; an unreadable list loads as empty and is
    /// left in storage.
    #[must_use]
    pub fn load(storage: &Storage) -> Self {
        let stored = read_stored_list(storage);
        let stored_list_unreadable = stored.is_none();
        let selected_id = storage
            .read_json::<Value>(SELECTED_KNOWN_DATABASE_ID_STORAGE_KEY)
            .and_then(|value| normalize_id(&value));
        let mut registry = Self::new(stored.unwrap_or_default(), selected_id);
        registry.stored_list_unreadable = stored_list_unreadable;
        registry
    }

    /// Whether the stored list could not be read and is being preserved.
    #[must_use]
    pub fn stored_list_unreadable(&self) -> bool {
        self.stored_list_unreadable
    }

    pub fn persist(&self, storage: &Storage) -> Result<(), StorageError> {
        if self.stored_list_unreadable {
            debug!("stored known databases unreadable; not overwriting them");
            return Ok(());
        }
        storage.write_json(KNOWN_DATABASES_STORAGE_KEY, &self.databases)?;
        match &self.selected_id {
            Some(id) => storage.write_json(SELECTED_KNOWN_DATABASE_ID_STORAGE_KEY, id),
            None => storage.remove_item(SELECTED_KNOWN_DATABASE_ID_STORAGE_KEY),
        }
    }

    #[must_use]
    pub fn databases(&self) -> &[KnownDatabase] {
        &self.databases
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.databases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.databases
            .iter()
            .map(|database| database.name.as_str())
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&KnownDatabase> {
        self.databases.iter().find(|database| database.id == id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    #[must_use]
    pub fn selected_id(&self) -> Option<&str> {
        self.selected_id.as_deref()
    }

    #[must_use]
    pub fn selected(&self) -> Option<&KnownDatabase> {
        self.selected_id.as_deref().and_then(|id| self.get(id))
    }

    /// Appends a database under a disambiguated `name` and selects it.
    pub fn add(&mut self, name: &str, credentials: Credentials) -> &KnownDatabase {
        let name = ensure_unique_name(name, &self.names());
        let database = KnownDatabase::new(name, credentials);
        debug!(id = %database.id, name = %database.name, "adding known database");
        self.selected_id = Some(database.id.clone());
        self.databases.push(database);
        self.stored_list_unreadable = false;
        &self.databases[self.databases.len() - 1]
    }

    /// Adds a database named after its URL; see [`guess_database_name`].
    pub fn add_guessed(&mut self, credentials: Credentials) -> &KnownDatabase {
        let name = guess_database_name(&credentials, &self.names());
        self.add(&name, credentials)
    }

    #[must_use]
    pub fn rename(&mut self, id: &str, name: impl Into<String>) -> bool {
        match self.databases.iter_mut().find(|database| database.id == id) {
            Some(database) => {
                database.name = name.into();
                self.stored_list_unreadable = false;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn update_credentials(&mut self, id: &str, credentials: Credentials) -> bool {
        match self.databases.iter_mut().find(|database| database.id == id) {
            Some(database) => {
                database.credentials = credentials;
                self.stored_list_unreadable = false;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn delete(&mut self, id: &str) -> bool {
        let original_len = self.databases.len();
        self.databases.retain(|database| database.id != id);
        let deleted = self.databases.len() != original_len;
        if deleted {
            self.stored_list_unreadable = false;
            self.resolve_selection();
        }
        deleted
    }

    /// Selects `id`, or the first entry when `id` is unknown.
    pub fn select(&mut self, id: &str) -> Option<&KnownDatabase> {
        self.selected_id = normalize_id_str(id);
        self.resolve_selection();
        self.selected()
    }

    pub fn normalize(&mut self) {
        self.databases = normalize_known_databases(std::mem::take(&mut self.databases));
        self.resolve_selection();
    }

    fn resolve_selection(&mut self) {
        let resolved = match self.selected_id.as_deref() {
            Some(id) if self.contains(id) => return,
            _ => self.databases.first().map(|database| database.id.clone()),
        };
        self.selected_id = resolved;
    }
}
