use std::fmt::Display;

use thiserror::Error;
use tracing::{debug, info};

use crate::credentials::{CredentialStore, Credentials};
use crate::known_databases::{guess_database_name, KnownDatabase, KnownDatabaseRegistry};
use crate::location::{read_selected_id_from_query, with_selected_id_in_query, QueryLocation};
use crate::storage::{Storage, StorageError};

pub const RESET_STATUS_MESSAGE: &str =
    "Credentials cleared. Update the fields and test the connection again.";
pub const CONNECTION_SUCCESS_MESSAGE: &str =
    "Connection successful. The database is ready to use.";

#[must_use]
pub fn connection_failed_message(message: impl Display) -> String {
    format!("Connection failed: {message}")
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("no known database is selected")]
    NoSelection,
}

/// Keeps the known-database registry, the active credential key and the
/// location's `dexie-db` parameter agreeing with each other.
#[derive(Debug)]
pub struct SettingsController<L: QueryLocation> {
    credentials: CredentialStore,
    registry: KnownDatabaseRegistry,
    active: Credentials,
    location: L,
    status_message: Option<String>,
}

impl<L: QueryLocation> SettingsController<L> {
    /// Loads and normalizes stored state, migrates a lone legacy profile into the
    /// registry and resolves the initial selection (location first, then storage).
    pub fn open(storage: Storage, location: L) -> Result<Self, SettingsError> {
        let credentials = CredentialStore::new(storage);
        let mut registry = KnownDatabaseRegistry::load(credentials.storage());
        let stored = credentials.load();
        let active = stored.clone().unwrap_or_default();

        if registry.is_empty()
            && !registry.stored_list_unreadable()
            && active != Credentials::default()
        {
            let name = guess_database_name(&active, &[] as &[&str]);
            info!(name = %name, "migrating stored credentials into known databases");
            registry.add(&name, active.clone());
        }

        if let Some(id) = read_selected_id_from_query(&location.query()) {
            if registry.contains(&id) {
                registry.select(&id);
            }
        }

        let mut controller = Self {
            credentials,
            registry,
            active,
            location,
            status_message: None,
        };
        controller.reconcile()?;
        Ok(controller)
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        self.credentials.storage()
    }

    #[must_use]
    pub fn registry(&self) -> &KnownDatabaseRegistry {
        &self.registry
    }

    #[must_use]
    pub fn known_databases(&self) -> &[KnownDatabase] {
        self.registry.databases()
    }

    #[must_use]
    pub fn selected(&self) -> Option<&KnownDatabase> {
        self.registry.selected()
    }

    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.active
    }

    #[must_use]
    pub fn location(&self) -> &L {
        &self.location
    }

    #[must_use]
    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    /// Adds a database built from the current credentials and selects it.
    pub fn add_database(&mut self) -> Result<String, SettingsError> {
        self.add_database_with(self.active.clone())
    }

    /// Adds a database with `credentials`, named after its URL, and selects it.
    pub fn add_database_with(&mut self, credentials: Credentials) -> Result<String, SettingsError> {
        let id = self.registry.add_guessed(credentials).id.clone();
        self.status_message = None;
        self.reconcile()?;
        Ok(id)
    }

    pub fn select_database(&mut self, id: &str) -> Result<Option<&KnownDatabase>, SettingsError> {
        self.registry.select(id);
        self.status_message = None;
        self.reconcile()?;
        Ok(self.registry.selected())
    }

    pub fn rename_selected(&mut self, name: &str) -> Result<(), SettingsError> {
        let id = self.selected_id()?;
        let _ = self.registry.rename(&id, name);
        self.reconcile()
    }

    pub fn delete_selected(&mut self) -> Result<KnownDatabase, SettingsError> {
        let id = self.selected_id()?;
        let removed = self
            .registry
            .get(&id)
            .cloned()
            .ok_or(SettingsError::NoSelection)?;
        let _ = self.registry.delete(&id);
        self.status_message = None;
        self.reconcile()?;
        Ok(removed)
    }

    /// Applies `edit` to the active credentials and mirrors the result into
    /// the selected entry, if any.
    pub fn update_credentials<F, T>(&mut self, edit: F) -> Result<T, SettingsError>
    where
        F: FnOnce(&mut Credentials) -> T,
    {
        let output = edit(&mut self.active);
        self.mirror_active_into_selection();
        self.reconcile()?;
        Ok(output)
    }

    pub fn reset_credentials(&mut self) -> Result<(), SettingsError> {
        self.active = Credentials::default();
        self.mirror_active_into_selection();
        self.status_message = Some(RESET_STATUS_MESSAGE.to_string());
        self.reconcile()
    }

    /// Re-reads the location after an outside edit; a parameter naming a known
    /// database becomes the selection, anything else is overwritten.
    pub fn location_changed(&mut self) -> Result<(), SettingsError> {
        if let Some(id) = read_selected_id_from_query(&self.location.query()) {
            if self.registry.contains(&id) && self.registry.selected_id() != Some(id.as_str()) {
                debug!(id = %id, "selection changed through location");
                self.registry.select(&id);
            }
        }
        self.reconcile()
    }

    /// Mutable access for callers that edit the location directly; follow with
    /// [`Self::location_changed`].
    pub fn location_mut(&mut self) -> &mut L {
        &mut self.location
    }

    pub fn record_connection_test<E: Display>(&mut self, result: Result<(), E>) -> &str {
        let message = match result {
            Ok(()) => CONNECTION_SUCCESS_MESSAGE.to_string(),
            Err(error) => connection_failed_message(error),
        };
        self.status_message.insert(message).as_str()
    }

    fn selected_id(&self) -> Result<String, SettingsError> {
        self.registry
            .selected_id()
            .map(ToString::to_string)
            .ok_or(SettingsError::NoSelection)
    }

    fn mirror_active_into_selection(&mut self) {
        if let Some(id) = self.registry.selected_id().map(ToString::to_string) {
            let _ = self.registry.update_credentials(&id, self.active.clone());
        }
    }

    fn reconcile(&mut self) -> Result<(), SettingsError> {
        self.registry.persist(self.credentials.storage())?;

        if let Some(selected) = self.registry.selected() {
            if selected.credentials != self.active {
                self.active = selected.credentials.clone();
            }
        }
        self.credentials.save(&self.active)?;

        let query = self.location.query();
        let selected_id = self.registry.selected_id();
        if read_selected_id_from_query(&query).as_deref() != selected_id {
            self.location
                .replace_query(&with_selected_id_in_query(&query, selected_id));
        }
        Ok(())
    }
}
