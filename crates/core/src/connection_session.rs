use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::cloud_options::{CloudOptions, LoginHints};
use crate::credentials::{CredentialStore, Credentials};
use crate::schema_cache::{SchemaCacheService, SchemaDefinition, SchemaSource};
use crate::storage::{StorageEvent, CREDENTIALS_STORAGE_KEY};

pub const CREDENTIALS_NOT_CONFIGURED: &str =
    "Dexie Cloud credentials are not configured. Use the Settings view to provide them.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ConnectionBackend: Send + Sync {
    type Connection: Send;

    async fn open(
        &self,
        options: &CloudOptions,
        schema: &SchemaDefinition,
    ) -> Result<Self::Connection, BackendError>;
    async fn close(&self, connection: Self::Connection) -> Result<(), BackendError>;
    async fn login(
        &self,
        connection: &mut Self::Connection,
        hints: &LoginHints,
    ) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected { reason: Option<String> },
    Connecting,
    Connected,
    Error { message: String },
}

impl SessionStatus {
    /// Text shown next to the status; empty unless disconnected for a reason or failed.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Disconnected {
                reason: Some(reason),
            } => reason,
            Self::Error { message } => message,
            _ => "",
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Reconnect only when the credential signature changed or no connection is open.
    IfChanged,
    /// Always close and reopen.
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Unchanged,
    NotConfigured,
    Failed(String),
    /// Another attempt was running; this request was dropped.
    InFlight,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Database not initialized")]
    NotInitialized,
    #[error("Dexie Cloud credentials are not configured. Use the Settings view to provide them.")]
    NotConfigured,
    #[error("a connection attempt is already in progress")]
    AttemptInFlight,
    #[error("{0}")]
    ConnectionFailed(String),
    #[error("connection backend failed: {0}")]
    Backend(#[source] BackendError),
}

#[derive(Debug, Default)]
struct SessionState {
    last_applied: Option<String>,
    pending: bool,
    epoch: u64,
}

struct Attempt {
    signature: Option<String>,
    outcome: ConnectOutcome,
    status: SessionStatus,
}

enum Settled {
    Done(ConnectOutcome),
    Retry { epoch: u64 },
}

/// Owns the single live connection and keeps it in step with the stored
/// credentials.
pub struct ConnectionSession<B: ConnectionBackend, S: SchemaSource> {
    backend: B,
    credentials: CredentialStore,
    schema_cache: AsyncMutex<SchemaCacheService<S>>,
    active: AsyncMutex<Option<B::Connection>>,
    state: Mutex<SessionState>,
    status: watch::Sender<SessionStatus>,
    disposed: watch::Sender<bool>,
}

impl<B: ConnectionBackend, S: SchemaSource> ConnectionSession<B, S> {
    #[must_use]
    pub fn new(backend: B, schema_source: S, credentials: CredentialStore) -> Self {
        let (status, _) = watch::channel(SessionStatus::Disconnected { reason: None });
        let (disposed, _) = watch::channel(false);
        Self {
            backend,
            credentials,
            schema_cache: AsyncMutex::new(SchemaCacheService::new(schema_source)),
            active: AsyncMutex::new(None),
            state: Mutex::new(SessionState::default()),
            status,
            disposed,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn credential_store(&self) -> &CredentialStore {
        &self.credentials
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        *self.disposed.borrow()
    }

    /// Starts publishing status again and evaluates the stored credentials. An
    /// existing connection with matching credentials is reused.
    pub async fn mount(&self) -> ConnectOutcome {
        self.disposed.send_replace(false);
        self.connect(ReconnectPolicy::IfChanged).await
    }

    /// Stops status publication, including from attempts still running. The
    /// connection stays open for a later [`Self::mount`].
    pub fn unmount(&self) {
        self.lock_state().epoch += 1;
        self.disposed.send_replace(true);
    }

    pub async fn connect(&self, policy: ReconnectPolicy) -> ConnectOutcome {
        let mut epoch = {
            let mut state = self.lock_state();
            if state.pending {
                debug!("connection attempt in flight; dropping request");
                return ConnectOutcome::InFlight;
            }
            state.pending = true;
            state.epoch
        };

        let mut policy = policy;
        loop {
            let attempt = self.attempt(policy, epoch).await;
            match self.settle(attempt, epoch) {
                Settled::Done(outcome) => return outcome,
                Settled::Retry { epoch: next } => {
                    epoch = next;
                    policy = ReconnectPolicy::IfChanged;
                }
            }
        }
    }

    /// Forced reconnect with the stored credentials, reported as a result.
    pub async fn test_connection(&self) -> Result<(), SessionError> {
        match self.connect(ReconnectPolicy::Force).await {
            ConnectOutcome::Connected | ConnectOutcome::Unchanged => Ok(()),
            ConnectOutcome::NotConfigured => Err(SessionError::NotConfigured),
            ConnectOutcome::InFlight => Err(SessionError::AttemptInFlight),
            ConnectOutcome::Failed(message) => Err(SessionError::ConnectionFailed(message)),
        }
    }

    pub async fn login(&self, hints: &LoginHints) -> Result<(), SessionError> {
        let mut active = self.active.lock().await;
        let connection = active.as_mut().ok_or(SessionError::NotInitialized)?;
        self.backend
            .login(connection, hints)
            .await
            .map_err(SessionError::Backend)
    }

    /// Runs `operation` against the open connection.
    pub async fn with_connection<T>(
        &self,
        operation: impl FnOnce(&mut B::Connection) -> T,
    ) -> Result<T, SessionError> {
        let mut active = self.active.lock().await;
        let connection = active.as_mut().ok_or(SessionError::NotInitialized)?;
        Ok(operation(connection))
    }

    /// Schema for the stored credentials, from cache when the signature matches.
    pub async fn schema(&self) -> Arc<SchemaDefinition> {
        let credentials = self.credentials.load();
        self.schema_cache.lock().await.load(credentials.as_ref()).await
    }

    pub async fn shutdown(&self) {
        self.teardown().await;
        let state = self.lock_state();
        self.publish(&state, state.epoch, SessionStatus::Disconnected { reason: None });
    }

    /// Re-evaluates on every credential-key notification until unmounted or the
    /// channel closes.
    pub async fn run(&self, mut events: broadcast::Receiver<StorageEvent>) {
        let mut disposed = self.disposed.subscribe();
        loop {
            if *disposed.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = disposed.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) if event.key == CREDENTIALS_STORAGE_KEY => {
                        debug!(origin = ?event.origin, "stored credentials changed");
                        self.connect(ReconnectPolicy::IfChanged).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "storage notifications lagged; re-evaluating");
                        self.connect(ReconnectPolicy::IfChanged).await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("session event loop stopped");
    }

    async fn attempt(&self, policy: ReconnectPolicy, epoch: u64) -> Attempt {
        let Some(credentials) = self.credentials.load().filter(Credentials::is_complete) else {
            self.teardown().await;
            return Attempt {
                signature: None,
                outcome: ConnectOutcome::NotConfigured,
                status: SessionStatus::Disconnected {
                    reason: Some(CREDENTIALS_NOT_CONFIGURED.to_string()),
                },
            };
        };
        let signature = credentials.signature();

        let mut active = self.active.lock().await;
        let unchanged = active.is_some()
            && self.lock_state().last_applied.as_deref() == Some(signature.as_str());
        if policy == ReconnectPolicy::IfChanged && unchanged {
            debug!("credentials unchanged; keeping connection");
            return Attempt {
                signature: Some(signature),
                outcome: ConnectOutcome::Unchanged,
                status: SessionStatus::Connected,
            };
        }

        {
            let state = self.lock_state();
            self.publish(&state, epoch, SessionStatus::Connecting);
        }

        if let Some(connection) = active.take() {
            self.lock_state().last_applied = None;
            if let Err(error) = self.backend.close(connection).await {
                warn!(error = %error, "failed to close previous connection");
            }
        }

        let schema = self
            .schema_cache
            .lock()
            .await
            .load(Some(&credentials))
            .await;
        let opened = match CloudOptions::from_credentials(&credentials) {
            Ok(options) => self.backend.open(&options, &schema).await,
            Err(error) => Err(BackendError::new(error.to_string())),
        };

        match opened {
            Ok(connection) => {
                *active = Some(connection);
                self.lock_state().last_applied = Some(signature.clone());
                info!(database_url = %credentials.database_url.trim(), "connected");
                Attempt {
                    signature: Some(signature),
                    outcome: ConnectOutcome::Connected,
                    status: SessionStatus::Connected,
                }
            }
            Err(error) => {
                warn!(error = %error, "connection attempt failed");
                let message = error.to_string();
                Attempt {
                    signature: Some(signature),
                    outcome: ConnectOutcome::Failed(message.clone()),
                    status: SessionStatus::Error { message },
                }
            }
        }
    }

    fn settle(&self, attempt: Attempt, epoch: u64) -> Settled {
        // Requests dropped while the attempt ran only show up in the store.
        let latest = self.requested_signature();
        let mut state = self.lock_state();
        if latest != attempt.signature {
            debug!("credentials changed during attempt; re-evaluating");
            return Settled::Retry { epoch: state.epoch };
        }
        if state.epoch != epoch && !self.is_disposed() {
            debug!("session remounted during attempt; re-evaluating");
            return Settled::Retry { epoch: state.epoch };
        }

        state.pending = false;
        self.publish(&state, epoch, attempt.status);
        Settled::Done(attempt.outcome)
    }

    async fn teardown(&self) {
        let mut active = self.active.lock().await;
        self.lock_state().last_applied = None;
        if let Some(connection) = active.take() {
            info!("closing connection");
            if let Err(error) = self.backend.close(connection).await {
                warn!(error = %error, "failed to close connection");
            }
        }
    }

    fn publish(&self, state: &SessionState, epoch: u64, status: SessionStatus) {
        if state.epoch != epoch || self.is_disposed() {
            debug!(?status, "session disposed; status suppressed");
            return;
        }
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn requested_signature(&self) -> Option<String> {
        self.credentials
            .load()
            .filter(Credentials::is_complete)
            .map(|credentials| credentials.signature())
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: ConnectionBackend, S: SchemaSource> fmt::Debug for ConnectionSession<B, S> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        formatter
            .debug_struct("ConnectionSession")
            .field("status", &*self.status.borrow())
            .field("disposed", &self.is_disposed())
            .field("last_applied", &state.last_applied)
            .field("pending", &state.pending)
            .finish_non_exhaustive()
    }
}
