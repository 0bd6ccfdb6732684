mod cli;

use std::error::Error;
use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;

use dxb_adapters::cloud::{CloudHttpClient, HttpCloudBackend};
use dxb_adapters::schema::HttpSchemaSource;
use dxb_core::cloud_options::LoginHints;
use dxb_core::config::{default_config_dir, AppConfig};
use dxb_core::connection_session::{ConnectionBackend, ConnectionSession, SessionStatus};
use dxb_core::credentials::{CredentialStore, Credentials};
use dxb_core::location::{MemoryLocation, QueryLocation, UrlLocation};
use dxb_core::schema_cache::{parse_primary_key, SchemaSource};
use dxb_core::settings::SettingsController;
use dxb_core::storage::{FileStore, Storage, CREDENTIALS_STORAGE_KEY};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{parse_args_from, print_help, CliArgs, Command, ParseOutcome};

const CONFIG_FILE_NAME: &str = "config.toml";
const EXTERNAL_POLL_INTERVAL: Duration = Duration::from_secs(2);

type AppResult<T> = Result<T, Box<dyn Error>>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> AppResult<ExitCode> {
    let mut cli = CliArgs::default();
    if parse_args_from(std::env::args().skip(1), &mut cli)? == ParseOutcome::HelpRequested {
        print_help();
        return Ok(ExitCode::SUCCESS);
    }

    let config_dir = match cli.config_dir.clone() {
        Some(dir) => dir,
        None => default_config_dir()?,
    };
    let config = AppConfig::load_from_path(&config_dir.join(CONFIG_FILE_NAME))?;
    init_tracing(&config);
    debug!(
        core = dxb_core::domain_name(),
        adapters = dxb_adapters::adapter_name(),
        config_dir = %config_dir.display(),
        "starting"
    );

    let storage = Storage::new(FileStore::new(config.storage_path(&config_dir)));
    let mut settings =
        SettingsController::open(storage.clone(), MemoryLocation::new(location_query(&cli.location)))?;
    let client = CloudHttpClient::new(config.request_timeout())?;
    let session = ConnectionSession::new(
        HttpCloudBackend::new(client.clone(), config.public_key.clone()),
        HttpSchemaSource::new(client, config.fallback_schema_path.clone()),
        CredentialStore::new(storage),
    );

    let mut stdout = io::stdout().lock();
    let succeeded = execute(cli.command, &mut settings, &session, &mut stdout).await?;
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_tracing(config: &AppConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    // A subscriber installed by the host wins.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false)
                .with_writer(io::stderr),
        )
        .try_init();
}

/// Accepts either a bare query (`?dexie-db=…`) or a full URL.
fn location_query(raw: &str) -> String {
    UrlLocation::parse(raw).map_or_else(|_| raw.to_string(), |location| location.query())
}

/// Runs one command and writes its report to `out`. `Ok(false)` means the
/// command ran but the outcome was a failure worth a non-zero exit.
async fn execute<B, S, W>(
    command: Command,
    settings: &mut SettingsController<MemoryLocation>,
    session: &ConnectionSession<B, S>,
    out: &mut W,
) -> AppResult<bool>
where
    B: ConnectionBackend,
    S: SchemaSource,
    W: Write,
{
    match command {
        Command::List => {
            write_known_databases(settings, out)?;
            write_location(settings, out)?;
        }
        Command::Add { url } => {
            let id = match url {
                Some(url) => settings.add_database_with(Credentials::with_database_url(url))?,
                None => settings.add_database()?,
            };
            let label = settings
                .selected()
                .map_or_else(|| id.clone(), |database| database.label().to_string());
            writeln!(out, "added {id} ({label})")?;
            write_location(settings, out)?;
        }
        Command::Select { id } => {
            match settings.select_database(&id)? {
                Some(selected) if selected.id == id => {
                    writeln!(out, "selected {} ({})", selected.id, selected.label())?;
                }
                Some(selected) => {
                    writeln!(
                        out,
                        "unknown database `{id}`; keeping {} ({})",
                        selected.id,
                        selected.label()
                    )?;
                    return Ok(false);
                }
                None => {
                    writeln!(out, "no known databases")?;
                    return Ok(false);
                }
            }
            write_location(settings, out)?;
        }
        Command::Rename { name } => {
            settings.rename_selected(&name)?;
            write_status(settings, out)?;
        }
        Command::Delete => {
            let removed = settings.delete_selected()?;
            writeln!(out, "deleted {} ({})", removed.id, removed.label())?;
            write_status(settings, out)?;
        }
        Command::Set { field, value } => {
            settings.update_credentials(|credentials| credentials.set_field(&field, &value))??;
            write_status(settings, out)?;
        }
        Command::Reset => {
            settings.reset_credentials()?;
            if let Some(message) = settings.status_message() {
                writeln!(out, "{message}")?;
            }
        }
        Command::Status => write_status(settings, out)?,
        Command::Connect => {
            let result = session.test_connection().await;
            let succeeded = result.is_ok();
            let message = settings.record_connection_test(result);
            writeln!(out, "{message}")?;
            return Ok(succeeded);
        }
        Command::Schema => {
            let schema = session.schema().await;
            if schema.is_empty() {
                writeln!(out, "no tables")?;
            }
            for (table, spec) in schema.iter() {
                let key = parse_primary_key(spec);
                let key = if key.is_compound() {
                    format!("[{}]", key.members.join("+"))
                } else {
                    key.field
                };
                writeln!(out, "{table}\t{key}\t{spec}")?;
            }
        }
        Command::Login { email } => {
            let outcome = session.mount().await;
            debug!(?outcome, "mounted before login");
            let hints = LoginHints {
                email,
                user_id: None,
            };
            let result = session.login(&hints).await;
            session.shutdown().await;
            match result {
                Ok(()) => writeln!(out, "logged in")?,
                Err(error) => {
                    writeln!(out, "login failed: {error}")?;
                    return Ok(false);
                }
            }
        }
        Command::Watch => watch_session(settings.storage().clone(), session, out).await?,
    }
    Ok(true)
}

async fn watch_session<B, S, W>(
    storage: Storage,
    session: &ConnectionSession<B, S>,
    out: &mut W,
) -> AppResult<()>
where
    B: ConnectionBackend,
    S: SchemaSource,
    W: Write,
{
    let status = session.subscribe_status();
    let events = storage.subscribe();
    session.mount().await;
    writeln!(out, "status: {}", describe_status(&session.status()))?;
    info!("watching stored credentials; press Ctrl-C to stop");

    let run = session.run(events);
    tokio::pin!(run);
    let interrupted = tokio::select! {
        () = &mut run => false,
        result = follow_status(status, out) => {
            result?;
            false
        }
        () = forward_external_changes(&storage, EXTERNAL_POLL_INTERVAL) => false,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            true
        }
    };

    if interrupted {
        info!("interrupted; closing connection");
        session.unmount();
        run.await;
    }
    session.shutdown().await;
    Ok(())
}

async fn follow_status(
    mut status: watch::Receiver<SessionStatus>,
    out: &mut impl Write,
) -> io::Result<()> {
    status.mark_unchanged();
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        writeln!(out, "status: {}", describe_status(&current))?;
        out.flush()?;
    }
    Ok(())
}

/// Another process writing the same storage file produces no local event, so
/// the credential key is polled and reported as an external change.
async fn forward_external_changes(storage: &Storage, interval: Duration) {
    let mut last = storage.get_item(CREDENTIALS_STORAGE_KEY).ok().flatten();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match storage.get_item(CREDENTIALS_STORAGE_KEY) {
            Ok(current) if current != last => {
                debug!("stored credentials changed on disk");
                last = current;
                storage.notify_external(CREDENTIALS_STORAGE_KEY);
            }
            Ok(_) => {}
            Err(error) => warn!(error = %error, "failed to poll stored credentials"),
        }
    }
}

fn describe_status(status: &SessionStatus) -> String {
    match status {
        SessionStatus::Disconnected { reason: None } => "disconnected".to_string(),
        SessionStatus::Disconnected { reason: Some(reason) } => format!("disconnected: {reason}"),
        SessionStatus::Connecting => "connecting".to_string(),
        SessionStatus::Connected => "connected".to_string(),
        SessionStatus::Error { message } => format!("error: {message}"),
    }
}

fn write_known_databases(
    settings: &SettingsController<MemoryLocation>,
    out: &mut impl Write,
) -> io::Result<()> {
    if settings.known_databases().is_empty() {
        return writeln!(out, "no known databases");
    }

    let selected_id = settings.registry().selected_id();
    for database in settings.known_databases() {
        let marker = if Some(database.id.as_str()) == selected_id {
            '*'
        } else {
            ' '
        };
        writeln!(
            out,
            "{marker} {}\t{}\t{}",
            database.id,
            database.label(),
            database.credentials.database_url
        )?;
    }
    Ok(())
}

fn write_status(
    settings: &SettingsController<MemoryLocation>,
    out: &mut impl Write,
) -> io::Result<()> {
    match settings.selected() {
        Some(database) => writeln!(out, "database: {} ({})", database.label(), database.id)?,
        None => writeln!(out, "database: none")?,
    }
    let credentials = settings.credentials();
    let url = if credentials.database_url.is_empty() {
        "(not set)"
    } else {
        credentials.database_url.as_str()
    };
    writeln!(out, "url: {url}")?;
    writeln!(
        out,
        "configured: {}",
        if credentials.is_complete() { "yes" } else { "no" }
    )?;
    write_location(settings, out)
}

fn write_location(
    settings: &SettingsController<MemoryLocation>,
    out: &mut impl Write,
) -> io::Result<()> {
    let query = settings.location().query();
    if query.is_empty() {
        Ok(())
    } else {
        writeln!(out, "location: ?{query}")
    }
}
