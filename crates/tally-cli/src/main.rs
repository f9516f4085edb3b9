//! Tally CLI - operate one device of the offline-first retail fleet
//!
//! Mutations apply to the local snapshot immediately and are delivered to
//! the central server opportunistically; the CLI works identically with
//! and without connectivity.

use std::env;
use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tally_core::engine::Schedule;
use tally_core::{
    session, HttpRemote, LoginOutcome, MutationKind, Record, Registry, RemoteError, SyncEngine,
    SyncStatus,
};
use thiserror::Error;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Offline-first point-of-sale sync from the command line")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional data directory override
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the server schema
    Init,
    /// Log this device in as a user
    Login {
        username: String,
        password: String,
    },
    /// Release this device's session
    Logout,
    /// Insert a record: tally add products '{"name":"Espresso","price":3.5}'
    Add {
        table: String,
        /// Record payload as a JSON object
        json: String,
    },
    /// Update a record by primary key
    Set {
        table: String,
        /// Record payload as a JSON object, carrying the primary key
        json: String,
    },
    /// Delete a record by primary key
    Rm {
        table: String,
        /// Primary-key value
        id: String,
    },
    /// Drain the pending sync queue
    Sync,
    /// Replace the local snapshot with the server's current state
    Hydrate,
    /// Show connectivity, queue depth, and local table sizes
    Status,
    /// Print a table's local records as JSON
    List {
        table: String,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] tally_core::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Record payload must be a JSON object")]
    InvalidPayload,
    #[error("Not logged in. Run `tally login <username> <password>` first.")]
    NotLoggedIn,
    #[error("Login rejected: {0}")]
    LoginRejected(String),
    #[error("This account is active on another device. Log out there first or wait for its session to expire.")]
    SessionActive,
    #[error("TALLY_SERVER_URL is not set. Point it at the central server, e.g. https://pos.example.com/rpc")]
    MissingServerUrl,
}

/// Session persisted between CLI invocations.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    user_id: String,
    username: String,
    device_id: String,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tally=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir);

    match cli.command {
        Commands::Init => run_init().await,
        Commands::Login { username, password } => run_login(&username, &password, &data_dir).await,
        Commands::Logout => run_logout(&data_dir).await,
        Commands::Add { table, json } => {
            run_mutation(&table, MutationKind::Insert, &json, &data_dir).await
        }
        Commands::Set { table, json } => {
            run_mutation(&table, MutationKind::Update, &json, &data_dir).await
        }
        Commands::Rm { table, id } => run_delete(&table, &id, &data_dir).await,
        Commands::Sync => run_sync(&data_dir).await,
        Commands::Hydrate => run_hydrate(&data_dir).await,
        Commands::Status => run_status(&data_dir),
        Commands::List { table } => run_list(&table, &data_dir),
    }
}

async fn run_init() -> Result<(), CliError> {
    use tally_core::RemoteAuthority;
    let remote = remote_from_env()?;
    remote.init_schema().await?;
    println!("Schema initialized");
    Ok(())
}

async fn run_login(username: &str, password: &str, data_dir: &Path) -> Result<(), CliError> {
    let registry = Registry::retail();
    let remote = remote_from_env()?;
    let device_id = load_or_create_device_id(data_dir)?;

    match session::login(&remote, &registry, username, password, &device_id).await? {
        Ok(established) => {
            save_session(
                data_dir,
                &StoredSession {
                    user_id: established.user_id,
                    username: username.to_string(),
                    device_id,
                },
            )?;
            println!("Logged in as {username}");
            Ok(())
        }
        Err(LoginOutcome::ActiveElsewhere) => Err(CliError::SessionActive),
        Err(LoginOutcome::Rejected(message)) => Err(CliError::LoginRejected(message)),
        Err(LoginOutcome::Accepted(_)) => unreachable!("accepted logins are handled above"),
    }
}

async fn run_logout(data_dir: &Path) -> Result<(), CliError> {
    use tally_core::RemoteAuthority;
    let stored = load_session(data_dir)?.ok_or(CliError::NotLoggedIn)?;
    let remote = remote_from_env()?;
    remote.logout(&stored.user_id).await?;
    let _ = std::fs::remove_file(session_path(data_dir));
    println!("Logged out {}", stored.username);
    Ok(())
}

async fn run_mutation(
    table: &str,
    kind: MutationKind,
    json: &str,
    data_dir: &Path,
) -> Result<(), CliError> {
    let payload = parse_payload(json)?;
    let mut engine = open_engine(data_dir)?;

    let def = Registry::retail()
        .get(table)
        .ok_or_else(|| tally_core::Error::UnknownTable(table.to_string()))?;
    let applied = engine.apply_local(table, kind, payload)?;
    if let Some(key) = applied.primary_key_of(def) {
        println!("{key}");
    }

    refresh_presence(data_dir).await;
    drain(&mut engine).await;
    report_backlog(&engine);
    Ok(())
}

async fn run_delete(table: &str, id: &str, data_dir: &Path) -> Result<(), CliError> {
    let def = Registry::retail()
        .get(table)
        .ok_or_else(|| tally_core::Error::UnknownTable(table.to_string()))?;
    let mut payload = Record::new();
    payload.insert(def.primary_key, serde_json::Value::String(id.to_string()));

    let mut engine = open_engine(data_dir)?;
    engine.apply_local(table, MutationKind::Delete, payload)?;
    println!("{id}");

    refresh_presence(data_dir).await;
    drain(&mut engine).await;
    report_backlog(&engine);
    Ok(())
}

async fn run_sync(data_dir: &Path) -> Result<(), CliError> {
    let mut engine = open_engine(data_dir)?;
    let pending = engine.queue().len();
    if pending == 0 {
        println!("Nothing to sync");
        return Ok(());
    }

    refresh_presence(data_dir).await;
    drain(&mut engine).await;
    match engine.status() {
        SyncStatus::Offline => report_backlog(&engine),
        _ => println!("Synced {pending} mutation(s)"),
    }
    Ok(())
}

async fn run_hydrate(data_dir: &Path) -> Result<(), CliError> {
    let mut engine = open_engine(data_dir)?;
    refresh_presence(data_dir).await;
    engine.hydrate().await?;
    let total: usize = Registry::retail()
        .tables()
        .map(|t| engine.store().records(t.name).len())
        .sum();
    println!("Hydrated {total} record(s)");
    Ok(())
}

fn run_status(data_dir: &Path) -> Result<(), CliError> {
    let engine = open_engine(data_dir)?;
    let session_line = load_session(data_dir)?
        .map_or_else(|| "not logged in".to_string(), |s| s.username);

    println!("user:     {session_line}");
    println!("pending:  {} queued mutation(s)", engine.queue().len());
    for table in Registry::retail().tables() {
        println!("{:<12} {} record(s)", table.name, engine.store().records(table.name).len());
    }
    Ok(())
}

fn run_list(table: &str, data_dir: &Path) -> Result<(), CliError> {
    Registry::retail()
        .get(table)
        .ok_or_else(|| tally_core::Error::UnknownTable(table.to_string()))?;
    let engine = open_engine(data_dir)?;
    let records = engine.store().records(table);
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

/// Refresh this device's presence row, best effort. A one-shot command
/// has no long-running heartbeat loop, so each server-facing invocation
/// beats once to keep the session from aging out of the 120-second
/// staleness window between invocations.
async fn refresh_presence(data_dir: &Path) {
    use tally_core::RemoteAuthority;
    let Ok(Some(stored)) = load_session(data_dir) else {
        return;
    };
    let Ok(remote) = remote_from_env() else {
        return;
    };
    if let Err(error) = remote.heartbeat(&stored.user_id, &stored.device_id).await {
        tracing::debug!(%error, "presence heartbeat failed; continuing offline");
    }
}

/// Drain until the queue is empty or the server stops answering. A
/// zero-delay reschedule (conflict renumbering) continues immediately.
async fn drain(engine: &mut SyncEngine<HttpRemote>) {
    loop {
        match engine.drain_once().await {
            Schedule::Idle => break,
            Schedule::Again(delay) => {
                if engine.status() == SyncStatus::Offline {
                    break;
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn report_backlog(engine: &SyncEngine<HttpRemote>) {
    let pending = engine.queue().len();
    if pending > 0 {
        println!("Offline: {pending} mutation(s) queued for the next sync");
    }
}

fn open_engine(data_dir: &Path) -> Result<SyncEngine<HttpRemote>, CliError> {
    let remote = remote_from_env()?;
    std::fs::create_dir_all(data_dir)?;
    Ok(SyncEngine::with_snapshot(
        Registry::retail(),
        remote,
        snapshot_path(data_dir),
    )?)
}

fn remote_from_env() -> Result<HttpRemote, CliError> {
    let endpoint = env::var("TALLY_SERVER_URL").map_err(|_| CliError::MissingServerUrl)?;
    Ok(HttpRemote::new(endpoint, Registry::retail())?)
}

fn parse_payload(json: &str) -> Result<Record, CliError> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|_| CliError::InvalidPayload)?;
    Record::from_json(value).map_err(|_| CliError::InvalidPayload)
}

fn resolve_data_dir(cli_data_dir: Option<PathBuf>) -> PathBuf {
    cli_data_dir
        .or_else(|| env::var_os("TALLY_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(default_data_dir)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tally")
}

fn snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join("device.json")
}

fn session_path(data_dir: &Path) -> PathBuf {
    data_dir.join("session.json")
}

fn device_id_path(data_dir: &Path) -> PathBuf {
    data_dir.join("device-id")
}

/// A device keeps one stable identity across logins; it is minted on
/// first use.
fn load_or_create_device_id(data_dir: &Path) -> Result<String, CliError> {
    let path = device_id_path(data_dir);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    let id = uuid::Uuid::now_v7().to_string();
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, &id)?;
    Ok(id)
}

fn save_session(data_dir: &Path, session: &StoredSession) -> Result<(), CliError> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(session_path(data_dir), serde_json::to_vec_pretty(session)?)?;
    Ok(())
}

fn load_session(data_dir: &Path) -> Result<Option<StoredSession>, CliError> {
    match std::fs::read(session_path(data_dir)) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}
