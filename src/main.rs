//! coffre - End-to-end encrypted, content-addressed file repository
//!
//! Usage:
//!   coffre --store local:/srv/repo init          - Initialize a repository
//!   coffre --store local:/srv/repo add FILE...   - Add files
//!   coffre --store local:/srv/repo get PATH      - Read a file back
//!   coffre --store local:/srv/repo ls [PATH]     - List a directory
//!   coffre --store local:/srv/repo rm PATH...    - Remove files
//!   coffre --store local:/srv/repo serve         - Start the HTTP server

use clap::{Parser, Subcommand};
use coffre::backend::{Backend, BackendRegistry};
use coffre::crypto::MasterKey;
use coffre::gpg::GpgCli;
use coffre::infofile::{self, InfoFile};
use coffre::repo::{PathStatus, Repository};
use coffre::server;
use coffre::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "coffre")]
#[command(version = "0.1.0")]
#[command(about = "End-to-end encrypted, content-addressed file repository")]
struct Cli {
    /// Backend connection string, e.g. local:/srv/repo
    #[arg(short, long)]
    store: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new repository
    Init {
        /// Wrap the master key with this GPG key instead of a passphrase
        #[arg(long)]
        gpg: Option<String>,
    },

    /// Add files under a destination folder
    Add {
        /// Files to add
        files: Vec<PathBuf>,

        /// Destination folder in the repository
        #[arg(short, long, default_value = "/")]
        destination: String,

        /// MIME type recorded in the encrypted metadata
        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,
    },

    /// Read a file back
    Get {
        /// Repository path
        path: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List a directory
    Ls {
        /// Repository path (defaults to the root)
        path: Option<String>,
    },

    /// Remove files or folders
    Rm {
        /// Repository paths; a trailing slash removes a whole prefix
        paths: Vec<String>,
    },

    /// Start the HTTP server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: String,
    },

    /// Manage key slots
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Upgrade the repository info file to the latest version
    Upgrade,
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Add a passphrase or GPG key slot
    Add {
        /// GPG key id; omit to add a passphrase
        #[arg(long)]
        gpg: Option<String>,
    },

    /// Remove a key slot by id (a GPG key id, or p:<n>)
    Rm {
        key_id: String,
    },

    /// List key slots
    Ls,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    if let Err(e) = run_command(&cli.store, cli.command).await {
        error!("Error: {}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(err: &Error) -> i32 {
    match err {
        Error::Config(_) | Error::InvalidPath(_) => 2,
        Error::Unlock => 3,
        Error::IndexConflict => 4,
        _ => 1,
    }
}

async fn run_command(store: &str, command: Commands) -> Result<()> {
    match command {
        Commands::Init { gpg } => cmd_init(store, gpg).await,
        Commands::Add {
            files,
            destination,
            content_type,
        } => cmd_add(store, files, &destination, &content_type).await,
        Commands::Get { path, output } => cmd_get(store, &path, output).await,
        Commands::Ls { path } => cmd_ls(store, path.as_deref().unwrap_or("/")).await,
        Commands::Rm { paths } => cmd_rm(store, paths).await,
        Commands::Serve { addr } => cmd_serve(store, &addr).await,
        Commands::Key { command } => match command {
            KeyCommands::Add { gpg } => cmd_key_add(store, gpg).await,
            KeyCommands::Rm { key_id } => cmd_key_rm(store, &key_id).await,
            KeyCommands::Ls => cmd_key_ls(store).await,
        },
        Commands::Upgrade => cmd_upgrade(store).await,
    }
}

fn open_backend(store: &str) -> Result<Arc<dyn Backend>> {
    BackendRegistry::with_defaults().from_connection_string(store)
}

/// Prompt for the repository passphrase
fn prompt_passphrase() -> Result<String> {
    let passphrase = rpassword::prompt_password("Passphrase: ")?;
    if passphrase.is_empty() {
        return Err(Error::Config("passphrase must not be empty".to_string()));
    }
    Ok(passphrase)
}

/// Open the backend, unlock the master key, and assemble a repository
async fn open_repository(store: &str) -> Result<Repository> {
    let backend = open_backend(store)?;
    let info = backend
        .get_info_file()
        .await?
        .ok_or_else(|| Error::Config("repository is not initialized".to_string()))?;

    let gpg = GpgCli::new();
    let (master_key, key_id) = infofile::unlock(&info, &gpg, prompt_passphrase).await?;
    debug!(key_id, "repository unlocked");

    Ok(Repository::open(backend, master_key, info.data_path))
}

async fn cmd_init(store: &str, gpg_key: Option<String>) -> Result<()> {
    let backend = open_backend(store)?;
    if backend.get_info_file().await?.is_some() {
        return Err(Error::Config(
            "repository is already initialized".to_string(),
        ));
    }

    let mut info = InfoFile::new();
    let master_key = MasterKey::generate()?;
    infofile::add_key(
        &mut info,
        &master_key,
        gpg_key.as_deref(),
        &GpgCli::new(),
        prompt_passphrase,
    )
    .await?;

    backend.set_info_file(&info).await?;
    println!("Initialized repository (data path: {})", info.data_path);
    Ok(())
}

async fn cmd_add(
    store: &str,
    files: Vec<PathBuf>,
    destination: &str,
    content_type: &str,
) -> Result<()> {
    if files.is_empty() {
        return Err(Error::Config("no files to add".to_string()));
    }
    let repo = open_repository(store).await?;

    let folder = destination.trim_end_matches('/');
    for file in files {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("invalid file name: {}", file.display())))?
            .to_string();
        let path = format!("{}/{}", folder, name);

        let handle = tokio::fs::File::open(&file).await?;
        let size = handle.metadata().await?.len() as i64;

        let object_id = repo.add_file(&path, content_type, handle, size).await?;
        println!("Added: {} ({})", path, object_id);
    }

    Ok(())
}

async fn cmd_get(store: &str, path: &str, output: Option<PathBuf>) -> Result<()> {
    let repo = open_repository(store).await?;

    match output {
        Some(target) => {
            let mut out = tokio::fs::File::create(&target).await?;
            repo.get_file(path, &mut out, |_, _| true).await?;
            println!("Wrote {}", target.display());
        }
        None => {
            let mut out = tokio::io::stdout();
            repo.get_file(path, &mut out, |_, _| true).await?;
        }
    }

    Ok(())
}

async fn cmd_ls(store: &str, path: &str) -> Result<()> {
    let repo = open_repository(store).await?;

    let entries = repo
        .list(path)
        .await?
        .ok_or(Error::BackendNotFound)?;
    for entry in entries {
        if entry.is_dir {
            println!("{}/", entry.name);
        } else {
            println!("{}", entry.name);
        }
    }
    Ok(())
}

async fn cmd_rm(store: &str, paths: Vec<String>) -> Result<()> {
    if paths.is_empty() {
        return Err(Error::Config("no paths to remove".to_string()));
    }
    let repo = Arc::new(open_repository(store).await?);

    let (tx, mut rx) = mpsc::channel(16);
    let remover = tokio::spawn({
        let repo = repo.clone();
        async move {
            for path in paths {
                repo.remove_path(&path, &tx).await;
            }
        }
    });

    let mut failures = 0usize;
    while let Some(result) = rx.recv().await {
        match result.status {
            PathStatus::Ok => println!("Removed: {}", result.path),
            PathStatus::NotFound => println!("Not found: {}", result.path),
            PathStatus::InternalError(e) => {
                failures += 1;
                error!("Error removing {}: {}", result.path, e);
            }
        }
    }
    remover
        .await
        .map_err(|e| Error::Internal(format!("remove task failed: {}", e)))?;

    if failures > 0 {
        return Err(Error::Internal(format!(
            "{} path(s) could not be removed",
            failures
        )));
    }
    Ok(())
}

async fn cmd_serve(store: &str, addr: &str) -> Result<()> {
    let addr = addr
        .parse()
        .map_err(|_| Error::Config(format!("invalid listen address: {}", addr)))?;
    let repo = Arc::new(open_repository(store).await?);
    server::serve(repo, addr).await
}

async fn cmd_key_add(store: &str, gpg_key: Option<String>) -> Result<()> {
    let backend = open_backend(store)?;
    let mut info = backend
        .get_info_file()
        .await?
        .ok_or_else(|| Error::Config("repository is not initialized".to_string()))?;

    let gpg = GpgCli::new();
    let (master_key, _) = infofile::unlock(&info, &gpg, prompt_passphrase).await?;
    infofile::add_key(&mut info, &master_key, gpg_key.as_deref(), &gpg, || {
        let new = rpassword::prompt_password("New passphrase: ")?;
        if new.is_empty() {
            return Err(Error::Config("passphrase must not be empty".to_string()));
        }
        Ok(new)
    })
    .await?;

    backend.set_info_file(&info).await?;
    println!("Key added");
    Ok(())
}

async fn cmd_key_rm(store: &str, key_id: &str) -> Result<()> {
    let backend = open_backend(store)?;
    let mut info = backend
        .get_info_file()
        .await?
        .ok_or_else(|| Error::Config("repository is not initialized".to_string()))?;

    // Require a successful unlock before letting anyone drop a slot
    let gpg = GpgCli::new();
    infofile::unlock(&info, &gpg, prompt_passphrase).await?;

    info.remove_key(key_id)?;
    backend.set_info_file(&info).await?;
    println!("Key removed: {}", key_id);
    Ok(())
}

async fn cmd_key_ls(store: &str) -> Result<()> {
    let backend = open_backend(store)?;
    let info = backend
        .get_info_file()
        .await?
        .ok_or_else(|| Error::Config("repository is not initialized".to_string()))?;

    let mut passphrase_slot = 0usize;
    for key in &info.keys {
        if key.gpg_key.is_empty() {
            println!("p:{}  (passphrase)", passphrase_slot);
            passphrase_slot += 1;
        } else {
            println!("{}  (GPG)", key.gpg_key);
        }
    }
    if info.salt.is_some() {
        println!("{}  (legacy v1 passphrase)", infofile::LEGACY_KEY_ID);
    }
    Ok(())
}

async fn cmd_upgrade(store: &str) -> Result<()> {
    let backend = open_backend(store)?;
    let mut info = backend
        .get_info_file()
        .await?
        .ok_or_else(|| Error::Config("repository is not initialized".to_string()))?;

    let from = info.version;
    info.upgrade(prompt_passphrase)?;
    backend.set_info_file(&info).await?;
    println!("Upgraded repository from version {} to {}", from, info.version);
    Ok(())
}
