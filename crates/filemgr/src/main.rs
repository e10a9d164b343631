//! filemgr
//!
//! Command line front end for the secure file manager.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use filemgr::auth::{self, Authenticator, SessionFile};
use filemgr::files::{EntryType, ReadFormat, Sandbox};
use filemgr::system::disk_stats;
use filemgr::{Config, FileManager, WriteSource};
use records::{Database, OperationLog, UserStore};
use tracing_subscriber::EnvFilter;

/// filemgr - secure file manager.
#[derive(Parser, Debug)]
#[command(name = "filemgr")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Show disk stats
    DiskStats,

    /// List directory
    List {
        /// Directory relative to the storage root
        #[arg(default_value = ".")]
        path: String,
    },

    /// Read file
    Read {
        path: String,

        /// How to present the content
        #[arg(long, value_enum, default_value = "text")]
        format: ReadFormat,
    },

    /// Create a new file (optionally with content)
    CreateFile {
        /// Path to new file
        path: String,

        /// Optional text to write into file
        #[arg(long, default_value = "")]
        content: String,
    },

    /// Write file (read data from stdin unless --from-file supplied)
    Write {
        path: String,

        /// Read contents from local file instead of stdin
        #[arg(long, value_name = "FILE")]
        from_file: Option<PathBuf>,
    },

    /// Delete file
    Delete { path: String },

    /// Create zip from a directory or file
    CreateZip { src: String, dst: String },

    /// Extract zip file safely
    ExtractZip {
        zip: String,

        #[arg(long, default_value = ".")]
        outdir: String,
    },

    /// Show the operation history, newest first
    History {
        /// Maximum number of entries
        #[arg(long, short)]
        limit: Option<u32>,
    },

    /// Login
    Login { username: String, password: String },

    /// Logout
    Logout,

    /// Show the logged-in user
    Whoami,

    /// Create user
    CreateUser { username: String, password: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the configuration and return it with the environment overrides
/// that were applied.
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<(Config, Vec<&'static str>)> {
    let mut config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let overrides = config.apply_env_overrides();
    config.validate()?;
    Ok((config, overrides))
}

fn open_database(config: &Config) -> anyhow::Result<Database> {
    let path = config.database_path();
    Database::open(&path)
        .with_context(|| format!("Failed to open record database: {}", path.display()))
}

fn open_manager(config: &Config) -> anyhow::Result<FileManager<Database, SessionFile>> {
    let sandbox = Sandbox::new(&config.storage.root, config.storage.max_filename_length)?;
    let db = open_database(config)?;
    let session = SessionFile::new(config.session_path());
    Ok(FileManager::new(sandbox, config.limits(), db, session))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let (config, overrides) = load_config(cli.config.as_ref())?;
    init_logging(cli.verbose, &config.general.log_level);
    for var in overrides {
        tracing::info!(var, "Applied configuration override from environment");
    }
    tracing::debug!(root = %config.storage.root.display(), "Loaded configuration");

    match cli.command {
        Commands::DiskStats => {
            for usage in disk_stats(&config.storage.root) {
                println!("{usage}");
            }
        }
        Commands::List { path } => {
            let manager = open_manager(&config)?;
            for entry in manager.list(&path).await? {
                let tag = match entry.entry_type {
                    EntryType::Directory => "[DIR]",
                    EntryType::Symlink => "[LNK]",
                    _ => "     ",
                };
                println!("{} {:40} {:10}", tag, entry.name, entry.size);
            }
        }
        Commands::Read { path, format } => {
            let manager = open_manager(&config)?;
            println!("{}", manager.read(&path, format).await?);
        }
        Commands::CreateFile { path, content } => {
            let manager = open_manager(&config)?;
            let record = manager.create_file(&path, content.as_bytes()).await?;
            println!("Created file: {} ({} bytes)", record.file_name, record.file_size);
        }
        Commands::Write { path, from_file } => {
            let manager = open_manager(&config)?;
            let source = match from_file {
                Some(file) => WriteSource::LocalFile(file),
                None => WriteSource::Stdin,
            };
            let outcome = manager.write(&path, source).await?;
            println!(
                "Wrote: {} ({} bytes)",
                outcome.record.file_name, outcome.record.file_size
            );
        }
        Commands::Delete { path } => {
            let manager = open_manager(&config)?;
            let record = manager.delete(&path).await?;
            println!("Deleted: {}", record.file_name);
        }
        Commands::CreateZip { src, dst } => {
            let manager = open_manager(&config)?;
            let summary = manager.create_zip(&src, &dst).await?;
            println!("Created zip {} ({} files)", dst, summary.files);
        }
        Commands::ExtractZip { zip, outdir } => {
            let manager = open_manager(&config)?;
            let summary = manager.extract_zip(&zip, &outdir).await?;
            println!("Extracted zip to {} ({} files)", outdir, summary.files);
        }
        Commands::History { limit } => {
            let db = open_database(&config)?;
            if SessionFile::new(config.session_path())
                .current_user_id()
                .is_none()
            {
                bail!("not authenticated");
            }
            for op in db.list(limit).await? {
                println!(
                    "{:>6} {:<6} file={} user={} at={}",
                    op.id, op.op_type, op.file_id, op.user_id, op.created_at
                );
            }
        }
        Commands::Login { username, password } => {
            let db = open_database(&config)?;
            let session = SessionFile::new(config.session_path());
            let user = auth::login(&db, &session, &username, &password).await?;
            println!("User logged in: {}", user.username);
        }
        Commands::Logout => {
            auth::logout(&SessionFile::new(config.session_path()))?;
            println!("User logged out");
        }
        Commands::Whoami => {
            let session = SessionFile::new(config.session_path());
            let Some(user_id) = session.current_user_id() else {
                bail!("not authenticated");
            };
            let db = open_database(&config)?;
            match db.fetch_by_id(user_id).await? {
                Some(user) => println!("{} (id {})", user.username, user.id),
                None => bail!("session refers to unknown user {user_id}"),
            }
        }
        Commands::CreateUser { username, password } => {
            let db = open_database(&config)?;
            let user = auth::create_user(&db, &username, &password).await?;
            println!("User created successfully: {} (id {})", user.username, user.id);
        }
    }

    Ok(())
}
