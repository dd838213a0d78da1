//! kdb - Command-line access to KeePass KDB and KDBX databases
//!
//! Opens a database with a password and/or key file, prints its tree,
//! searches and edits entries, and writes changes back atomically. Key
//! derivation and file I/O run on the blocking pool while progress is
//! printed from the async side.

mod commands;
mod config;
mod session;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kdb_core::Credentials;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

use crate::commands::NewEntry;
use crate::config::{Config, FormatChoice};
use crate::session::DatabaseSession;

#[derive(Debug, Parser)]
#[command(name = "kdb", version, about = "Read and edit KeePass databases")]
struct Cli {
    /// Database file
    file: PathBuf,

    /// Read the master password from this environment variable
    #[arg(long, value_name = "VAR", conflicts_with = "password_stdin")]
    password_env: Option<String>,

    /// Read the master password from the first line of stdin
    #[arg(long)]
    password_stdin: bool,

    /// Key file
    #[arg(long, value_name = "PATH")]
    keyfile: Option<PathBuf>,

    /// Config file instead of the standard locations
    #[arg(long, value_name = "PATH", env = "KDB_CONFIG")]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show database properties
    Info,
    /// Print the group hierarchy
    Tree,
    /// List entries
    List {
        /// Only entries below this `/`-separated group path
        #[arg(long, value_name = "PATH")]
        group: Option<String>,
    },
    /// Show one entry
    Show {
        /// Entry UUID or title
        entry: String,
        /// Print protected fields in clear text
        #[arg(long)]
        reveal: bool,
    },
    /// Search entries
    Search {
        query: String,
        #[arg(long)]
        in_passwords: bool,
        #[arg(long)]
        case_sensitive: bool,
    },
    /// Add an entry
    Add {
        #[arg(long, value_name = "PATH")]
        group: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        url: Option<String>,
        /// Read the entry password from this environment variable
        #[arg(long = "password-env", value_name = "VAR")]
        entry_password_env: Option<String>,
    },
    /// Change fields of an entry, keeping the old version in its history
    Edit {
        /// Entry UUID or title
        entry: String,
        #[arg(long = "field", value_name = "NAME=VALUE", value_parser = commands::parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Remove an entry, to the recycle bin unless --permanent
    Rm {
        /// Entry UUID or title
        entry: String,
        #[arg(long)]
        permanent: bool,
    },
    /// Dump every group and entry, secrets included, as JSON
    ExportJson,
    /// Create an empty database at FILE
    New {
        #[arg(long, value_enum)]
        format: Option<FormatChoice>,
        #[arg(long)]
        name: Option<String>,
    },
}

fn init_tracing(config: &Config) {
    let fallback = config
        .logging
        .level
        .clone()
        .unwrap_or_else(|| "kdb_cli=info,kdb_core=info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn env_secret(var: &str) -> anyhow::Result<Zeroizing<String>> {
    std::env::var(var)
        .map(Zeroizing::new)
        .with_context(|| format!("Environment variable {} is not set", var))
}

fn credentials(cli: &Cli) -> anyhow::Result<Credentials> {
    let password = if let Some(var) = &cli.password_env {
        Some(env_secret(var)?)
    } else if cli.password_stdin {
        let mut line = Zeroizing::new(String::new());
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Cannot read password from stdin")?;
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Some(line)
    } else {
        None
    };

    let mut credentials = Credentials::new();
    if let Some(password) = password {
        credentials = credentials.with_password(password.as_str());
    }
    if let Some(path) = &cli.keyfile {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Cannot open key file {}", path.display()))?;
        credentials = credentials.with_key_file(file)?;
    }
    Ok(credentials)
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let credentials = credentials(&cli)?;
    let json = cli.json;

    let session = match &cli.command {
        Command::New { format, name } => {
            let name = name.clone().unwrap_or_else(|| {
                cli.file
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "Database".to_string())
            });
            let options = config.new_database(&name, *format);
            DatabaseSession::create(&cli.file, options, credentials).await?
        }
        _ => DatabaseSession::open(&cli.file, credentials).await?,
    };

    match cli.command {
        Command::Info | Command::New { .. } => commands::info(&session, json).await,
        Command::Tree => commands::tree(&session, json).await,
        Command::List { group } => commands::list(&session, group.as_deref(), json).await,
        Command::Show { entry, reveal } => commands::show(&session, &entry, reveal, json).await,
        Command::Search {
            query,
            in_passwords,
            case_sensitive,
        } => {
            let mut params = config.search.clone();
            params.search_in_passwords |= in_passwords;
            if case_sensitive {
                params.ignore_case = false;
            }
            commands::search(&session, &query, params, json).await
        }
        Command::Add {
            group,
            title,
            username,
            url,
            entry_password_env,
        } => {
            let password = entry_password_env.as_deref().map(env_secret).transpose()?;
            let new = NewEntry {
                group,
                title,
                username,
                url,
                password,
            };
            commands::add(&session, new, json).await
        }
        Command::Edit { entry, fields } => commands::edit(&session, &entry, fields).await,
        Command::Rm { entry, permanent } => commands::remove(&session, &entry, permanent).await,
        Command::ExportJson => commands::export_json(&session).await,
    }
}

/// Print the error category and detail
fn report(err: &anyhow::Error) {
    match err.downcast_ref::<kdb_core::Error>() {
        Some(e) => {
            let kind = serde_json::to_value(e.kind())
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{:?}", e.kind()));
            eprintln!("error [{}]: {:#}", kind, err);
        }
        None => eprintln!("error: {:#}", err),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            report(&e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config);
    match &config.source {
        Some(path) => tracing::debug!("Loaded config from {}", path.display()),
        None => tracing::debug!("Using default configuration"),
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}
