//! xoauth2-token - cached OAuth2 access token helper
//!
//! Resolves a valid access token for a username and prints it (and nothing
//! else) to stdout, refreshing or re-authorizing as needed. Built as the
//! XOAUTH2 companion of an SMTP client, which invokes `get` and reads the
//! token from the pipe.

mod auth;
mod config;
mod store;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::{grant::BrowserGrant, refresh::HttpRefreshClient, CredentialResolver, ResolveError};
use config::{Settings, SettingsError};
use store::StoreError;

// Exit codes consumed by the calling SMTP client.
const EXIT_CONFIG: u8 = 2;
const EXIT_CORRUPT_STORE: u8 = 3;
const EXIT_TRANSIENT: u8 = 4;
const EXIT_GRANT: u8 = 5;

#[derive(Parser)]
#[command(name = "xoauth2-token")]
#[command(about = "Cached OAuth2 access token helper for SMTP XOAUTH2", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a valid access token and print it to stdout
    Get {
        /// Account to resolve (overrides the `username` environment variable)
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Show cached credential status for all stored users
    Status,

    /// Remove a user's cached credentials (local only, no revocation)
    Logout {
        /// Account to remove (overrides the `username` environment variable)
        #[arg(short, long)]
        username: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries only the resolved token.
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // `.env` in the working directory, as the original deployment used.
    let _ = dotenvy::dotenv();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Get { username } => {
            let settings = Settings::from_env(username)?;
            let refresher =
                HttpRefreshClient::new(settings.token_url.clone(), config::REQUEST_TIMEOUT)
                    .context("failed to build HTTP client")?;
            let grant = BrowserGrant::new(&settings);
            let resolver = CredentialResolver::new(&settings, refresher, grant);

            let token = resolver.resolve(&settings.username).await?;
            println!("{token}");
        }
        Commands::Status => {
            auth::status(&config::default_store_path()?)?;
        }
        Commands::Logout { username } => {
            let store_path = config::default_store_path()?;
            let username = config::resolve_username(username)?;
            auth::logout(&store_path, &username)?;
        }
    }
    Ok(())
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<SettingsError>().is_some() {
        return EXIT_CONFIG;
    }
    if let Some(err) = err.downcast_ref::<ResolveError>() {
        return match err {
            ResolveError::Store(StoreError::Corrupt { .. }) => EXIT_CORRUPT_STORE,
            ResolveError::Store(_) => 1,
            ResolveError::TransientFailure(_) => EXIT_TRANSIENT,
            ResolveError::GrantFailed(_) => EXIT_GRANT,
        };
    }
    if let Some(StoreError::Corrupt { .. }) = err.downcast_ref::<StoreError>() {
        return EXIT_CORRUPT_STORE;
    }
    1
}
