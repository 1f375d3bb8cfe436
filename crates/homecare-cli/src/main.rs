//! homecare - terminal client for the home-healthcare session lifecycle.
//!
//! Logs in against the care backend, shows the state of the stored session,
//! and can keep a session under watch: periodic re-validation and silent
//! refresh, exactly as the browser client does.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use homecare_core::auth::{AuthPhase, AuthSnapshot, Navigator, ProviderOptions, Route};
use homecare_core::config::STORE_PASSPHRASE_ENV;
use homecare_core::{AuthProvider, Config, HttpAuthBackend, SessionManager};

// ============================================================================
// Constants
// ============================================================================

/// Log file prefix for the rolling file appender
const LOG_FILE_PREFIX: &str = "homecare.log";

/// Route the terminal pretends to be on while watching
const WATCH_ROUTE: &str = "/";

#[derive(Debug, Parser)]
#[command(name = "homecare", version, about = "Home-healthcare session client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in and store the session
    Login {
        /// Username or email (defaults to HOMECARE_USERNAME, then the last one used)
        #[arg(short, long)]
        username: Option<String>,
        /// Keep the login for up to 30 days
        #[arg(short, long)]
        remember_me: bool,
    },
    /// End the session and remove stored tokens
    Logout,
    /// Show the stored session and whether it is still valid
    Status,
    /// Renew the access token now
    Refresh,
    /// Keep the session checked and refreshed until it ends or Ctrl+C
    Watch,
}

/// Initialize the tracing subscriber for logging.
/// Returns the file appender guard when file logging is enabled; keep it alive
/// until exit so buffered lines are flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let _ = std::fs::create_dir_all(dir);
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

/// Tells the person at the terminal to log in again.
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn redirect_to_login(&self, _login: &Route) {
        eprintln!("Session ended. Run `homecare login` to sign in again.");
    }
}

fn build_provider(config: &Config, cache_dir: &Path, options: ProviderOptions) -> Result<AuthProvider> {
    let passphrase = std::env::var(STORE_PASSPHRASE_ENV).ok();
    let store = config.open_token_store(cache_dir, passphrase.as_deref())?;
    let backend = Arc::new(HttpAuthBackend::new(&config.api_base_url)?);
    let manager = SessionManager::new(store, backend).with_policy(config.session_policy()?);
    Ok(AuthProvider::new(
        Arc::new(manager),
        Arc::new(TerminalNavigator),
        options,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config ({}), using defaults", e);
            Config::default()
        }
    };
    config.apply_env();

    let cache_dir = config.cache_dir().unwrap_or_else(|_| PathBuf::from("./cache"));

    // Only the long-running watcher writes a log file
    let log_dir = matches!(cli.command, Command::Watch).then_some(cache_dir.as_path());
    let _guard = init_tracing(log_dir);
    info!(api = %config.api_base_url, "homecare starting");

    let options = config.provider_options();
    let provider = build_provider(&config, &cache_dir, options)?;

    match cli.command {
        Command::Login { username, remember_me } => {
            login(&provider, &mut config, username, remember_me).await
        }
        Command::Logout => {
            provider.set_location(provider.options().login_route.clone());
            provider.logout();
            println!("Logged out.");
            Ok(())
        }
        Command::Status => status(&provider),
        Command::Refresh => refresh(&provider).await,
        Command::Watch => watch(&provider).await,
    }
}

async fn login(
    provider: &AuthProvider,
    config: &mut Config,
    username: Option<String>,
    remember_me: bool,
) -> Result<()> {
    provider.set_location(provider.options().login_route.clone());
    provider.initialize().await;
    if let Some(user) = provider.snapshot().user {
        println!("Already logged in as {}. Run `homecare logout` first.", user.display_name);
        return Ok(());
    }

    let username = match username.or_else(|| std::env::var("HOMECARE_USERNAME").ok()) {
        Some(u) => u,
        None => prompt_username(config.last_username.as_deref())?,
    };
    if username.is_empty() {
        return Err(anyhow!("Username required"));
    }

    let password = match std::env::var("HOMECARE_PASSWORD") {
        Ok(p) if !p.is_empty() => p,
        _ => rpassword::prompt_password("Password: ")?,
    };

    println!("Authenticating...");
    match provider.sign_in(&username, &password, remember_me).await {
        Ok(user) => {
            config.last_username = Some(username);
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to save config");
            }
            println!("Logged in as {} ({})", user.display_name, user.role);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Login failed");
            Err(anyhow!(e.user_message()))
        }
    }
}

fn prompt_username(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Username [{}]: ", last),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    Ok(match (input.is_empty(), last) {
        (true, Some(last)) => last.to_string(),
        _ => input.to_string(),
    })
}

fn status(provider: &AuthProvider) -> Result<()> {
    let manager = provider.manager();
    let Some(session) = manager.get_session()? else {
        println!("Not logged in.");
        return Ok(());
    };

    let result = manager.validate_session();
    let now = manager.now();
    println!("User:        {} ({})", session.user.display_name, session.user.username);
    println!("Role:        {}", session.user.role);
    println!("Remember me: {}", if session.remember_me { "yes" } else { "no" });
    println!(
        "Expires:     {} ({} min left)",
        session.expires_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        session.minutes_until_expiry(now)
    );
    if session.remember_me {
        println!(
            "Login until: {}",
            session
                .remember_me_deadline(manager.policy())
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
        );
    }

    if result.is_valid {
        let refresh = if manager.should_refresh_session() { " (refresh due)" } else { "" };
        println!("Status:      valid{}", refresh);
    } else {
        println!("Status:      invalid ({:?})", result.reason);
    }
    Ok(())
}

async fn refresh(provider: &AuthProvider) -> Result<()> {
    match provider.manager().refresh_session().await {
        Ok(session) => {
            println!(
                "Session renewed until {}",
                session.expires_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Refresh failed");
            Err(anyhow!(e.user_message()))
        }
    }
}

fn describe(snapshot: &AuthSnapshot) -> String {
    match (&snapshot.phase, &snapshot.user) {
        (AuthPhase::Authenticated, Some(user)) => format!("logged in as {}", user.display_name),
        (AuthPhase::Unauthenticated, _) => "logged out".to_string(),
        (phase, _) => format!("{:?}", phase).to_lowercase(),
    }
}

async fn watch(provider: &AuthProvider) -> Result<()> {
    provider.set_location(Route::new(WATCH_ROUTE));
    let mut rx = provider.subscribe();
    let mount = provider.mount();
    println!("Watching session (Ctrl+C to stop)...");

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                println!("[{}] {}", Local::now().format("%H:%M:%S"), describe(&snapshot));
                if let Some(ref notice) = snapshot.notice {
                    println!("{}", notice);
                }
                if snapshot.phase == AuthPhase::Unauthenticated {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    mount.teardown().await;
    info!("Watch stopped");
    Ok(())
}
