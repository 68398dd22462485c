use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use safari_bridge::{AppleScriptRunner, Config, SafariDriver, SafariSession};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Drive a local Safari through WebDriver and AppleScript.
#[derive(Parser)]
#[command(name = "safari-bridge")]
#[command(version)]
struct Cli {
    /// JSON configuration file; missing keys use defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current browser state as JSON
    State {
        /// Include a base64 screenshot
        #[arg(long)]
        screenshot: bool,

        /// Print the indexed element listing instead of JSON
        #[arg(long)]
        text: bool,
    },

    /// Load a URL in the focused tab
    Navigate {
        url: String,

        /// Open the URL in a new tab
        #[arg(long)]
        new_tab: bool,
    },

    /// Save a PNG of the viewport
    Screenshot { path: PathBuf },

    /// List open tabs with their target ids
    Tabs,

    /// Write cookies and web storage of the current page to a file
    ExportStorage { path: PathBuf },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

async fn run(session: &mut SafariSession, command: Commands) -> Result<()> {
    match command {
        Commands::State { screenshot, text } => {
            if text {
                println!("{}", session.state_as_text().await?);
            } else {
                let summary = session.collect_state(true, screenshot, true).await;
                for error in &summary.browser_errors {
                    warn!(error = %error, "state collected with degradation");
                }
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        Commands::Navigate { url, new_tab } => {
            session.navigate(&url, new_tab).await?;
            println!("{}", session.current_url().await?);
        }
        Commands::Screenshot { path } => {
            let bytes = session.take_screenshot(Some(path.as_path())).await?;
            info!(path = %path.display(), bytes = bytes.len(), "screenshot saved");
        }
        Commands::Tabs => {
            for tab in session.tab_list().await? {
                println!("{}\t{}\t{}", tab.target_id, tab.url, tab.title);
            }
        }
        Commands::ExportStorage { path } => {
            let state = session.export_storage_state(Some(path.as_path())).await?;
            println!(
                "{} cookies, {} local keys, {} session keys",
                state.cookies.len(),
                state.local_storage.len(),
                state.session_storage.len()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_ref())?;
    let driver = Arc::new(SafariDriver::new(config.driver.clone()));
    let os = Arc::new(AppleScriptRunner::new(Duration::from_millis(
        config.driver.applescript_timeout_ms,
    )));
    let mut session = SafariSession::new(config, driver, os);

    session.start().await.context("starting Safari session")?;
    let outcome = run(&mut session, cli.command).await;
    if let Err(err) = session.stop().await {
        warn!(error = %err, "Safari session did not stop cleanly");
    }
    outcome
}
