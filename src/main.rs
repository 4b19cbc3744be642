use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use portlink::bootstrap::{
    Bootstrap, Collaborators, CriticalError, JsonLocaleSource, LaunchContext, Platform, Presenter, UiLauncher,
};
use portlink::config::LinkConfig;
use portlink::environment::{BrowserTab, EnvironmentType, TabQuery};
use portlink::transport::ws::{self, WireCodec};
use portlink::{BootstrapError, ConfigError, LinkError, Session};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("invalid params JSON: {0}")]
    InvalidParams(#[from] serde_json::Error),
    #[error("params must be a JSON array")]
    ParamsNotArray,
}

#[derive(Parser, Debug)]
#[command(name = "portlink", about = "Talk to a background process over a multiplexed link")]
struct Cli {
    /// WebSocket URL of the background (overrides PORTLINK_URL).
    #[arg(long)]
    url: Option<String>,

    /// Window environment to announce (overrides PORTLINK_ENVIRONMENT).
    #[arg(long)]
    environment: Option<EnvironmentType>,

    /// Frame encoding (overrides PORTLINK_CODEC).
    #[arg(long)]
    codec: Option<WireCodec>,

    /// Preferred locale (overrides PORTLINK_LOCALE).
    #[arg(long)]
    locale: Option<String>,

    /// Directory holding `<locale>/messages.json` (overrides PORTLINK_LOCALES_DIR).
    #[arg(long)]
    locales_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the background state.
    State,
    /// Call a controller method.
    Invoke {
        method: String,
        /// JSON array of parameters.
        params: Option<String>,
    },
    /// Send a JSON-RPC request through the provider channel.
    Query {
        method: String,
        /// JSON array of parameters.
        params: Option<String>,
    },
    /// Print push events until the link closes.
    Watch,
}

// =============================================================================
// CLI COLLABORATORS
// =============================================================================

struct StderrPresenter;

impl Presenter for StderrPresenter {
    fn critical_error(&self, error: CriticalError) {
        tracing::error!(key = %error.key, detail = %error.detail, "cli: critical error");
        eprintln!("{error}");
    }
}

struct LogPlatform;

impl Platform for LogPlatform {
    fn open_extension_in_browser(&self) {
        info!("cli: onboarding incomplete; open the extension in a browser to finish it");
    }
}

struct NoTabs;

#[async_trait]
impl TabQuery for NoTabs {
    async fn active_tabs(&self) -> Vec<BrowserTab> {
        Vec::new()
    }
}

/// Launches by fetching the state the UI would render first.
struct StateLauncher;

#[async_trait]
impl UiLauncher for StateLauncher {
    async fn launch(&self, context: LaunchContext) -> Result<Value, BootstrapError> {
        Ok(context.background.get_state().await?)
    }
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = LinkConfig::from_env()?;
    if let Some(url) = cli.url {
        config.url = url;
    }
    if let Some(environment) = cli.environment {
        config.environment = environment;
    }
    if let Some(codec) = cli.codec {
        config.codec = codec;
    }
    if let Some(locale) = cli.locale {
        config.locale = locale;
    }
    if let Some(dir) = cli.locales_dir {
        config.locales_dir = dir;
    }

    let session = connect(&config).await?;
    let outcome = run(&session, cli.command).await;
    session.shutdown();
    outcome
}

async fn connect(config: &LinkConfig) -> Result<Session, BootstrapError> {
    let transport = ws::connect(&config.url, config.environment.as_str(), config.codec)
        .await
        .map_err(|err| BootstrapError::Connect(err.to_string()))?;
    info!(url = %config.url, peer = %transport.peer(), "cli: connected");

    let collaborators = Collaborators {
        locale: Arc::new(JsonLocaleSource::new(&config.locales_dir, &config.locale)),
        tabs: Arc::new(NoTabs),
        platform: Arc::new(LogPlatform),
        presenter: Arc::new(StderrPresenter),
        launcher: Arc::new(StateLauncher),
    };
    Bootstrap::new(config.environment, collaborators)
        .with_support_link(&config.support_link)
        .start(transport)
        .await
}

async fn run(session: &Session, command: Command) -> Result<(), CliError> {
    match command {
        Command::State => print_json(session.initial_state()),
        Command::Invoke { method, params } => {
            let params = parse_params(params.as_deref())?;
            let result = session.background().rpc().invoke(method, params).await?;
            print_json(&result)
        }
        Command::Query { method, params } => {
            let params = parse_params(params.as_deref())?;
            let result = session.chain().request(&method, params).await?;
            print_json(&result)
        }
        Command::Watch => {
            let mut events = session.background().rpc().subscribe();
            while let Some(event) = events.recv().await {
                println!("{}", serde_json::to_string(&event)?);
            }
            info!(reason = %session.disconnected().await, "cli: link closed");
            Ok(())
        }
    }
}

fn parse_params(raw: Option<&str>) -> Result<Vec<Value>, CliError> {
    match raw {
        None => Ok(Vec::new()),
        Some(text) => match serde_json::from_str::<Value>(text)? {
            Value::Array(items) => Ok(items),
            _ => Err(CliError::ParamsNotArray),
        },
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
