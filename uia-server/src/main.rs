// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  UIA Proxy — Matrix user-interactive auth in front of a homeserver
//
//  Stages:   password / dummy / welcome-message / SSO (OIDC) / CRM JWT
//  Upstream: com.famedly.login.token JWT handoff
//  Config:   YAML via figment, UIA_* env overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use uia_core::UiaConfig;
use uia_core::config::LoggingConfig;

#[derive(Parser, Debug)]
#[command(name = "uia-proxy", version, about = "Matrix UIA authentication proxy")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Console log level, overriding the config file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Re-derive and rewrite every username-mapper entry that carries a
    /// persistent ID, refreshing usernames from LDAP when configured
    Repair,
}

fn init_logging(config: &LoggingConfig, cli_level: Option<&str>) -> anyhow::Result<()> {
    let timer = ChronoLocal::new(config.line_date_format.clone());

    let console_level = cli_level.unwrap_or(config.console.as_str());
    let console = tracing_subscriber::fmt::layer()
        .with_timer(timer.clone())
        .with_target(false)
        .with_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(console_level)),
        );

    let mut file_layers = Vec::new();
    for file_config in &config.files {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_config.file)
            .with_context(|| format!("cannot open log file {}", file_config.file.display()))?;
        file_layers.push(
            tracing_subscriber::fmt::layer()
                .with_timer(timer.clone())
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .with_filter(EnvFilter::new(&file_config.level))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(file_layers)
        .with(console)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .to_str()
        .context("config path is not valid UTF-8")?;
    let config = UiaConfig::load(config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    init_logging(&config.logging, cli.log_level.as_deref())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = config_path,
        "UIA proxy starting"
    );

    match cli.command {
        Some(Command::Repair) => uia_server::repair::run(&config).await,
        None => uia_server::serve(config).await,
    }
}
