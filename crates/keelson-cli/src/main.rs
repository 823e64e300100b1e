//! Keelson CLI - marine data server with sandboxed WASM plugins

mod store;

use anyhow::Context;
use clap::{Parser, Subcommand};
use keelson_core::config::ServerConfig;
use keelson_plugins::format::{detect_format, ensure_supported};
use keelson_plugins::{HostOptions, PluginHost, PluginSummary, RegisterMode, routes};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::store::{Feed, MemoryStore};

#[derive(Parser)]
#[command(name = "keelson")]
#[command(author, version, about = "Marine data server with sandboxed WASM plugins", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server with every configured plugin package
    Serve {
        /// Listen address (overrides server.host)
        #[arg(long)]
        host: Option<String>,
        /// Listen port (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage plugins
    Plugins {
        #[command(subcommand)]
        action: PluginAction,
    },

    /// Show the binary format of a plugin module
    Inspect {
        /// Path to a .wasm file
        file: PathBuf,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum PluginAction {
    /// List the installed plugin packages without starting any of them
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all configuration values
    Show,
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keelson=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => cmd_serve(host, port, cli.quiet).await,

        Commands::Plugins { action } => match action {
            PluginAction::List => cmd_plugins_list(cli.format, cli.quiet).await,
        },

        Commands::Inspect { file } => cmd_inspect(&file, cli.format),

        Commands::Config { action } => cmd_config(action, cli.quiet),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Host backed by an in-memory store; plugin output is routed back in
fn start_host(config: &ServerConfig) -> anyhow::Result<(PluginHost, Arc<MemoryStore>, tokio::task::JoinHandle<()>)> {
    let options = HostOptions::from_server_config(config)?;
    let (store, mut feed) = MemoryStore::new();
    let store = Arc::new(store);
    let host = PluginHost::new(options, store.clone(), Vec::new()).context("Failed to start plugin host")?;

    let router = host.clone();
    let forward = tokio::spawn(async move {
        while let Some(item) = feed.recv().await {
            match item {
                Feed::Delta(delta) => router.route_delta(&delta),
                Feed::Event(event) => router.route_event(&event),
            }
        }
    });
    Ok((host, store, forward))
}

async fn cmd_serve(host: Option<String>, port: Option<u16>, quiet: bool) -> anyhow::Result<()> {
    let mut config = ServerConfig::load()?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.validate()?;

    let (plugins, store, forward) = start_host(&config)?;
    let registered = plugins.register_all(&config.plugins.package_dirs).await;
    info!(count = registered.len(), "plugin packages loaded");

    let app = routes::router(plugins.clone()).layer(CorsLayer::permissive());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    if !quiet {
        println!("Keelson listening on http://{addr}");
        println!("  Plugins: {}", registered.len());
    }
    info!(%addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("shutting down plugins");
    plugins.shutdown_all().await;
    forward.abort();
    info!(
        paths = store.len(),
        late_responses = plugins.late_responses(),
        "server stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn cmd_plugins_list(format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let config = ServerConfig::load()?;
    let (plugins, _store, forward) = start_host(&config)?;
    plugins
        .register_all_with(&config.plugins.package_dirs, RegisterMode::Inspect)
        .await;
    let summaries = plugins.list();
    plugins.shutdown_all().await;
    forward.abort();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        OutputFormat::Text => print_plugins(&summaries, quiet),
    }
    Ok(())
}

fn print_plugins(summaries: &[PluginSummary], quiet: bool) {
    if summaries.is_empty() {
        if !quiet {
            println!("No plugins registered.");
            println!("Add package directories with `keelson config set plugins.package_dirs <dirs>`");
        }
        return;
    }
    if !quiet {
        println!("{:<32} {:<10} {:<10} NAME", "ID", "STATUS", "VERSION");
    }
    for plugin in summaries {
        println!(
            "{:<32} {:<10} {:<10} {}",
            plugin.id,
            plugin.status.as_str(),
            plugin.version,
            plugin.name
        );
        if let Some(error) = &plugin.error_message {
            println!("    error: {error}");
        }
    }
}

fn cmd_inspect(file: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let detected = detect_format(&bytes);
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "file": file.display().to_string(),
                "bytes": bytes.len(),
                "format": detected.describe(),
                "supported": detected.is_supported(),
            })
        ),
        OutputFormat::Text => {
            println!("File:      {}", file.display());
            println!("Size:      {} bytes", bytes.len());
            println!("Format:    {}", detected.describe());
        }
    }
    ensure_supported(&bytes)?;
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = ServerConfig::load()?;
            for key in ServerConfig::keys() {
                println!("{} = {}", key, config.get(key)?);
            }
        }
        ConfigAction::Get { key } => {
            let config = ServerConfig::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = ServerConfig::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::Path => {
            let path = ServerConfig::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod main_tests;
