//! easy-mcp-server: MCP protocol server
//!
//! Serves the local route catalog, prompts and resources, and proxies the
//! providers listed in `mcp-bridge.json`.
//!
//! Transports:
//!   easy-mcp-server                              # HTTP on the configured address (127.0.0.1:8888)
//!   easy-mcp-server --stdio                      # stdio only
//!   easy-mcp-server --http 0.0.0.0:8888 --stdio  # HTTP + stdio
//!   easy-mcp-server --ws 0.0.0.0:8889            # WebSocket (plus configured HTTP)
//!   easy-mcp-server --sse 0.0.0.0:8890           # standalone SSE
//!
//! Settings come from `easy-mcp-server.toml`, then `EASY_MCP_SERVER_*`
//! variables, then these flags.

use anyhow::{Context, Result};
use clap::Parser;
use easy_bridge::{resolve_config_path, watch_bridge_config, BridgeManager, BridgeSettings, BridgeSource};
use easy_core::{load_environment, Settings};
use easy_mcp::{
    content::{watch_content, ContentHandler, ContentWatcher},
    transport::{HttpTransport, McpHandler, SseTransport, StdioTransport, Transport, WebSocketTransport},
    McpServer, McpServerConfig, PromptStore, ResourceStore, SERVER_NAME, SERVER_VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "easy-mcp-server")]
#[command(about = "MCP server for API routes, prompts, resources and bridged providers")]
#[command(version)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run HTTP transport on specified address
    #[arg(long, value_name = "ADDR")]
    http: Option<String>,

    /// Run WebSocket transport on specified address
    #[arg(long, value_name = "ADDR")]
    ws: Option<String>,

    /// Run SSE-only transport on specified address
    #[arg(long, value_name = "ADDR")]
    sse: Option<String>,

    /// Run stdio transport. Alone, it disables the configured network transports.
    #[arg(long)]
    stdio: bool,

    /// Bridge configuration file (default: mcp-bridge.json lookup)
    #[arg(long, value_name = "FILE")]
    bridge_config: Option<PathBuf>,

    /// Do not start bridged providers
    #[arg(long)]
    no_bridges: bool,

    /// Directory of prompt templates
    #[arg(long, value_name = "DIR")]
    prompts_dir: Option<PathBuf>,

    /// Directory of resources
    #[arg(long, value_name = "DIR")]
    resources_dir: Option<PathBuf>,

    /// Attach cause chain, backtrace and request context to internal errors
    #[arg(long)]
    detailed_errors: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Server name override
    #[arg(long)]
    name: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        let network_flags = self.http.is_some() || self.ws.is_some() || self.sse.is_some();
        if self.stdio {
            settings.stdio = true;
            if !network_flags {
                settings.http_addr = None;
                settings.ws_addr = None;
                settings.sse_addr = None;
            }
        }
        if let Some(addr) = &self.http {
            settings.http_addr = Some(addr.clone());
        }
        if let Some(addr) = &self.ws {
            settings.ws_addr = Some(addr.clone());
        }
        if let Some(addr) = &self.sse {
            settings.sse_addr = Some(addr.clone());
        }
        if let Some(path) = &self.bridge_config {
            settings.bridge_config_path = Some(path.clone());
        }
        if self.no_bridges {
            settings.bridges_enabled = false;
        }
        if let Some(dir) = &self.prompts_dir {
            settings.prompts_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.resources_dir {
            settings.resources_dir = Some(dir.clone());
        }
        if self.detailed_errors {
            settings.detailed_errors = true;
        }
        if let Some(level) = &self.log_level {
            settings.log_level = level.clone();
        }
        if let Some(name) = &self.name {
            settings.name = name.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Before logging, so RUST_LOG may come from the env file
    let env_file = load_environment();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    cli.apply(&mut settings);

    // Logging goes to stderr so it never interferes with the stdio transport
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!(name = %settings.name, version = SERVER_VERSION, "Starting {}", SERVER_NAME);
    if let Some(path) = env_file {
        info!(path = %path.display(), "Loaded environment file");
    }

    // Bridges
    let mut bridge_watcher = None;
    let manager = if settings.bridges_enabled {
        let cwd = std::env::current_dir().context("Cannot determine working directory")?;
        match resolve_config_path(settings.bridge_config_path.as_deref(), &cwd) {
            Some(path) => {
                info!(path = %path.display(), "Using bridge configuration");
                let manager = Arc::new(BridgeManager::new(BridgeSettings::from_settings(
                    &settings,
                    Some(path.clone()),
                )));
                match watch_bridge_config(manager.clone(), path) {
                    Ok(watcher) => bridge_watcher = Some(watcher),
                    Err(e) => warn!(error = %e, "Bridge configuration will not be hot-reloaded"),
                }
                Some(manager)
            }
            None => {
                info!("No bridge configuration found");
                None
            }
        }
    } else {
        info!("Bridges disabled");
        None
    };

    // Content
    let mut content_watchers: Vec<ContentWatcher> = Vec::new();
    let prompts = match &settings.prompts_dir {
        Some(dir) => {
            let store = Arc::new(PromptStore::new(dir.clone()));
            watch_into(store.clone(), &mut content_watchers).await;
            Some(store)
        }
        None => None,
    };
    let resources = match &settings.resources_dir {
        Some(dir) => {
            let store = Arc::new(ResourceStore::new(dir.clone()));
            watch_into(store.clone(), &mut content_watchers).await;
            Some(store)
        }
        None => None,
    };

    let bridge_source = manager.clone().map(|m| m as Arc<dyn BridgeSource>);
    let mut server = McpServer::new(McpServerConfig::from_settings(&settings), Vec::new(), bridge_source);
    if let Some(prompts) = prompts {
        server = server.with_prompts(prompts);
    }
    if let Some(resources) = resources {
        server = server.with_resources(resources);
    }
    let server = Arc::new(server);
    server.start_notifications(manager.as_ref().map(|m| m.subscribe()));

    if let Some(manager) = &manager {
        let started = manager.ensure_bridges().await;
        info!(count = started.len(), "Bridges started");
    }

    let run_stdio = settings.stdio
        || (settings.http_addr.is_none() && settings.ws_addr.is_none() && settings.sse_addr.is_none());

    let result = run_transports(
        server,
        run_stdio,
        settings.http_addr.clone(),
        settings.ws_addr.clone(),
        settings.sse_addr.clone(),
    )
    .await;

    drop(bridge_watcher);
    drop(content_watchers);
    if let Some(manager) = manager {
        manager.stop_all().await;
    }
    result
}

async fn watch_into<C>(store: Arc<C>, watchers: &mut Vec<ContentWatcher>)
where
    C: ContentHandler + 'static,
{
    let root = store.root().to_path_buf();
    match watch_content(store).await {
        Ok(watcher) => watchers.push(watcher),
        Err(e) => warn!(dir = %root.display(), error = %e, "Content directory not loaded"),
    }
}

async fn run_transports<H>(
    server: Arc<H>,
    run_stdio: bool,
    http_addr: Option<String>,
    ws_addr: Option<String>,
    sse_addr: Option<String>,
) -> Result<()>
where
    H: McpHandler + 'static,
{
    let mut handles = Vec::new();

    if let Some(addr) = http_addr {
        let server = server.clone();
        handles.push(tokio::spawn(async move { HttpTransport::new(addr).serve(server).await }));
    }

    if let Some(addr) = ws_addr {
        let server = server.clone();
        handles.push(tokio::spawn(async move { WebSocketTransport::new(addr).serve(server).await }));
    }

    if let Some(addr) = sse_addr {
        let server = server.clone();
        handles.push(tokio::spawn(async move { SseTransport::new(addr).serve(server).await }));
    }

    // Stdio runs in the main task; the process ends with stdin
    if run_stdio {
        StdioTransport::new().serve(server).await?;
        for handle in &handles {
            handle.abort();
        }
    } else {
        for handle in handles {
            handle.await??;
        }
    }

    Ok(())
}
