use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    anyhow::{Context, Result, bail},
    clap::{Parser, Subcommand},
    serde_json::Value,
    studio_bridge::{HandlerOptions, IntentHandler, TracingSink, pump},
    studio_client::{ClientOptions, GatewayClient},
    studio_common::{SharedScheduler, TokioScheduler},
    studio_config::{StudioConfig, config_dir, try_discover_and_load},
    studio_identity::FileStore,
    studio_relay::{ConfigFileSettings, RelayLimits, RelayState, start_relay},
    tracing_subscriber::EnvFilter,
};

const DEVICE_STORE_FILE: &str = "device.json";

/// Control-plane companion for an agent gateway.
///
/// Serves a same-origin relay for browser clients, watches the gateway's
/// event stream, or issues one-off RPC calls.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Explicit config file (otherwise `studio.{toml,yaml,yml,json}` is discovered).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket relay in front of the configured gateway.
    Serve {
        /// Address to bind (defaults to `relay.bind`).
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on (defaults to `relay.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Route browsers connect to (defaults to `relay.path`).
        #[arg(long)]
        path: Option<String>,
    },
    /// Connect and log every event through the bridge until interrupted.
    Watch {
        #[command(flatten)]
        target: Target,
    },
    /// Connect, make one RPC call and print the result.
    Call {
        /// Gateway method, e.g. `status` or `sessions.list`.
        method: String,

        /// JSON params.
        params: Option<String>,

        #[command(flatten)]
        target: Target,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Gateway WebSocket URL (overrides `gateway.url`).
    #[arg(long)]
    url: Option<String>,

    /// Gateway token (overrides `gateway.token`).
    #[arg(long, env = "STUDIO_GATEWAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Skip device signing and authenticate with the token alone.
    #[arg(long)]
    no_device: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = try_discover_and_load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Command::Serve { bind, port, path } => serve(cli.config, &config, bind, port, path).await,
        Command::Watch { target } => watch(&config, &target).await,
        Command::Call {
            method,
            params,
            target,
        } => call(&config, &target, &method, params.as_deref()).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

// ── serve ────────────────────────────────────────────────────────────────────

async fn serve(
    explicit: Option<PathBuf>,
    config: &StudioConfig,
    bind: Option<String>,
    port: Option<u16>,
    path: Option<String>,
) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.relay.bind.clone());
    let port = port.unwrap_or(config.relay.port);
    let path = path.unwrap_or_else(|| config.relay.path.clone());
    if !path.starts_with('/') {
        bail!("relay path must start with '/': {path}");
    }
    if config.gateway.url().is_none() {
        tracing::warn!("gateway.url is not set; callers will be rejected until it is");
    }

    // Settings are re-read per caller so config edits apply without a restart.
    let state = RelayState::with_limits(
        Arc::new(ConfigFileSettings::new(explicit)),
        RelayLimits::from_config(&config.relay),
    );
    start_relay(&bind, port, &path, state).await
}

// ── watch / call ─────────────────────────────────────────────────────────────

fn device_store() -> FileStore {
    let dir = config_dir().unwrap_or_else(|| PathBuf::from("."));
    FileStore::new(dir.join(DEVICE_STORE_FILE))
}

async fn open_client(
    config: &StudioConfig,
    target: &Target,
    scheduler: SharedScheduler,
) -> Result<GatewayClient> {
    let url = target
        .url
        .as_deref()
        .or_else(|| config.gateway.url())
        .context("no gateway url: pass --url or set gateway.url")?
        .to_string();

    let mut options = ClientOptions::from_config(config);
    if let Some(token) = target.token.as_deref().filter(|t| !t.trim().is_empty()) {
        options = options.with_token(token);
    }
    if target.no_device {
        options = options.without_device_identity();
    }

    let client = GatewayClient::new(options, Arc::new(device_store()), scheduler);
    let hello = client
        .connect(&url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    tracing::info!(%url, protocol = hello.protocol, "connected");
    Ok(client)
}

async fn watch(config: &StudioConfig, target: &Target) -> Result<()> {
    let scheduler = TokioScheduler::shared();
    let client = open_client(config, target, Arc::clone(&scheduler)).await?;

    let mut status = client.subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            tracing::info!(status = ?current, "connection status");
        }
    });

    let handler = IntentHandler::new(
        Arc::clone(&scheduler),
        Arc::new(TracingSink),
        HandlerOptions::from_config(&config.bridge),
    );
    let mut pumping = tokio::spawn(pump(client.subscribe_events(), handler, scheduler));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            tracing::info!("interrupted, disconnecting");
        },
        finished = &mut pumping => {
            let processed = finished.context("event pump panicked")?;
            tracing::info!(processed, "event stream ended");
            return Ok(());
        },
    }

    client.disconnect();
    drop(client);
    match tokio::time::timeout(Duration::from_secs(2), pumping).await {
        Ok(Ok(processed)) => tracing::info!(processed, "event pump stopped"),
        Ok(Err(e)) => tracing::warn!(error = %e, "event pump failed"),
        Err(_) => tracing::warn!("event pump did not stop in time"),
    }
    Ok(())
}

fn parse_params(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|raw| serde_json::from_str(raw).context("params must be valid JSON"))
        .transpose()
}

async fn call(
    config: &StudioConfig,
    target: &Target,
    method: &str,
    params: Option<&str>,
) -> Result<()> {
    let params = parse_params(params)?;
    let client = open_client(config, target, TokioScheduler::shared()).await?;
    let result = client.call(method, params).await;
    client.disconnect();

    let payload = result.with_context(|| format!("{method} failed"))?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
