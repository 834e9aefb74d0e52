use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::get,
    },
    studio_config::RelayConfig,
    tokio::net::TcpListener,
    tower_http::cors::{Any, CorsLayer},
    tracing::{debug, info},
};

use crate::{SettingsSource, session};

// ── Shared state ─────────────────────────────────────────────────────────────

/// Per-session bounds on how long and how much the relay holds for a caller.
#[derive(Debug, Clone, Copy)]
pub struct RelayLimits {
    pub connect_timeout: Duration,
    /// A failed upstream is reported on the caller's next frame, or after this.
    pub failure_hold: Duration,
    pub max_backlog: usize,
}

impl RelayLimits {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.upstream_connect_timeout_ms),
            failure_hold: Duration::from_millis(config.failure_hold_ms),
            max_backlog: config.max_buffered_frames,
        }
    }
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

pub struct RelayState {
    pub(crate) settings: Arc<dyn SettingsSource>,
    pub(crate) limits: RelayLimits,
    active: AtomicUsize,
}

impl RelayState {
    pub fn new(settings: Arc<dyn SettingsSource>) -> Arc<Self> {
        Self::with_limits(settings, RelayLimits::default())
    }

    pub fn with_limits(settings: Arc<dyn SettingsSource>, limits: RelayLimits) -> Arc<Self> {
        Arc::new(Self {
            settings,
            limits,
            active: AtomicUsize::new(0),
        })
    }

    /// Callers currently attached.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard(Arc<RelayState>);

impl ActiveGuard {
    fn enter(state: &Arc<RelayState>) -> Self {
        state.active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(state))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the relay router (shared between production startup and tests).
pub fn build_relay_app(state: Arc<RelayState>, ws_path: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route(ws_path, get(ws_upgrade_handler))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the listener fails.
pub async fn start_relay(
    bind: &str,
    port: u16,
    ws_path: &str,
    state: Arc<RelayState>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((bind, port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, path = ws_path, "relay listening");
    axum::serve(
        listener,
        build_relay_app(state, ws_path).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": studio_protocol::PROTOCOL_VERSION,
        "sessions": state.active_sessions(),
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let conn_id = uuid::Uuid::new_v4().to_string();
        debug!(conn_id = %conn_id, remote = %addr, "caller attached");
        let _active = ActiveGuard::enter(&state);
        session::run(socket, Arc::clone(&state), conn_id).await;
    })
}
