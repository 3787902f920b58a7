use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::{Html, Response},
    routing::{get, get_service},
};
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tower_http::{services::ServeFile, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    config::RelayConfig,
    hub::{Hub, HubHandle},
    session,
};

const HOME_PAGE: &str = include_str!("../assets/home.html");

pub struct Relay {
    listener: TcpListener,
    config: Arc<RelayConfig>,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            config: Arc::new(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves HTTP and WebSocket traffic until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Relay { listener, config } = self;
        let (hub, hub_task) = Hub::spawn();

        axum::serve(listener, router(hub, config))
            .with_graceful_shutdown(shutdown)
            .await
            .context("relay server failed")?;

        // Upgraded sockets outlive the HTTP server; stop fanning out to them.
        info!("relay shutting down");
        hub_task.abort();
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[derive(Clone)]
struct AppState {
    hub: HubHandle,
    config: Arc<RelayConfig>,
}

/// `GET /` serves the landing page and `GET /ws` upgrades to a chat session.
pub fn router(hub: HubHandle, config: Arc<RelayConfig>) -> Router {
    let home = match &config.home {
        Some(path) => get_service(ServeFile::new(path)),
        None => get(serve_home),
    };

    Router::new()
        .route("/", home)
        .route("/ws", get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { hub, config })
}

async fn serve_home() -> Html<&'static str> {
    Html(HOME_PAGE)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(state.config.max_message_size)
        .on_failed_upgrade(|err: axum::Error| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| accept_session(state, socket))
}

async fn accept_session(state: AppState, socket: WebSocket) {
    let (sink, stream) = socket.split();
    if let Err(err) = session::start(state.hub, stream, sink, state.config).await {
        warn!(error = %err, "failed to start session");
    }
}
