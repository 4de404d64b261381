mod config;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, HeaderValue, Method, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use parlor_api::auth::{self, AppState, AppStateInner};
use parlor_api::error::ApiError;
use parlor_db::Database;
use parlor_gateway::{ConnectionHub, connection};
use parlor_types::error::Error;

use crate::config::Config;

#[derive(Clone)]
struct ServerState {
    app: AppState,
    allowed_origin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayParams {
    channel_id: Option<Uuid>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parlor=debug,tower_http=debug".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {:#}", e);
            std::process::exit(1);
        }
    };

    // Init database
    let db = Database::open(&config.db_path)?;

    // Shared state
    let hub = ConnectionHub::new();
    let app_state = AppStateInner::new(db, hub.clone(), config.jwt_secret.clone());

    let state = ServerState {
        app: app_state.clone(),
        allowed_origin: config.allowed_origin.clone(),
    };

    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    let app = parlor_api::router(app_state)
        .merge(ws_route)
        .layer(cors_layer(config.allowed_origin.as_deref())?)
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!("Parlor server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    Ok(())
}

fn cors_layer(allowed_origin: Option<&str>) -> anyhow::Result<CorsLayer> {
    let Some(origin) = allowed_origin else {
        return Ok(CorsLayer::permissive());
    };

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::exact(HeaderValue::from_str(origin)?))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]))
}

/// Authenticates from `Sec-WebSocket-Protocol: bearer, <jwt>` and, when a
/// channel is named, checks read access before upgrading.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(params): Query<GatewayParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if let Some(allowed) = &state.allowed_origin {
        let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
        if origin != Some(allowed.as_str()) {
            warn!("Rejected WebSocket upgrade from origin {:?}", origin);
            return Err(Error::forbidden("origin not allowed").into());
        }
    }

    let token = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(auth::token_from_protocols)
        .ok_or(Error::Unauthenticated)?;

    let user = auth::authenticate(&state.app, token).await?;

    if let Some(channel_id) = params.channel_id {
        state.app.messages.check_read(user.id, channel_id).await?;
    }

    let hub = state.app.hub.clone();
    let gate = state.app.messages.clone();
    Ok(ws
        .protocols(["bearer"])
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, hub, gate, user.id, params.channel_id)
        })
        .into_response())
}

async fn shutdown_signal(hub: ConnectionHub) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }

    // Releases every subscriber so open sockets close and serve() can finish.
    hub.shutdown().await;
}
