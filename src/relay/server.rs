use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::Json;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::auth;
use crate::error::{AppError, ExitCode};
use crate::logring::Direction;
use crate::plugins::PluginStore;

use super::broker::{Broker, FrameOutcome};
use super::client::{self, CLOSE_NORMAL, CLOSE_POLICY};
use super::extension::run_link;

/// Origin schemes accepted on the extension endpoint.
const EXTENSION_ORIGIN_SCHEMES: [&str; 3] =
    ["chrome-extension", "moz-extension", "safari-web-extension"];

/// Upper bound on a single `/logs/cdp` page.
const MAX_LOG_PAGE: usize = 1000;
const DEFAULT_LOG_PAGE: usize = 100;

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
    label: Option<String>,
}

#[derive(Deserialize)]
struct LogParams {
    after: Option<u64>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct InstallBody {
    name: String,
    #[serde(default)]
    manifest: Value,
}

/// Build the router serving both WebSocket endpoints and the admin surface
/// on one loopback port.
pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/", get(root_status))
        .route("/logs/status", get(logs_status))
        .route("/logs/cdp", get(logs_cdp))
        .route("/extension/reload", post(extension_reload))
        .route("/agent-preferences", get(agent_preferences))
        .route("/restrictions", get(restrictions))
        .route("/plugins", get(plugins_list))
        .route("/plugins/install", post(plugins_install))
        .route("/plugins/{name}", delete(plugins_remove))
        .route("/cdp", get(cdp_upgrade))
        .route("/extension", get(extension_upgrade))
        .with_state(broker)
}

/// Bind the broker's loopback listener and publish the CDP URL file.
///
/// The URL file is only written once the bind succeeded, so a failed start
/// leaves no partial state on disk.
///
/// # Errors
///
/// Returns `AppError` with `ExitCode::BindError` if the port is held, or a
/// general error if the URL file cannot be written.
pub async fn bind(broker: &Arc<Broker>) -> Result<(TcpListener, String), AppError> {
    let addr = format!("{}:{}", broker.config.host, broker.config.port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| AppError {
        message: format!("failed to bind {addr}: {e}"),
        code: ExitCode::BindError,
    })?;

    let url = std::env::var("BF_CDP_URL").unwrap_or_else(|_| {
        auth::cdp_url(&broker.config.host, broker.config.port, &broker.token)
    });
    auth::publish_cdp_url(&broker.config.config_dir, &url).map_err(|e| AppError {
        message: e.to_string(),
        code: ExitCode::GeneralError,
    })?;

    info!(%addr, "relay listening");
    Ok((listener, url))
}

/// Serve until a shutdown signal arrives, then tear everything down and
/// remove the published CDP URL.
///
/// # Errors
///
/// Returns `AppError` if the accept loop fails.
pub async fn run(broker: Arc<Broker>, listener: TcpListener) -> Result<(), AppError> {
    let app = router(Arc::clone(&broker));

    let shutdown = {
        let broker = Arc::clone(&broker);
        async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            // Closing every socket lets the graceful drain complete; the
            // long-lived WebSocket connections would otherwise pin it.
            broker.shutdown().await;
        }
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    let _ = auth::remove_cdp_url(&broker.config.config_dir);

    served.map_err(|e| AppError {
        message: format!("server error: {e}"),
        code: ExitCode::GeneralError,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

// ---------------------------------------------------------------------------
// Admin HTTP
// ---------------------------------------------------------------------------

async fn root_status(State(broker): State<Arc<Broker>>) -> Json<Value> {
    Json(broker.status())
}

async fn logs_status(State(broker): State<Arc<Broker>>) -> Json<Value> {
    Json(broker.logs_status())
}

async fn logs_cdp(
    State(broker): State<Arc<Broker>>,
    Query(params): Query<LogParams>,
) -> Json<Value> {
    let after = params.after.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_LOG_PAGE).min(MAX_LOG_PAGE);
    let query = broker.log.since(after, limit);
    Json(serde_json::to_value(&query).unwrap_or_else(|_| json!({})))
}

/// Check `Authorization: Bearer <token>` on a write endpoint.
fn bearer_authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == token)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

async fn extension_reload(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
) -> Response {
    if !bearer_authorized(&headers, &broker.token) {
        return unauthorized();
    }
    let reloaded = match broker.extension_call("extensionReload", None).await {
        Ok(result) => result["reloaded"].as_bool().unwrap_or(true),
        Err(e) => {
            warn!(error = %e, "extension reload failed");
            false
        }
    };
    Json(json!({ "reloaded": reloaded })).into_response()
}

/// Serve a static JSON file from the config dir, or `{}` when absent.
fn config_json(broker: &Broker, file: &str) -> Value {
    std::fs::read_to_string(broker.config.config_dir.join(file))
        .ok()
        .and_then(|contents| serde_json::from_str(&contents).ok())
        .unwrap_or_else(|| json!({}))
}

async fn agent_preferences(State(broker): State<Arc<Broker>>) -> Json<Value> {
    Json(config_json(&broker, "agent-preferences.json"))
}

async fn restrictions(State(broker): State<Arc<Broker>>) -> Json<Value> {
    Json(config_json(&broker, "restrictions.json"))
}

async fn plugins_list(State(broker): State<Arc<Broker>>, headers: HeaderMap) -> Response {
    if !bearer_authorized(&headers, &broker.token) {
        return unauthorized();
    }
    let store = PluginStore::new(&broker.config.config_dir);
    match store.list() {
        Ok(plugins) => Json(json!({ "plugins": plugins })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn plugins_install(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
    Json(body): Json<InstallBody>,
) -> Response {
    if !bearer_authorized(&headers, &broker.token) {
        return unauthorized();
    }
    let store = PluginStore::new(&broker.config.config_dir);
    match store.install(&body.name, &body.manifest) {
        Ok(()) => Json(json!({ "installed": body.name })).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn plugins_remove(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if !bearer_authorized(&headers, &broker.token) {
        return unauthorized();
    }
    let store = PluginStore::new(&broker.config.config_dir);
    match store.remove(&name) {
        Ok(()) => Json(json!({ "removed": name })).into_response(),
        Err(e) if e.is_not_found() => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// WebSocket endpoints
// ---------------------------------------------------------------------------

async fn cdp_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(broker): State<Arc<Broker>>,
) -> Response {
    if query.token.as_deref() != Some(broker.token.as_str()) {
        warn!("cdp client rejected: bad token");
        return unauthorized();
    }
    ws.on_upgrade(move |socket| client_connection(broker, socket, query.label))
}

async fn extension_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(broker): State<Arc<Broker>>,
) -> Response {
    if query.token.as_deref() != Some(broker.token.as_str()) {
        warn!("extension rejected: bad token");
        return unauthorized();
    }
    let origin_ok = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .and_then(|origin| url::Url::parse(origin).ok())
        .is_some_and(|origin| EXTENSION_ORIGIN_SCHEMES.contains(&origin.scheme()));
    if !origin_ok {
        warn!("extension rejected: disallowed origin");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "origin not allowed" })),
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| extension_connection(broker, socket))
}

/// One CDP client connection: reader loop here, writer task alongside.
async fn client_connection(broker: Arc<Broker>, socket: WebSocket, label: Option<String>) {
    let (client_id, receiver, shared) = broker.register_client(label);
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(client::run_writer(sink, receiver, shared));
    let mut faults: u32 = 0;

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match broker.handle_client_frame(client_id, text.as_str()).await {
                            FrameOutcome::Handled => faults = 0,
                            FrameOutcome::DecodeFault => faults += 1,
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        // Binary frames are unsupported on the CDP endpoint.
                        faults += 1;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
                if faults > broker.config.decode_fault_limit {
                    broker.drop_client(client_id, CLOSE_POLICY, "repeated malformed frames");
                    break;
                }
            }
            // The writer exits when the broker drops this client.
            _ = &mut writer => break,
        }
    }

    if broker.client_connected(client_id) {
        broker.drop_client(client_id, CLOSE_NORMAL, "disconnected");
    }
}

/// One extension connection: claims the slot (superseding any previous
/// link) and runs the link task until the socket closes.
async fn extension_connection(broker: Arc<Broker>, socket: WebSocket) {
    let (command_tx, command_rx) = mpsc::channel(broker.config.link_channel_capacity);
    let (generation, superseded) = broker.extension.begin(command_tx);
    broker.log.append(
        Direction::ExtensionLifecycle,
        None,
        None,
        json!({ "event": "connected" }),
    );
    if let Some(old) = superseded {
        broker.log.append(
            Direction::ExtensionLifecycle,
            None,
            None,
            json!({ "event": "superseded" }),
        );
        old.close("superseded").await;
    }
    run_link(broker, generation, socket, command_rx).await;
}
