use axum::{
    body::StreamBody,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, RawQuery, State,
    },
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message as WsMessage};

use crate::error::ApiError;
use crate::state::{AppState, CachedEndpoint, ProxyCacheKind};
use lotse_common::Error;

/// Resolves `task_id` to the address it should be proxied to, consulting
/// the per-kind cache before falling back to the task repository. A miss
/// here almost always means the task never opened a UI/vscode port, not
/// that the cache is stale, since a task's port never changes once set.
async fn resolve_endpoint(state: &AppState, kind: ProxyCacheKind, task_id: &str) -> Option<CachedEndpoint> {
    if let Some(endpoint) = state.cache_for(kind).get(task_id) {
        return Some(endpoint.clone());
    }
    let task = state.repository.get_task(task_id).await.ok().flatten()?;
    let (ip, port) = match kind {
        ProxyCacheKind::Proxy => (task.ui_ip_address.clone()?, task.ui_port?),
        ProxyCacheKind::Vscode => (task.ip_address.clone(), task.vscode_port?),
    };
    let endpoint = CachedEndpoint { ip, port };
    state.cache_for(kind).insert(task_id.to_owned(), endpoint.clone());
    Some(endpoint)
}

fn prefix_for(kind: ProxyCacheKind, prefix_path: &str, task_id: &str) -> String {
    let segment = match kind {
        ProxyCacheKind::Proxy => "proxy",
        ProxyCacheKind::Vscode => "vscode",
    };
    format!("{}/{}/{}", prefix_path, segment, task_id)
}

/// A single route per side-channel handles both plain HTTP and the
/// WebSocket upgrade handshake, since the client always reaches either
/// one with the same method (`GET`) and axum dispatches by path+method,
/// not by the presence of an `Upgrade` header.
pub async fn reverse_proxy(
    State(state): State<AppState>,
    Path((task_id, rest)): Path<(String, String)>,
    ws: Option<WebSocketUpgrade>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: axum::body::Bytes,
) -> Response {
    dispatch(state, ProxyCacheKind::Proxy, task_id, rest, ws, method, headers, query, body).await
}

pub async fn vscode_proxy(
    State(state): State<AppState>,
    Path((task_id, rest)): Path<(String, String)>,
    ws: Option<WebSocketUpgrade>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: axum::body::Bytes,
) -> Response {
    dispatch(state, ProxyCacheKind::Vscode, task_id, rest, ws, method, headers, query, body).await
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: AppState,
    kind: ProxyCacheKind,
    task_id: String,
    rest: String,
    ws: Option<WebSocketUpgrade>,
    method: Method,
    headers: HeaderMap,
    query: Option<String>,
    body: axum::body::Bytes,
) -> Response {
    match ws {
        Some(ws) => handle_ws(state, kind, task_id, rest, headers, ws).await,
        None => handle_http(state, kind, task_id, rest, method, headers, query, body).await,
    }
}

/// Re-entry point for the relative-404 repair middleware: the original
/// request's router dispatch already 404'd, so this re-resolves the task
/// the referer named and forwards using the original path as the tail.
pub async fn reverse_proxy_tail(state: AppState, task_id: String, path: String, query: Option<String>, method: Method, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    handle_http(state, ProxyCacheKind::Proxy, task_id, path, method, headers, query, body).await
}

pub async fn vscode_proxy_tail(state: AppState, task_id: String, path: String, query: Option<String>, method: Method, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    handle_http(state, ProxyCacheKind::Vscode, task_id, path, method, headers, query, body).await
}

/// Forwards one HTTP request to the task's backend, passing an
/// `X-Forwarded-Prefix` so apps that render relative links (e.g. a
/// notebook server or code-server) know to prefix them. Deliberately does
/// *not* mutate the process's `no_proxy` environment variable per request
/// the way the original implementation did — see DESIGN.md — the
/// forwarding client is simply never routed through an upstream proxy.
async fn handle_http(
    state: AppState,
    kind: ProxyCacheKind,
    task_id: String,
    rest: String,
    method: Method,
    mut headers: HeaderMap,
    query: Option<String>,
    body: axum::body::Bytes,
) -> Response {
    let endpoint = match resolve_endpoint(&state, kind, &task_id).await {
        Some(endpoint) => endpoint,
        None => return ApiError(Error::TaskNotFound(task_id)).into_response(),
    };

    let mut url = format!("http://{}:{}/{}", endpoint.ip, endpoint.port, rest);
    if let Some(query) = query {
        url.push('?');
        url.push_str(&query);
    }

    headers.insert(
        HeaderName::from_static("x-forwarded-prefix"),
        HeaderValue::from_str(&prefix_for(kind, &state.openapi_prefix_path, &task_id)).unwrap_or(HeaderValue::from_static("")),
    );

    let upstream = state.http.request(method, &url).headers(headers).body(body).send().await;
    let upstream = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "proxy request failed");
            return ApiError(Error::UpstreamUnreachable(url)).into_response();
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        response_headers.insert(name, value.clone());
    }
    let stream = upstream.bytes_stream();
    let mut response = StreamBody::new(stream).into_response();
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

async fn handle_ws(state: AppState, kind: ProxyCacheKind, task_id: String, rest: String, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let endpoint = match resolve_endpoint(&state, kind, &task_id).await {
        Some(endpoint) => endpoint,
        None => return ApiError(Error::TaskNotFound(task_id)).into_response(),
    };
    let backend_url = format!("ws://{}:{}/{}", endpoint.ip, endpoint.port, rest);
    // Respect the first sub-protocol the client offered, matching the
    // original's websocket handshake passthrough.
    let protocol = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|p| p.trim().to_owned());

    let ws = match &protocol {
        Some(p) => ws.protocols([p.clone()]),
        None => ws,
    };
    ws.on_upgrade(move |socket| forward_websocket(socket, backend_url, protocol))
}

/// Bidirectionally forwards frames between the client and the task's
/// backend until either side closes or errors, mirroring `forward_ws`'s
/// two concurrent pump tasks raced with `FIRST_COMPLETED`.
async fn forward_websocket(client: WebSocket, backend_url: String, protocol: Option<String>) {
    let mut request = match backend_url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(url = %backend_url, error = %e, "invalid proxied websocket backend url");
            return;
        }
    };
    if let Some(protocol) = protocol {
        if let Ok(value) = HeaderValue::from_str(&protocol) {
            request.headers_mut().insert("sec-websocket-protocol", value);
        }
    }

    let (backend, _response) = match tokio_tungstenite::connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(url = %backend_url, error = %e, "failed to connect to proxied websocket backend");
            return;
        }
    };

    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let client_to_backend = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forwarded = match msg {
                Message::Text(text) => WsMessage::Text(text),
                Message::Binary(data) => WsMessage::Binary(data),
                Message::Ping(data) => WsMessage::Ping(data),
                Message::Pong(data) => WsMessage::Pong(data),
                Message::Close(_) => break,
            };
            if backend_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    let backend_to_client = async {
        while let Some(Ok(msg)) = backend_rx.next().await {
            let forwarded = match msg {
                WsMessage::Text(text) => Message::Text(text),
                WsMessage::Binary(data) => Message::Binary(data),
                WsMessage::Ping(data) => Message::Ping(data),
                WsMessage::Pong(data) => Message::Pong(data),
                WsMessage::Close(_) | WsMessage::Frame(_) => break,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_backend => {}
        _ = backend_to_client => {}
    }
}
