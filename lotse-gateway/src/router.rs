use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{any, delete, get, post},
    Router,
};

use crate::routes::{execute, proxy, task};
use crate::state::{AppState, ProxyCacheKind};

/// Builds the full route table and wraps it in the relative-404 repair
/// middleware (spec.md §4.6's "Relative-404 repair").
pub fn build(state: AppState) -> Router {
    let router = Router::new()
        .route("/execute/", post(execute::execute))
        .route("/execute/empty-instance", post(execute::execute_empty_instance))
        .route("/execute/:package/default/:stage", get(execute::execute_default_stage))
        .route("/execute/:package/:version/:stage", get(execute::execute_versioned))
        .route("/task/status/:id", get(task::status))
        .route("/task/:id/cancel", post(task::cancel))
        .route("/task/:id", delete(task::delete))
        .route("/task/:id/logs", get(task::logs))
        .route("/task/:id/install-ssh", post(task::install_ssh))
        .route("/task/:id/run-vscode-server", post(task::run_vscode_server))
        .route("/tasks/:stage", get(task::list_by_stage))
        .route("/proxy/:task_id/*tail", any(proxy::reverse_proxy))
        .route("/vscode/:task_id/*tail", any(proxy::vscode_proxy))
        .with_state(state.clone());

    router.layer(middleware::from_fn_with_state(state, relative_404_repair))
}

/// Any response with status 404 and a `referer` naming `/proxy/<id>/` or
/// `/vscode/<id>/` is re-tried against that task's backend using the
/// original request path as the tail, so a page served from a proxied
/// task can load its browser-relative assets (`/static/app.js`) even
/// though those URLs never carry the task's prefix. Grounded on
/// `handle_proxy_404_middleware`/`proxy_404_forwarder` in `proxy.py`.
async fn relative_404_repair(State(state): State<AppState>, req: Request<Body>, next: Next<Body>) -> Response {
    let referer = req.headers().get("referer").and_then(|v| v.to_str().ok()).map(str::to_owned);
    let referer = match referer {
        Some(r) => r,
        None => return next.run(req).await,
    };

    let kind = if referer.contains("/proxy/") {
        ProxyCacheKind::Proxy
    } else if referer.contains("/vscode/") {
        ProxyCacheKind::Vscode
    } else {
        return next.run(req).await;
    };
    let segment = match kind {
        ProxyCacheKind::Proxy => "/proxy/",
        ProxyCacheKind::Vscode => "/vscode/",
    };

    // Already a proxy/vscode request: the route already resolved the task
    // id from the path itself, nothing to repair from the referer.
    if req.uri().path().starts_with(segment) {
        return next.run(req).await;
    }

    let method = req.method().clone();
    let headers = req.headers().clone();
    let path = req.uri().path().trim_start_matches('/').to_owned();
    let query = req.uri().query().map(str::to_owned);

    let response = next.run(req).await;
    if response.status() != StatusCode::NOT_FOUND {
        return response;
    }

    let task_id = match referer.split(segment).nth(1).and_then(|rest| rest.split('/').next()) {
        Some(id) if !id.is_empty() => id.to_owned(),
        _ => return response,
    };

    // The original request's body was already consumed servicing the
    // first (non-proxy) 404; relative-asset requests this middleware
    // exists for are always bodyless GETs, so an empty replay body is
    // the right behavior here, not a lossy approximation.
    let body = axum::body::Bytes::new();
    match kind {
        ProxyCacheKind::Proxy => proxy::reverse_proxy_tail(state, task_id, path, query, method, headers, body).await,
        ProxyCacheKind::Vscode => proxy::vscode_proxy_tail(state, task_id, path, query, method, headers, body).await,
    }
}
