mod broker;
mod config;
mod error;
mod router;
mod routes;
mod state;

use std::collections::HashMap;
use std::sync::Arc;

use kube::Client;
use lotse_engine::{
    default_preparers, Config as EngineConfig, ExecutionEngine, OrchestratorClient, PgPackageLookup, PgTaskRepository, PortForwardRegistry,
    TaskQueue,
};

use crate::broker::StubBrokerIngress;
use crate::config::GatewayConfig;
use crate::state::AppState;

/// Thin entry point: parses configuration, wires up the engine's
/// collaborators, reconciles against whatever pods already exist, then
/// serves the HTTP surface. Mirrors the teacher's own `main.rs`, which is
/// just a `#[tokio::main]` calling a single `*_main` function; the bulk of
/// the wiring here belongs to the gateway rather than a reconciler, so it
/// is written out in full instead of delegated to a library call.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let engine_config = EngineConfig::from_env().expect("failed to read execution engine configuration from the environment");
    let gateway_config = GatewayConfig::from_env();

    let kube_client: Client = Client::try_default().await.expect("expected a valid KUBECONFIG/in-cluster configuration");
    let orchestrator = Arc::new(OrchestratorClient::new(kube_client));

    let pg_repository = PgTaskRepository::connect(&engine_config.database_url).await.expect("failed to connect to the task repository database");
    // Share one pool between the task repository and package lookup
    // instead of opening a second connection pool to the same database.
    let packages: Arc<dyn lotse_engine::PackageLookup> = Arc::new(PgPackageLookup::new(pg_repository.pool().clone()));
    let repository: Arc<dyn lotse_engine::TaskRepository> = Arc::new(pg_repository);

    let port_forwards = Arc::new(PortForwardRegistry::new());
    let queue = Arc::new(TaskQueue::new(engine_config.queue_concurrency));
    let preparers: HashMap<&'static str, Arc<dyn lotse_engine::RuntimePreparer>> = default_preparers(orchestrator.clone());
    let hostname = hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_else(|| "localhost".to_owned());

    let engine = Arc::new(ExecutionEngine::new(orchestrator, repository.clone(), port_forwards, queue, engine_config, hostname.clone(), preparers));

    tracing::info!(hostname = %hostname, "reconciling task/pod state from the previous process");
    if let Err(e) = engine.reconcile_on_startup().await {
        tracing::error!(error = %e, "startup reconciliation failed; continuing with whatever state survived");
    }

    let state = AppState {
        engine: engine.clone(),
        repository,
        packages,
        http: reqwest::Client::builder().no_proxy().build().expect("failed to build the proxying http client"),
        proxy_cache: Arc::new(dashmap::DashMap::new()),
        vscode_cache: Arc::new(dashmap::DashMap::new()),
        openapi_prefix_path: engine.config.openapi_prefix_path.clone(),
        hostname,
        control_port: gateway_config.control_port,
    };

    if gateway_config.broker.active {
        let ingress = Arc::new(StubBrokerIngress::new(gateway_config.broker.clone()));
        tokio::spawn(broker::run_broker_listener(state.clone(), ingress));
    }

    let app = router::build(state).layer(tower_http::trace::TraceLayer::new_for_http()).layer(tower_http::cors::CorsLayer::permissive());

    tracing::info!(addr = %gateway_config.bind_addr, "lotse-gateway listening");
    axum::Server::bind(&gateway_config.bind_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("gateway server exited with an error");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    tracing::info!("shutdown signal received");
}
