use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use builder::{AppConfig, BuildStats, GraphBuilder, MetricsSnapshot};
use extract::OllamaClient;
use index::{EmbeddingClient, GraphStats, Neo4jStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    builder: Arc<GraphBuilder>,
    store: Arc<Neo4jStore>,
    llm_url: String,
    last_build: Arc<RwLock<Option<BuildStats>>>,
    build_lock: Arc<Mutex<()>>,
}

#[derive(Serialize)]
struct HealthResponse {
    neo4j: String,
    llm: String,
}

#[derive(Deserialize)]
struct BuildRequest {
    path: String,
}

#[derive(Serialize)]
struct StatsResponse {
    last_build: Option<BuildStats>,
    metrics: MetricsSnapshot,
    graph: Option<GraphStats>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!(
        neo4j = %config.neo4j.uri,
        llm = %config.llm.base_url,
        model = %config.llm.model,
        policy = %config.pipeline.pruning_policy,
        "Configuration loaded"
    );

    let store = Arc::new(
        Neo4jStore::connect(&config.neo4j.uri, &config.neo4j.user, &config.neo4j.password).await?,
    );
    store.init_schema().await.context("Failed to initialize Neo4j schema")?;

    let llm = Arc::new(OllamaClient::new(config.llm.base_url.clone(), config.llm.model.clone()));
    let embedder = Arc::new(EmbeddingClient::new(
        config.llm.base_url.clone(),
        config.llm.embedding_model.clone(),
    ));

    let builder = GraphBuilder::new(&config, llm.clone(), llm, embedder, store.clone());

    let state = AppState {
        builder: Arc::new(builder),
        store,
        llm_url: config.llm.base_url.clone(),
        last_build: Arc::new(RwLock::new(None)),
        build_lock: Arc::new(Mutex::new(())),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/build", post(run_build))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;

    info!(addr = %config.server.bind_addr, "Server listening");
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let neo4j = match state.store.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };

    let llm = match reqwest::get(format!("{}/api/tags", state.llm_url)).await {
        Ok(resp) if resp.status().is_success() => "ok".to_string(),
        Ok(resp) => format!("error: status {}", resp.status()),
        Err(e) => format!("error: {}", e),
    };

    Json(HealthResponse { neo4j, llm })
}

async fn run_build(
    State(state): State<AppState>,
    Json(req): Json<BuildRequest>,
) -> Result<Json<BuildStats>, (StatusCode, String)> {
    let path = PathBuf::from(&req.path);
    if !path.is_file() {
        return Err((StatusCode::NOT_FOUND, format!("dataset not found: {}", req.path)));
    }

    let Ok(_guard) = state.build_lock.try_lock() else {
        return Err((StatusCode::CONFLICT, "a build is already running".to_string()));
    };

    let stats = state.builder.build_from_path(&path).await.map_err(|e| {
        error!(path = %req.path, error = %e, "Build failed");
        (StatusCode::BAD_REQUEST, format!("{:#}", e))
    })?;

    *state.last_build.write().await = Some(stats.clone());
    Ok(Json(stats))
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let graph = match state.store.get_stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!(error = %e, "Could not read graph statistics");
            None
        }
    };

    Json(StatsResponse {
        last_build: state.last_build.read().await.clone(),
        metrics: state.builder.metrics().snapshot(),
        graph,
    })
}
