//! ---
//! lmp_section: "05-networking-external-interfaces"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Operator API for the chaos engine."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---

use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lmp_chaos::{
    ChaosEngine, ChaosError, ClusterHealthSnapshot, IncidentFilter, InjectionId, InjectionRecord,
    Scenario,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared API state exposed to handlers.
pub struct ApiState {
    engine: Arc<ChaosEngine>,
    title: String,
    version: String,
    start: Instant,
}

impl ApiState {
    pub fn new(engine: Arc<ChaosEngine>, title: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            engine,
            title: title.into(),
            version: version.into(),
            start: Instant::now(),
        }
    }

    pub fn engine(&self) -> &Arc<ChaosEngine> {
        &self.engine
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("title", &self.title)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    /// Bound address; resolved when port 0 was requested.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Routes without transport layers.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/api/health", get(get_health))
        .route("/api/scenarios", get(get_scenarios))
        .route("/api/scenarios/:id/trigger", post(post_trigger))
        .route("/api/incidents", get(get_incidents))
        .route("/api/incidents/:id", get(get_incident))
        .route("/api/incidents/:id/abort", post(post_abort))
        .with_state(state)
}

/// Spawn the operator API with CORS restricted to `cors_allow_origins`.
pub fn spawn_api_server(
    state: Arc<ApiState>,
    addr: SocketAddr,
    cors_allow_origins: &[String],
) -> Result<ApiServer> {
    let router = router(state)
        .layer(cors_layer(cors_allow_origins)?)
        .layer(TraceLayer::new_for_http());

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let bound = listener
        .local_addr()
        .context("failed to read API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %bound, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %bound, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    if origins.iter().any(|origin| origin == "*") {
        return Ok(layer.allow_origin(Any));
    }
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("invalid CORS origin {origin}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

#[derive(Debug, Serialize)]
struct RootResponse {
    name: String,
    version: String,
    uptime_seconds: u64,
    endpoints: Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    cluster: ClusterHealthSnapshot,
    open_injections: usize,
}

#[derive(Debug, Serialize)]
struct ScenarioSummary {
    #[serde(flatten)]
    scenario: Scenario,
    busy: bool,
}

#[derive(Debug, Serialize)]
struct TriggerAccepted {
    incident_id: InjectionId,
    scenario_id: String,
    target: String,
}

#[derive(Debug, Serialize)]
struct AbortAccepted {
    incident_id: InjectionId,
    aborting: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ChaosError> for ApiError {
    fn from(err: ChaosError) -> Self {
        let status = match &err {
            err if err.is_not_found() => StatusCode::NOT_FOUND,
            err if err.is_conflict() => StatusCode::CONFLICT,
            ChaosError::InjectionFailed { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

fn parse_incident_id(raw: &str) -> Result<InjectionId, ApiError> {
    raw.parse()
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid incident id {raw}: {err}")))
}

async fn get_root(State(state): State<Arc<ApiState>>) -> Json<RootResponse> {
    Json(RootResponse {
        name: state.title.clone(),
        version: state.version.clone(),
        uptime_seconds: state.start.elapsed().as_secs(),
        endpoints: json!({
            "health": "/api/health",
            "scenarios": "/api/scenarios",
            "trigger": "/api/scenarios/{id}/trigger",
            "incidents": "/api/incidents",
            "incident": "/api/incidents/{id}",
            "abort": "/api/incidents/{id}/abort",
        }),
    })
}

async fn get_health(State(state): State<Arc<ApiState>>) -> Response {
    match state.engine.cluster_health().await {
        Ok(cluster) => Json(HealthResponse {
            status: "healthy",
            cluster,
            open_injections: state.engine.open_injections().len(),
        })
        .into_response(),
        Err(err) => {
            warn!(error = %err, "cluster health probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn get_scenarios(State(state): State<Arc<ApiState>>) -> Json<Vec<ScenarioSummary>> {
    let summaries = state
        .engine
        .scenarios()
        .into_iter()
        .map(|scenario| ScenarioSummary {
            busy: state.engine.is_target_busy(&scenario.target),
            scenario: scenario.as_ref().clone(),
        })
        .collect();
    Json(summaries)
}

async fn post_trigger(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<TriggerAccepted>), ApiError> {
    let scenario = state.engine.registry().lookup(&id)?;
    let incident_id = state.engine.trigger_now(&id).await?;
    info!(scenario = %id, incident = %incident_id, "scenario triggered by operator");
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerAccepted {
            incident_id,
            scenario_id: scenario.id.clone(),
            target: scenario.target.clone(),
        }),
    ))
}

async fn get_incidents(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<IncidentFilter>,
) -> Json<Vec<InjectionRecord>> {
    Json(state.engine.query(filter.paged()).collect())
}

async fn get_incident(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<InjectionRecord>, ApiError> {
    let id = parse_incident_id(&id)?;
    Ok(Json(state.engine.get(id)?))
}

async fn post_abort(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<AbortAccepted>), ApiError> {
    let id = parse_incident_id(&id)?;
    state.engine.abort(id)?;
    info!(incident = %id, "abort requested by operator");
    Ok((
        StatusCode::ACCEPTED,
        Json(AbortAccepted {
            incident_id: id,
            aborting: true,
        }),
    ))
}
