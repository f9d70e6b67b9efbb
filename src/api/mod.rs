//! HTTP surface of the control plane (`/api/v1`).
//!
//! Validation failures surface as 4xx with a typed message; infrastructure
//! errors map to a generic 5xx after being logged here, at the recovery
//! point.

use std::collections::HashMap;
use std::io::Read;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use flate2::read::GzDecoder;
use icmpmon_assignment::AssignError;
use icmpmon_ingest::IngestError;
use icmpmon_model::store::NewTarget;
use icmpmon_model::{
    AgentStatus, AssignmentsResponse, ResultBatch, StoreError, Tier,
};
use icmpmon_registry::types::CommandResultBody;
use icmpmon_registry::{AgentRegistration, Heartbeat, RegistrationResponse, RegistryError};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::platform::context::AppContext;

/// Builds the full router: `/health` plus the authenticated `/api/v1` tree.
pub fn router(ctx: AppContext) -> Router {
    let api = Router::new()
        .route("/agents/register", post(register_agent))
        .route("/agents", get(list_agents))
        .route("/agents/:id", get(get_agent).delete(archive_agent))
        .route("/agents/:id/heartbeat", post(heartbeat))
        .route("/agents/:id/assignments", get(agent_assignments))
        .route("/agents/:id/commands", get(agent_commands))
        .route("/agents/:id/commands/:cmd/result", post(command_result))
        .route("/results", post(ingest_results))
        .route("/targets", post(create_target).get(list_targets))
        .route("/targets/:id", get(get_target).delete(archive_target))
        .route("/tiers", post(upsert_tier).get(list_tiers))
        .route("/tiers/:name", get(get_tier).delete(delete_tier))
        .route("/subnets", post(create_subnet))
        .route("/assignments", get(list_assignments))
        .route("/states", get(list_states))
        .route("/commands", post(create_command))
        .route("/commands/:id", get(get_command))
        .route("/rebalance", post(rebalance))
        .layer(middleware::from_fn_with_state(ctx.clone(), require_token))
        .with_state(ctx);

    Router::new().route("/health", get(health)).nest("/api/v1", api)
}

/// Bearer-token gate on the whole API tree, active when a token is
/// configured.
async fn require_token(
    State(ctx): State<AppContext>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &ctx.config().http.token {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid or missing token"})),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ---- agents ----

async fn register_agent(
    State(ctx): State<AppContext>,
    Json(reg): Json<AgentRegistration>,
) -> Result<impl IntoResponse, ApiError> {
    let agent_id = ctx.registry().register(&reg).await?;
    Ok(Json(RegistrationResponse { agent_id }))
}

async fn list_agents(State(ctx): State<AppContext>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ctx.registry().list_agents().await?))
}

async fn get_agent(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ctx.registry().get_agent(id).await?))
}

/// Operator archive; the agent's assignments fail over immediately.
async fn archive_agent(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.registry().archive_agent(id).await?;
    if let Err(err) = ctx.rebalancer().handle_agent_failure(id).await {
        error!(agent = %id, error = %err, "failover after archive failed");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn heartbeat(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Json(hb): Json<Heartbeat>,
) -> Result<impl IntoResponse, ApiError> {
    let (response, previous) = ctx.registry().heartbeat(id, &hb).await?;

    // A degraded or offline agent announcing itself again gets topped up.
    if previous == AgentStatus::Degraded || previous == AgentStatus::Offline {
        if let Err(err) = ctx.rebalancer().handle_agent_recovery(id).await {
            error!(agent = %id, error = %err, "recovery rebalance failed");
        }
    }

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    since: Option<i64>,
}

async fn agent_assignments(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Query(query): Query<SinceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let version = ctx.store().assignment_version().await?;

    // Delta short-circuit: a caller already at the authoritative version
    // gets an empty set back.
    if query.since == Some(version) {
        return Ok(Json(AssignmentsResponse {
            version,
            generated_at: Utc::now(),
            assignments: Vec::new(),
            tiers: HashMap::new(),
        }));
    }

    let assignments = ctx.rebalancer().assignments_view_for_agent(id).await?;
    let mut tiers: HashMap<String, Tier> = HashMap::new();
    for tier in ctx.store().list_tiers().await? {
        tiers.insert(tier.name.clone(), tier);
    }
    tiers.retain(|name, _| assignments.iter().any(|a| &a.tier == name));

    Ok(Json(AssignmentsResponse {
        version,
        generated_at: Utc::now(),
        assignments,
        tiers,
    }))
}

async fn agent_commands(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let commands = ctx.registry().commands().pending_for_agent(id).await?;
    Ok(Json(json!({ "commands": commands })))
}

async fn command_result(
    State(ctx): State<AppContext>,
    Path((id, cmd)): Path<(Uuid, Uuid)>,
    Json(body): Json<CommandResultBody>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.registry().commands().record_result(cmd, id, &body).await?;
    Ok(StatusCode::ACCEPTED)
}

// ---- ingest ----

async fn ingest_results(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let is_gzip = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("gzip"))
        .unwrap_or(false);

    let decoded = if is_gzip {
        let mut decoder = GzDecoder::new(body.as_ref());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|err| ApiError::BadRequest(format!("bad gzip body: {err}")))?;
        out
    } else {
        body.to_vec()
    };

    let batch: ResultBatch = serde_json::from_slice(&decoded)
        .map_err(|err| ApiError::BadRequest(format!("bad result batch: {err}")))?;

    let count = batch.results.len();
    ctx.buffer().push(&batch.results).await?;
    info!(
        agent = %batch.agent_id,
        batch = %batch.batch_id,
        results = count,
        "result batch buffered"
    );
    Ok(StatusCode::ACCEPTED)
}

// ---- targets ----

async fn create_target(
    State(ctx): State<AppContext>,
    Json(body): Json<NewTarget>,
) -> Result<impl IntoResponse, ApiError> {
    let target = ctx.store().create_target(&body).await?;
    if let Err(err) = ctx.rebalancer().assign_target(&target).await {
        // The target exists; assignment catches up on the next rebalance.
        warn!(target = %target.id, error = %err, "initial assignment failed");
    }
    Ok((StatusCode::CREATED, Json(target)))
}

async fn list_targets(State(ctx): State<AppContext>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ctx.store().list_targets(false).await?))
}

async fn get_target(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ctx.store().get_target(id).await?))
}

async fn archive_target(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.store().archive_target(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- tiers ----

async fn upsert_tier(
    State(ctx): State<AppContext>,
    Json(tier): Json<Tier>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.store().upsert_tier(&tier).await?;
    Ok((StatusCode::CREATED, Json(tier)))
}

async fn list_tiers(State(ctx): State<AppContext>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ctx.store().list_tiers().await?))
}

async fn get_tier(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ctx.store().get_tier(&name).await?))
}

async fn delete_tier(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.store().delete_tier(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- subnets ----

#[derive(Debug, Deserialize)]
struct SubnetCreate {
    cidr: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    market: String,
}

async fn create_subnet(
    State(ctx): State<AppContext>,
    Json(body): Json<SubnetCreate>,
) -> Result<impl IntoResponse, ApiError> {
    let id = ctx
        .store()
        .create_subnet(&body.cidr, &body.region, &body.market)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "subnet_id": id }))))
}

// ---- read-only listings ----

#[derive(Debug, Deserialize)]
struct AssignmentFilter {
    agent_id: Option<Uuid>,
    target_id: Option<Uuid>,
}

async fn list_assignments(
    State(ctx): State<AppContext>,
    Query(filter): Query<AssignmentFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let assignments = ctx
        .rebalancer()
        .list_assignments(filter.agent_id, filter.target_id)
        .await?;
    Ok(Json(assignments))
}

#[derive(Debug, Deserialize)]
struct StatesQuery {
    #[serde(default)]
    unhealthy: bool,
}

async fn list_states(
    State(ctx): State<AppContext>,
    Query(query): Query<StatesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ctx.store().list_pair_states(query.unhealthy).await?))
}

// ---- commands ----

#[derive(Debug, Deserialize)]
struct CommandCreate {
    command_type: String,
    target_ip: String,
    #[serde(default)]
    agent_ids: Vec<Uuid>,
    #[serde(default)]
    ttl_secs: Option<i64>,
}

async fn create_command(
    State(ctx): State<AppContext>,
    Json(body): Json<CommandCreate>,
) -> Result<impl IntoResponse, ApiError> {
    let command = ctx
        .registry()
        .commands()
        .create(&body.command_type, &body.target_ip, body.agent_ids, body.ttl_secs)
        .await?;
    Ok((StatusCode::CREATED, Json(command)))
}

async fn get_command(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let command = ctx.registry().commands().get(id).await?;
    let results = ctx.registry().commands().results(id).await?;
    Ok(Json(json!({ "command": command, "results": results })))
}

// ---- operations ----

async fn rebalance(State(ctx): State<AppContext>) -> Result<impl IntoResponse, ApiError> {
    let produced = ctx.rebalancer().materialize_all().await?;
    Ok(Json(json!({ "assignments": produced })))
}

// ---- error mapping ----

/// HTTP-facing error: validation reaches the caller, infrastructure does
/// not.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Internal(message) => {
                error!(error = message.as_str(), "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal error" })),
                )
                    .into_response()
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(message) => ApiError::NotFound(message),
            StoreError::Validation(message) => ApiError::BadRequest(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Store(inner) => inner.into(),
            RegistryError::Validation(message) => ApiError::BadRequest(message),
            RegistryError::AgentNotFound(id) => ApiError::NotFound(format!("agent {id}")),
            RegistryError::CommandNotFound(id) => ApiError::NotFound(format!("command {id}")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AssignError> for ApiError {
    fn from(err: AssignError) -> Self {
        match err {
            AssignError::Store(inner) => inner.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        ApiError::Internal(err.to_string())
    }
}
