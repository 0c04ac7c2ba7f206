use crate::error::{CoreError, CoreResult};
use crate::node::NodeCommand;
use crate::types::{AgentIdentifier, Peer, TrustDataExport, TrustExperience, TrustQuery, TrustResponse, TrustScore};
use crate::valuation;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::sync::{mpsc, mpsc::error::TrySendError, oneshot};
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

const MAX_QUERY_DEPTH: u8 = 10;

#[derive(Clone)]
pub struct ApiState {
    pub command_tx: mpsc::Sender<NodeCommand>,
}

/// Build and dispatch a `NodeCommand`, mapping queue backpressure and a
/// dropped response channel onto `CoreError` (spec §4.5/§7).
///
/// `try_send` is used rather than `send().await`: a full queue fails the
/// call immediately with `Overloaded` instead of making the HTTP caller
/// wait behind it (spec §5).
async fn execute_command<T, F>(state: &ApiState, command_builder: F) -> CoreResult<T>
where
    F: FnOnce(oneshot::Sender<CoreResult<T>>) -> NodeCommand,
{
    let (tx, rx) = oneshot::channel();
    match state.command_tx.try_send(command_builder(tx)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => return Err(CoreError::Overloaded),
        Err(TrySendError::Closed(_)) => {
            return Err(CoreError::Internal(anyhow::anyhow!("runtime command loop is gone")))
        }
    }

    rx.await
        .map_err(|_| CoreError::Internal(anyhow::anyhow!("runtime dropped the response channel")))?
}

pub async fn run_api_server(port: u16, command_tx: mpsc::Sender<NodeCommand>) -> anyhow::Result<()> {
    let state = ApiState { command_tx };

    let app = Router::new()
        .route("/health", get(health))
        .route("/experiences", post(add_experience))
        .route("/experiences/:id_domain/:agent_id", get(get_experiences))
        .route("/experiences/:id", axum::routing::delete(delete_experience))
        .route("/trust/:id_domain/:agent_id", get(query_trust))
        .route("/trust/batch", post(query_trust_batch))
        .route("/peers", get(get_peers).post(add_peer))
        .route("/peers/self", get(get_self_peer_id))
        .route("/peers/:peer_id/quality", post(update_peer_quality))
        .route("/peers/:peer_id", axum::routing::delete(delete_peer))
        .route("/export", get(export_trust_data))
        .route("/import", post(import_trust_data))
        .with_state(state)
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Deserialize)]
pub struct AddExperienceRequest {
    pub id_domain: String,
    pub agent_id: String,
    pub investment: f64,
    pub return_value: f64,
    pub timeframe_days: f64,
    pub discount_rate: Option<f64>,
    pub notes: Option<String>,
    pub data: Option<serde_json::Value>,
}

async fn add_experience(
    State(state): State<ApiState>,
    Json(req): Json<AddExperienceRequest>,
) -> Result<Response, CoreError> {
    let discount_rate = req.discount_rate.unwrap_or(valuation::DEFAULT_DISCOUNT_RATE);
    let pv_roi = valuation::pv_roi(req.investment, req.return_value, req.timeframe_days, discount_rate)?;

    let experience = TrustExperience {
        id: Uuid::new_v4(),
        id_domain: req.id_domain,
        agent_id: req.agent_id,
        pv_roi,
        invested_volume: req.investment,
        timestamp: Utc::now(),
        notes: req.notes,
        data: req.data,
    };

    execute_command(&state, |response| NodeCommand::AddExperience {
        experience: experience.clone(),
        response,
    })
    .await?;

    Ok((StatusCode::CREATED, Json(experience)).into_response())
}

async fn get_experiences(
    State(state): State<ApiState>,
    Path((id_domain, agent_id)): Path<(String, String)>,
) -> Result<Json<Vec<TrustExperience>>, CoreError> {
    let key = AgentIdentifier::new(id_domain, agent_id);
    let experiences = execute_command(&state, |response| NodeCommand::GetExperiences { key, response }).await?;
    Ok(Json(experiences))
}

async fn delete_experience(
    State(state): State<ApiState>,
    Path(experience_id): Path<String>,
) -> Result<StatusCode, CoreError> {
    execute_command(&state, |response| NodeCommand::RemoveExperience {
        experience_id,
        response,
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct TrustQueryParams {
    pub max_depth: Option<u8>,
    pub forget_rate: Option<f64>,
}

async fn query_trust(
    State(state): State<ApiState>,
    Path((id_domain, agent_id)): Path<(String, String)>,
    Query(params): Query<TrustQueryParams>,
) -> Result<Json<TrustScore>, CoreError> {
    let max_depth = validate_max_depth(params.max_depth.unwrap_or(3))?;

    let query = TrustQuery {
        agents: vec![AgentIdentifier::new(id_domain.clone(), agent_id.clone())],
        max_depth,
        point_in_time: Some(Utc::now()),
        forget_rate: Some(params.forget_rate.unwrap_or(0.0)),
    };

    let response = execute_command(&state, |response| NodeCommand::QueryTrust { query, response }).await?;

    let trust_score = response
        .scores
        .into_iter()
        .find(|agent_score| agent_score.id_domain == id_domain && agent_score.agent_id == agent_id)
        .map(|agent_score| agent_score.score)
        .unwrap_or_default();

    Ok(Json(trust_score))
}

async fn query_trust_batch(
    State(state): State<ApiState>,
    Json(query): Json<TrustQuery>,
) -> Result<Json<TrustResponse>, CoreError> {
    validate_max_depth(query.max_depth)?;
    let response = execute_command(&state, |response| NodeCommand::QueryTrust { query, response }).await?;
    Ok(Json(response))
}

fn validate_max_depth(max_depth: u8) -> CoreResult<u8> {
    if max_depth > MAX_QUERY_DEPTH {
        return Err(CoreError::invalid(format!("max_depth must be <= {MAX_QUERY_DEPTH}")));
    }
    Ok(max_depth)
}

async fn get_peers(State(state): State<ApiState>) -> Result<Json<Vec<Peer>>, CoreError> {
    let peers = execute_command(&state, |response| NodeCommand::GetPeers { response }).await?;
    Ok(Json(peers))
}

#[derive(Deserialize)]
pub struct AddPeerRequest {
    pub peer_id: String,
    pub name: String,
    pub recommender_quality: Option<f64>,
}

async fn add_peer(
    State(state): State<ApiState>,
    Json(req): Json<AddPeerRequest>,
) -> Result<Response, CoreError> {
    let peer = Peer {
        peer_id: req.peer_id,
        name: req.name,
        recommender_quality: req.recommender_quality.unwrap_or(0.5),
        added_at: Utc::now(),
    };

    execute_command(&state, |response| NodeCommand::AddPeer {
        peer: peer.clone(),
        response,
    })
    .await?;

    Ok((StatusCode::CREATED, Json(peer)).into_response())
}

async fn get_self_peer_id(State(state): State<ApiState>) -> Result<Json<String>, CoreError> {
    let peer_id = execute_command(&state, |response| NodeCommand::GetSelfPeerId { response }).await?;
    Ok(Json(peer_id))
}

#[derive(Deserialize)]
pub struct UpdateQualityRequest {
    pub quality: f64,
}

async fn update_peer_quality(
    State(state): State<ApiState>,
    Path(peer_id): Path<String>,
    Json(req): Json<UpdateQualityRequest>,
) -> Result<StatusCode, CoreError> {
    execute_command(&state, |response| NodeCommand::UpdatePeerQuality {
        peer_id,
        quality: req.quality,
        response,
    })
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn delete_peer(
    State(state): State<ApiState>,
    Path(peer_id): Path<String>,
) -> Result<StatusCode, CoreError> {
    execute_command(&state, |response| NodeCommand::RemovePeer { peer_id, response }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn export_trust_data(State(state): State<ApiState>) -> Result<Json<TrustDataExport>, CoreError> {
    let export_data = execute_command(&state, |response| NodeCommand::ExportData { response }).await?;
    Ok(Json(export_data))
}

#[derive(Deserialize)]
pub struct ImportRequest {
    pub data: TrustDataExport,
    pub overwrite: Option<bool>,
}

async fn import_trust_data(
    State(state): State<ApiState>,
    Json(req): Json<ImportRequest>,
) -> Result<StatusCode, CoreError> {
    execute_command(&state, |response| NodeCommand::ImportData {
        data: req.data,
        overwrite: req.overwrite.unwrap_or(false),
        response,
    })
    .await?;

    Ok(StatusCode::NO_CONTENT)
}
