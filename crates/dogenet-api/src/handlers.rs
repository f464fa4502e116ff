//! Admin API handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use dogenet_proto::{Address, DOGENET_DEFAULT_PORT};
use dogenet_store::{NodeInfo, Store};

use crate::{ApiError, ApiResult, AppState};

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub core_nodes: usize,
    pub core_nodes_new: usize,
    pub net_nodes: usize,
    pub connected_peers: usize,
}

/// `GET /stats`
pub async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let core = state.store.core_stats()?;
    let net = state.store.net_stats()?;
    Ok(Json(StatsResponse {
        core_nodes: core.total,
        core_nodes_new: core.new,
        net_nodes: net,
        connected_peers: state.net.count_peers(),
    }))
}

#[derive(Debug, Serialize)]
pub struct CoreNodeResponse {
    pub address: String,
    pub time: i64,
    pub services: u64,
}

#[derive(Debug, Serialize)]
pub struct NetNodeResponse {
    pub pubkey: String,
    pub address: String,
    pub time: i64,
    pub channels: Vec<String>,
    pub identity: String,
}

#[derive(Debug, Serialize)]
pub struct NodesResponse {
    pub core: Vec<CoreNodeResponse>,
    pub net: Vec<NetNodeResponse>,
}

/// `GET /nodes`
pub async fn get_nodes(State(state): State<AppState>) -> ApiResult<Json<NodesResponse>> {
    let list = state.store.node_list()?;
    Ok(Json(NodesResponse {
        core: list
            .core
            .into_iter()
            .map(|n| CoreNodeResponse {
                address: n.address,
                time: n.time,
                services: n.services,
            })
            .collect(),
        net: list
            .net
            .into_iter()
            .map(|n| NetNodeResponse {
                pubkey: n.pubkey,
                address: n.address,
                time: n.time,
                channels: n.channels,
                identity: n.identity,
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AddPeerRequest {
    /// 32-byte hex node key.
    pub pubkey: String,
    /// `ip:port`, or a bare IP on the default gossip port.
    pub address: String,
}

/// `POST /peers`
pub async fn add_peer(
    State(state): State<AppState>,
    Json(req): Json<AddPeerRequest>,
) -> ApiResult<StatusCode> {
    let raw = hex::decode(&req.pubkey)
        .map_err(|_| ApiError::BadRequest("pubkey must be hex".into()))?;
    let pubkey: [u8; 32] = raw
        .try_into()
        .map_err(|_| ApiError::BadRequest("pubkey must be 32 bytes".into()))?;
    let address = Address::parse(&req.address, DOGENET_DEFAULT_PORT)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state.net.add_peer(NodeInfo { pubkey, address });
    Ok(StatusCode::ACCEPTED)
}
