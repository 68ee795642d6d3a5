//! JSON API over the key service.
//!
//!   POST /v1/support-chain        Is a chain served by this node
//!   POST /v1/social-key/get       Fetch social keys, relaying to peers on a miss
//!   POST /v1/social-key/set       Store a social key
//!   GET  /v1/peers                Known and connected peers

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use keylocker_protocol::keylocker::{GetSocialKeyReq, SetSocialKeyReq, SupportChainReq};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    adaptor::AdaptorError,
    dispatcher::DispatchError,
    host::P2pClient,
    peer_store::SharedPeerStore,
    service::{KeyService, ServiceError},
};

struct ApiInner {
    service: Arc<KeyService>,
    peer_store: SharedPeerStore,
    /// Absent when the node runs without a p2p host.
    client: Option<P2pClient>,
    local_peer: String,
}

#[derive(Clone)]
pub struct ApiState(Arc<ApiInner>);

impl ApiState {
    pub fn new(
        service: Arc<KeyService>,
        peer_store: SharedPeerStore,
        client: Option<P2pClient>,
        local_peer: String,
    ) -> Self {
        Self(Arc::new(ApiInner { service, peer_store, client, local_peer }))
    }
}

#[derive(Serialize)]
struct PeersSnapshot {
    local: String,
    known: Vec<String>,
    connected: Vec<String>,
}

// ============================================================================
// Server
// ============================================================================

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/support-chain",  post(support_chain))
        .route("/v1/social-key/get", post(get_social_key))
        .route("/v1/social-key/set", post(set_social_key))
        .route("/v1/peers",          get(get_peers))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: ApiState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::Dispatch(e) if e.is_key_miss() => StatusCode::NOT_FOUND,
            ServiceError::Dispatch(DispatchError::UnsupportedChain(_))
            | ServiceError::Dispatch(DispatchError::Adaptor(AdaptorError::InvalidRequest(_))) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Relay(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Dispatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

async fn support_chain(
    State(state): State<ApiState>,
    Json(req):    Json<SupportChainReq>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(state.0.service.get_support_chain(&req).await?))
}

async fn get_social_key(
    State(state): State<ApiState>,
    Json(req):    Json<GetSocialKeyReq>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(state.0.service.get_social_key(&req).await?))
}

async fn set_social_key(
    State(state): State<ApiState>,
    Json(req):    Json<SetSocialKeyReq>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(state.0.service.set_social_key(&req).await?))
}

async fn get_peers(State(state): State<ApiState>) -> impl IntoResponse {
    let connected = match &state.0.client {
        Some(client) => client.connected_peers().await,
        None => Vec::new(),
    };
    Json(PeersSnapshot {
        local: state.0.local_peer.clone(),
        known: state.0.peer_store.peers().iter().map(|p| p.to_base58()).collect(),
        connected: connected.iter().map(|p| p.to_base58()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::{AdaptorContext, ETHEREUM};
    use crate::dispatcher::Dispatcher;
    use crate::peer_store::PeerStore;
    use axum::body::Body;
    use axum::http::Request;
    use keylocker_crypto::SymmetricKey;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, SharedPeerStore) {
        let ctx = AdaptorContext::new(SymmetricKey::generate(), 1024);
        let dispatcher = Arc::new(Dispatcher::new(&[ETHEREUM.to_string()], &ctx));
        let service = Arc::new(KeyService::new(dispatcher, None));
        let store: SharedPeerStore = Arc::new(PeerStore::new());
        let state = ApiState::new(service, store.clone(), None, "local".into());
        (router(state), store)
    }

    async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn set_then_get_round_trip() {
        let (app, _) = app();
        let (status, body) = post_json(
            &app,
            "/v1/social-key/set",
            serde_json::json!({ "chain": "Ethereum", "uuid": "u1", "key": "secret-abc" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], "success");
        assert!(body["pub_key"].as_str().unwrap().contains("PUBLIC KEY"));

        let (status, body) = post_json(
            &app,
            "/v1/social-key/get",
            serde_json::json!({ "chain": "Ethereum", "uuid": "u1" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["key_list"][0]["key"], "secret-abc");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let (app, _) = app();
        let (status, body) = post_json(
            &app,
            "/v1/social-key/get",
            serde_json::json!({ "chain": "Ethereum", "uuid": "nobody" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nobody"));
    }

    #[tokio::test]
    async fn unconfigured_chain_is_reported_unsupported() {
        let (app, _) = app();
        let (status, body) = post_json(
            &app,
            "/v1/support-chain",
            serde_json::json!({ "chain": "Dogecoin" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], "unsupported");
        assert_eq!(body["support"], false);
    }

    #[tokio::test]
    async fn peers_lists_known_peers() {
        let (app, store) = app();
        let peer = libp2p::PeerId::random();
        store.add_addrs(peer, ["/ip4/10.0.0.2/tcp/4001".parse().unwrap()], Duration::from_secs(60));

        let req = Request::builder().uri("/v1/peers").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["local"], "local");
        assert_eq!(body["known"][0], peer.to_base58());
        assert!(body["connected"].as_array().unwrap().is_empty());
    }
}
