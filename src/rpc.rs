use {
  crate::{node::NodeHandle, primitives::ToHexString},
  axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json,
    Router,
  },
  serde_json::json,
  std::{net::SocketAddr, sync::Arc},
  tokio::sync::mpsc,
  tracing::info,
};

struct ServiceSharedState {
  node: NodeHandle,
  submit_tx: mpsc::Sender<Vec<u8>>,
}

/// Read-only query surface over the node, plus transaction
/// submission. Everything here reads finished state; consensus never
/// waits for it.
pub struct ApiService;

impl ApiService {
  pub fn new(
    addrs: Vec<SocketAddr>,
    node: NodeHandle,
    submit_tx: mpsc::Sender<Vec<u8>>,
  ) -> Self {
    let shared_state = Arc::new(ServiceSharedState { node, submit_tx });

    let svc = Router::new()
      .route("/stats", get(serve_stats))
      .route("/block/:index", get(serve_block))
      .route("/transaction", post(serve_submit_transaction))
      .layer(Extension(shared_state));

    for addr in addrs {
      let svc = svc.clone();
      tokio::spawn(async move {
        info!(%addr, "api listening");
        if let Err(e) = axum::Server::bind(&addr)
          .serve(svc.into_make_service())
          .await
        {
          tracing::error!(%addr, error = %e, "api server failed");
        }
      });
    }

    Self
  }
}

async fn serve_stats(
  Extension(state): Extension<Arc<ServiceSharedState>>,
) -> impl IntoResponse {
  Json(json!({
    "system": {
      "name": env!("CARGO_PKG_NAME"),
      "version": env!("CARGO_PKG_VERSION")
    },
    "stats": state.node.stats().await,
  }))
}

/// Examples:
///  - /block/0
async fn serve_block(
  Path(index): Path<i64>,
  Extension(state): Extension<Arc<ServiceSharedState>>,
) -> impl IntoResponse {
  match state.node.block(index).await {
    Some(block) => (
      StatusCode::OK,
      Json(json!({
        "block": {
          "index": block.index(),
          "round_received": block.round_received(),
          "state_hash": block.state_hash().to_hex(),
          "transactions": block
            .transactions()
            .iter()
            .map(|tx| String::from_utf8_lossy(tx))
            .collect::<Vec<_>>(),
          "signatures": block.signatures,
        }
      })),
    ),
    None => (
      StatusCode::NOT_FOUND,
      Json(json!({
        "block": index,
        "error": "not_found"
      })),
    ),
  }
}

/// Accepts raw transaction bytes and feeds them into the node's
/// submission pipeline.
async fn serve_submit_transaction(
  Extension(state): Extension<Arc<ServiceSharedState>>,
  body: Bytes,
) -> impl IntoResponse {
  if body.is_empty() {
    return (
      StatusCode::BAD_REQUEST,
      Json(json!({ "error": "empty transaction" })),
    );
  }
  match state.submit_tx.send(body.to_vec()).await {
    Ok(()) => (
      StatusCode::CREATED,
      Json(json!({ "submitted": body.len() })),
    ),
    Err(e) => (
      StatusCode::INTERNAL_SERVER_ERROR,
      Json(json!({ "error": e.to_string() })),
    ),
  }
}
