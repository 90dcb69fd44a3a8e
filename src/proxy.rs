//! Plain-HTTP proxy in front of a certificate-authenticated full node.
//!
//! The X-chain full node authenticates clients with mutual TLS; running this
//! proxy on the same host lets the follower's `rpc_url` point at a plain
//! local endpoint. Every POST is forwarded verbatim to the upstream node
//! with the configured client identity attached.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use tower_http::trace::TraceLayer;
use url::Url;

use crate::config::ProxyConfig;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("could not read node certificate material: {0}")]
    Certificate(std::io::Error),
    #[error("could not build upstream client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("proxy server error: {0}")]
    Serve(std::io::Error),
}

struct ProxyState {
    client: reqwest::Client,
    upstream: Url,
}

/// Runs the proxy until the process exits.
pub async fn serve(config: &ProxyConfig) -> Result<(), ProxyError> {
    let mut pem = std::fs::read(&config.cert_path).map_err(ProxyError::Certificate)?;
    pem.extend(std::fs::read(&config.key_path).map_err(ProxyError::Certificate)?);
    let identity = reqwest::Identity::from_pem(&pem)?;
    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .identity(identity)
        // Full nodes ship self-signed certificates.
        .danger_accept_invalid_certs(true)
        .build()?;

    let state = Arc::new(ProxyState {
        client,
        upstream: config.upstream_url.clone(),
    });
    let app = Router::new()
        .route("/{endpoint}", post(forward))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .map_err(ProxyError::Serve)?;
    tracing::info!(
        listen = %config.listen_addr,
        upstream = %config.upstream_url,
        "full-node proxy started"
    );
    axum::serve(listener, app).await.map_err(ProxyError::Serve)
}

fn upstream_url(upstream: &Url, endpoint: &str) -> String {
    format!("{}/{}", upstream.as_str().trim_end_matches('/'), endpoint)
}

async fn forward(
    State(state): State<Arc<ProxyState>>,
    Path(endpoint): Path<String>,
    body: Bytes,
) -> (StatusCode, Bytes) {
    let url = upstream_url(&state.upstream, &endpoint);
    let result = state
        .client
        .post(&url)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await;
    match result {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let payload = response.bytes().await.unwrap_or_default();
            (status, Bytes::from(payload.to_vec()))
        }
        Err(e) => {
            tracing::error!(url, error = %e, "upstream node request failed");
            (
                StatusCode::BAD_GATEWAY,
                Bytes::from(format!("{{\"success\": false, \"error\": \"{e}\"}}")),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_urls_tolerate_trailing_slash() {
        let with_slash: Url = "https://localhost:8555/".parse().unwrap();
        let without: Url = "https://localhost:8555".parse().unwrap();
        assert_eq!(
            upstream_url(&with_slash, "get_blockchain_state"),
            "https://localhost:8555/get_blockchain_state"
        );
        assert_eq!(
            upstream_url(&without, "get_blockchain_state"),
            "https://localhost:8555/get_blockchain_state"
        );
    }

    #[test]
    fn garbage_identity_material_is_rejected() {
        assert!(reqwest::Identity::from_pem(b"not a pem").is_err());
    }
}
