//! HTTP full-node RPC client for the X-chain.
//!
//! Talks plain JSON-over-POST to a full node (typically fronted by the
//! `rpc-proxy` command, which terminates the node's client-certificate TLS).
//! Transport-level failures are retried indefinitely with a 5-second sleep;
//! only node-reported failures and malformed responses surface to callers.

use alloy_primitives::{B256, Bytes};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{Duration, sleep};
use url::Url;

use super::clvm;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Node-reported or structural RPC failures. Transport errors never surface.
#[derive(Debug, thiserror::Error)]
pub enum NodeRpcError {
    #[error("node rejected {endpoint}: {reason}")]
    Rejected {
        endpoint: &'static str,
        reason: String,
    },
    #[error("unexpected {endpoint} response: {reason}")]
    Malformed {
        endpoint: &'static str,
        reason: String,
    },
}

/// An unspent-output on the X-chain.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct Coin {
    pub parent_coin_info: B256,
    pub puzzle_hash: B256,
    pub amount: u64,
}

impl Coin {
    pub fn coin_id(&self) -> B256 {
        clvm::coin_id(&self.parent_coin_info, &self.puzzle_hash, self.amount)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinRecord {
    pub coin: Coin,
    pub confirmed_block_index: u64,
    pub spent_block_index: u64,
}

impl CoinRecord {
    pub fn is_spent(&self) -> bool {
        self.spent_block_index > 0
    }
}

/// A spend as returned by `get_puzzle_and_solution`: the coin plus the
/// serialized puzzle reveal and solution.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinSpend {
    pub coin: Coin,
    pub puzzle_reveal: Bytes,
    pub solution: Bytes,
}

pub struct FullNodeClient {
    base_url: Url,
    http: reqwest::Client,
}

impl FullNodeClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), endpoint)
    }

    /// Single request attempt; used by the startup liveness probe.
    pub async fn probe(&self) -> Result<(), String> {
        let response = self
            .http
            .post(self.endpoint_url("get_blockchain_state"))
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        response.error_for_status().map_err(|e| e.to_string())?;
        Ok(())
    }

    /// POSTs until the node produces a JSON response, then hands it back
    /// whether or not `success` is set.
    async fn post(
        &self,
        endpoint: &'static str,
        body: serde_json::Value,
    ) -> serde_json::Value {
        loop {
            let result = async {
                let response = self
                    .http
                    .post(self.endpoint_url(endpoint))
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()?;
                response.json::<serde_json::Value>().await
            }
            .await;
            match result {
                Ok(value) => return value,
                Err(e) => {
                    tracing::error!(endpoint, error = %e, "node RPC failed; retrying in 5s");
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn post_success(
        &self,
        endpoint: &'static str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, NodeRpcError> {
        let value = self.post(endpoint, body).await;
        if value.get("success").and_then(|v| v.as_bool()) == Some(false) {
            return Err(NodeRpcError::Rejected {
                endpoint,
                reason: value
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("no error given")
                    .to_string(),
            });
        }
        Ok(value)
    }

    /// Current peak height of the node's view of the chain.
    pub async fn peak_height(&self) -> Result<u64, NodeRpcError> {
        let endpoint = "get_blockchain_state";
        let value = self.post_success(endpoint, json!({})).await?;
        value
            .pointer("/blockchain_state/peak/height")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| NodeRpcError::Malformed {
                endpoint,
                reason: "missing peak height".to_string(),
            })
    }

    pub async fn coin_records_by_puzzle_hash(
        &self,
        puzzle_hash: &B256,
        include_spent_coins: bool,
        start_height: u64,
    ) -> Result<Vec<CoinRecord>, NodeRpcError> {
        let endpoint = "get_coin_records_by_puzzle_hash";
        let value = self
            .post_success(
                endpoint,
                json!({
                    "puzzle_hash": puzzle_hash,
                    "include_spent_coins": include_spent_coins,
                    "start_height": start_height,
                }),
            )
            .await?;
        let records = value
            .get("coin_records")
            .cloned()
            .ok_or_else(|| NodeRpcError::Malformed {
                endpoint,
                reason: "missing coin_records".to_string(),
            })?;
        serde_json::from_value(records).map_err(|e| NodeRpcError::Malformed {
            endpoint,
            reason: e.to_string(),
        })
    }

    /// `None` when the node does not know the coin.
    pub async fn coin_record_by_name(
        &self,
        coin_id: &B256,
    ) -> Result<Option<CoinRecord>, NodeRpcError> {
        let endpoint = "get_coin_record_by_name";
        let value = self.post(endpoint, json!({ "name": coin_id })).await;
        if value.get("success").and_then(|v| v.as_bool()) == Some(false) {
            return Ok(None);
        }
        let record = value
            .get("coin_record")
            .cloned()
            .ok_or_else(|| NodeRpcError::Malformed {
                endpoint,
                reason: "missing coin_record".to_string(),
            })?;
        serde_json::from_value(record)
            .map(Some)
            .map_err(|e| NodeRpcError::Malformed {
                endpoint,
                reason: e.to_string(),
            })
    }

    pub async fn puzzle_and_solution(
        &self,
        coin_id: &B256,
        spent_height: u64,
    ) -> Result<CoinSpend, NodeRpcError> {
        let endpoint = "get_puzzle_and_solution";
        let value = self
            .post_success(endpoint, json!({ "coin_id": coin_id, "height": spent_height }))
            .await?;
        let spend = value
            .get("coin_solution")
            .cloned()
            .ok_or_else(|| NodeRpcError::Malformed {
                endpoint,
                reason: "missing coin_solution".to_string(),
            })?;
        serde_json::from_value(spend).map_err(|e| NodeRpcError::Malformed {
            endpoint,
            reason: e.to_string(),
        })
    }
}
