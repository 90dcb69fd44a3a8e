//! Chain followers.
//!
//! Each configured chain gets one follower: E-chains scan portal contract
//! logs and sign EIP-712 payloads, the X-chain scans bridging coins, tracks
//! the portal singleton, and signs BLS payloads. The two share only this
//! small surface; the orchestrator drives them through it.

pub mod evm;
pub mod xch;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;

use crate::message::ChainTag;
use crate::store::StoreError;

/// Fatal follower failures. Transient network errors never surface here;
/// they are retried inside the loops.
#[derive(Debug, thiserror::Error)]
pub enum FollowerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The node answered, but with something that makes no sense for the
    /// chain state we rely on. Signing against it would be unsafe.
    #[error("{chain} follower: inconsistent chain state: {reason}")]
    Inconsistent { chain: ChainTag, reason: String },
    #[error("{chain} follower: {reason}")]
    Signer { chain: ChainTag, reason: String },
}

/// A follower for one chain: a liveness probe plus its long-running tasks.
#[async_trait]
pub trait ChainFollower: Send + Sync {
    fn chain(&self) -> ChainTag;

    /// Blocks until the chain's node answers a basic request, retrying every
    /// 10 seconds. `log_startup_errors` controls whether connection errors
    /// are logged in detail while waiting.
    async fn wait_for_node(&self, log_startup_errors: bool);

    /// Spawns this follower's tasks. Any task returning an error (or
    /// panicking) is fatal to the whole process.
    fn start(self: Arc<Self>, tasks: &mut JoinSet<Result<(), FollowerError>>);
}
