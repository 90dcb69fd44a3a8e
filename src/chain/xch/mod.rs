//! X-chain follower: bridging-coin ingestion, portal tracking, and BLS
//! signing.
//!
//! Messages leave the X-chain as coins paid to a fixed bridging puzzle hash;
//! the memos attached to the creating `CREATE_COIN` condition carry the
//! destination chain, destination address, and content words. The message
//! nonce is the bridging coin's id, so uniqueness is inherited from the coin
//! set. Signing is bound to the current portal coin id published by the
//! tracker; while the tracker is still catching up the signer refuses to
//! run.

pub mod clvm;
pub mod portal;
pub mod rpc;
pub mod sign;

use std::collections::HashSet;
use std::sync::Arc;

use alloy_primitives::B256;
use async_trait::async_trait;
use clvmr::Allocator;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep};

use crate::chain::{ChainFollower, FollowerError};
use crate::codec::{Route, decode_signature, encode_signature};
use crate::config::XchChainConfig;
use crate::message::{ChainTag, Message, SIG_USED, normalize_word};
use crate::relay::Broadcaster;
use crate::store::Store;

use portal::{PortalCell, PortalTracker};
use rpc::{CoinRecord, FullNodeClient, NodeRpcError};
use sign::HotKey;

const LISTENER_POLL_DELAY: Duration = Duration::from_secs(5);
const CONFIRMATION_POLL_DELAY: Duration = Duration::from_secs(10);
const SIGNER_POLL_DELAY: Duration = Duration::from_secs(5);

pub struct XchFollower {
    chain: ChainTag,
    node: Arc<FullNodeClient>,
    store: Store,
    broadcaster: Broadcaster,
    min_height: u64,
    sign_min_height: u64,
    bridging_puzzle_hash: B256,
    per_message_toll: u64,
    agg_sig_data: B256,
    launcher_id: B256,
    hot_key: HotKey,
    cell: Arc<PortalCell>,
}

impl XchFollower {
    pub fn new(
        chain: ChainTag,
        config: &XchChainConfig,
        hot_key: HotKey,
        store: Store,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            chain,
            node: Arc::new(FullNodeClient::new(config.rpc_url.clone())),
            store,
            broadcaster,
            min_height: config.min_height,
            sign_min_height: config.sign_min_height,
            bridging_puzzle_hash: config.bridging_puzzle_hash,
            per_message_toll: config.per_message_toll,
            agg_sig_data: config.agg_sig_data,
            launcher_id: config.portal_launcher_id,
            hot_key,
            cell: Arc::new(PortalCell::new()),
        }
    }

    fn node_err(&self, e: NodeRpcError) -> FollowerError {
        FollowerError::Inconsistent {
            chain: self.chain,
            reason: e.to_string(),
        }
    }

    fn inconsistent(&self, reason: impl Into<String>) -> FollowerError {
        FollowerError::Inconsistent {
            chain: self.chain,
            reason: reason.into(),
        }
    }

    /// Scans bridging coins from the resume height, drains each result batch
    /// fully, and persists one message per confirmed coin.
    async fn message_listener(self: Arc<Self>) -> Result<(), FollowerError> {
        // Ids handled this process lifetime; saves re-decoding coins the
        // store already knows while a batch is drained.
        let mut processed: HashSet<B256> = HashSet::new();

        'scan: loop {
            let start_height = match self.store.highest_block_number(self.chain).await? {
                Some(last) => self.min_height.max(last.saturating_sub(1)),
                None => self.min_height,
            };
            let mut records = self
                .node
                .coin_records_by_puzzle_hash(&self.bridging_puzzle_hash, true, start_height)
                .await
                .map_err(|e| self.node_err(e))?;
            records.sort_by_key(|record| record.confirmed_block_index);

            for record in records {
                let coin_id = record.coin.coin_id();
                if processed.contains(&coin_id) {
                    continue;
                }
                if self.store.get_message(self.chain, &coin_id).await?.is_some() {
                    processed.insert(coin_id);
                    continue;
                }
                if record.coin.amount < self.per_message_toll {
                    tracing::info!(
                        chain = %self.chain,
                        coin_id = %coin_id,
                        amount = record.coin.amount,
                        "bridging coin below toll; ignoring"
                    );
                    processed.insert(coin_id);
                    continue;
                }

                let message = self.decode_bridging_coin(&record).await?;

                // Depth confirmation, then a re-fetch to rule out a reorg
                // that moved or removed the coin while we waited.
                loop {
                    let peak = self.node.peak_height().await.map_err(|e| self.node_err(e))?;
                    if peak >= record.confirmed_block_index + self.sign_min_height {
                        break;
                    }
                    tracing::info!(
                        chain = %self.chain,
                        coin_id = %coin_id,
                        peak,
                        confirmed = record.confirmed_block_index,
                        "waiting for confirmation depth"
                    );
                    sleep(CONFIRMATION_POLL_DELAY).await;
                }
                let fresh = self
                    .node
                    .coin_record_by_name(&coin_id)
                    .await
                    .map_err(|e| self.node_err(e))?;
                let unchanged = fresh
                    .as_ref()
                    .is_some_and(|f| f.confirmed_block_index == record.confirmed_block_index);
                if !unchanged {
                    tracing::info!(chain = %self.chain, coin_id = %coin_id, "bridging coin moved; assuming reorg");
                    continue 'scan;
                }

                tracing::info!(chain = %self.chain, nonce = %coin_id, "adding message");
                self.store.put_message(&message).await?;
                processed.insert(coin_id);
            }

            sleep(LISTENER_POLL_DELAY).await;
        }
    }

    /// Reconstructs the message carried by a bridging coin from its parent's
    /// spend.
    async fn decode_bridging_coin(&self, record: &CoinRecord) -> Result<Message, FollowerError> {
        let coin_id = record.coin.coin_id();
        let parent_id = record.coin.parent_coin_info;
        // The coin was created in the block its parent was spent in.
        let spend = self
            .node
            .puzzle_and_solution(&parent_id, record.confirmed_block_index)
            .await
            .map_err(|e| self.node_err(e))?;

        let mut a = Allocator::new();
        let puzzle = clvm::parse(&mut a, &spend.puzzle_reveal)
            .map_err(|e| self.inconsistent(e.to_string()))?;
        let solution = clvm::parse(&mut a, &spend.solution)
            .map_err(|e| self.inconsistent(e.to_string()))?;
        let output =
            clvm::run(&mut a, puzzle, solution).map_err(|e| self.inconsistent(e.to_string()))?;
        let created =
            clvm::created_coins(&a, output).map_err(|e| self.inconsistent(e.to_string()))?;

        let creating = created
            .into_iter()
            .find(|coin| clvm::coin_id(&parent_id, &coin.puzzle_hash, coin.amount) == coin_id)
            .ok_or_else(|| {
                self.inconsistent(format!("parent spend does not create bridging coin {coin_id}"))
            })?;
        if creating.memos.len() < 2 {
            return Err(self.inconsistent(format!(
                "bridging coin {coin_id} memos missing destination"
            )));
        }
        let destination_chain = ChainTag::try_from(creating.memos[0].as_slice())
            .map_err(|e| self.inconsistent(format!("bridging coin {coin_id}: {e}")))?;
        let destination = normalize_word(&creating.memos[1]);
        let contents = creating.memos[2..]
            .iter()
            .map(|memo| normalize_word(memo))
            .collect();

        Ok(Message {
            nonce: coin_id,
            source_chain: self.chain,
            source: spend.coin.puzzle_hash,
            destination_chain,
            destination,
            contents,
            block_number: record.confirmed_block_index,
            sig: String::new(),
        })
    }

    /// Signs messages destined for this chain under the current portal coin
    /// id. Runs only after the tracker has reached the unspent tip.
    async fn message_signer(self: Arc<Self>) -> Result<(), FollowerError> {
        self.cell.wait_until_synced().await;
        tracing::info!(chain = %self.chain, "portal synced; signer starting");

        loop {
            let portal_coin = self.cell.wait_for_coin().await;
            let used = self
                .store
                .portal_tip(self.chain)
                .await?
                .map(|state| state.used)
                .unwrap_or_default();

            let mut batch = self.store.unsigned_for_destination(self.chain).await?;
            // A portal advance invalidates signatures bound to an older coin
            // id; re-sign those against the new tip.
            for message in self.store.signed_for_destination(self.chain).await? {
                let stale = match decode_signature(&message.sig) {
                    Ok(decoded) => decoded.coin_id != Some(portal_coin),
                    Err(_) => true,
                };
                if stale {
                    tracing::info!(
                        chain = %self.chain,
                        nonce = %message.nonce,
                        "signature bound to stale portal coin; re-signing"
                    );
                    batch.push(message);
                }
            }

            for message in batch {
                let Some(nonce_int) = message.nonce_int() else {
                    return Err(self.inconsistent(format!(
                        "nonce {} does not fit in 64 bits",
                        message.nonce
                    )));
                };
                if used.contains(message.source_chain, nonce_int) {
                    tracing::info!(
                        chain = %self.chain,
                        source_chain = %message.source_chain,
                        nonce = %message.nonce,
                        "nonce already consumed; marking used instead of signing"
                    );
                    self.store
                        .set_signature(message.source_chain, &message.nonce, SIG_USED)
                        .await?;
                    continue;
                }

                let encoded = self.sign_message(&message, &portal_coin)?;
                self.store
                    .set_signature(message.source_chain, &message.nonce, &encoded)
                    .await?;
                tracing::info!(
                    chain = %self.chain,
                    source_chain = %message.source_chain,
                    nonce = %message.nonce,
                    sig = %encoded,
                    "signed message"
                );
                self.broadcaster.add_signature(&encoded);
            }

            sleep(SIGNER_POLL_DELAY).await;
        }
    }

    /// Augmented BLS signature over
    /// `tree_hash((source_chain, nonce, source, destination, contents)) ||
    /// portal_coin_id || agg_sig_data`.
    fn sign_message(&self, message: &Message, portal_coin: &B256) -> Result<String, FollowerError> {
        let digest = self.message_tree_hash(message)?;
        let mut to_sign = Vec::with_capacity(96);
        to_sign.extend_from_slice(digest.as_slice());
        to_sign.extend_from_slice(portal_coin.as_slice());
        to_sign.extend_from_slice(self.agg_sig_data.as_slice());
        let raw = self.hot_key.sign(&to_sign);

        Ok(encode_signature(
            Route {
                source_chain: message.source_chain,
                destination_chain: message.destination_chain,
                nonce: message.nonce,
            },
            Some(*portal_coin),
            &raw,
        ))
    }

    fn message_tree_hash(&self, message: &Message) -> Result<B256, FollowerError> {
        let mut a = Allocator::new();
        let build = |a: &mut Allocator, bytes: &[u8]| {
            clvm::build_atom(a, bytes).map_err(|e| self.inconsistent(e.to_string()))
        };

        let source_chain = build(&mut a, message.source_chain.as_bytes())?;
        let nonce = build(&mut a, message.nonce.as_slice())?;
        // Leading zero bytes of the padded source are stripped before
        // hashing so the atom matches the on-chain representation.
        let source_stripped: Vec<u8> = message
            .source
            .iter()
            .copied()
            .skip_while(|b| *b == 0)
            .collect();
        let source = build(&mut a, &source_stripped)?;
        let destination = build(&mut a, message.destination.as_slice())?;
        let mut words = Vec::with_capacity(message.contents.len());
        for word in &message.contents {
            words.push(build(&mut a, word.as_slice())?);
        }
        let contents = clvm::build_list(&mut a, &words)
            .map_err(|e| self.inconsistent(e.to_string()))?;
        let tuple =
            clvm::build_list(&mut a, &[source_chain, nonce, source, destination, contents])
                .map_err(|e| self.inconsistent(e.to_string()))?;
        Ok(clvm::tree_hash(&a, tuple))
    }
}

#[async_trait]
impl ChainFollower for XchFollower {
    fn chain(&self) -> ChainTag {
        self.chain
    }

    async fn wait_for_node(&self, log_startup_errors: bool) {
        loop {
            match self.node.probe().await {
                Ok(()) => return,
                Err(e) => {
                    if log_startup_errors {
                        tracing::info!(chain = %self.chain, error = %e, "could not connect to node; trying again in 10s");
                    } else {
                        tracing::info!(chain = %self.chain, "could not connect to node; trying again in 10s");
                    }
                    sleep(Duration::from_secs(10)).await;
                }
            }
        }
    }

    fn start(self: Arc<Self>, tasks: &mut JoinSet<Result<(), FollowerError>>) {
        let listener = self.clone();
        tasks.spawn(async move { listener.message_listener().await });

        let tracker = PortalTracker::new(
            self.chain,
            self.launcher_id,
            self.node.clone(),
            self.store.clone(),
            self.cell.clone(),
        );
        tasks.spawn(async move { tracker.run().await });

        let signer = self;
        tasks.spawn(async move { signer.message_signer().await });
    }
}
