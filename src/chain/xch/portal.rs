//! Portal singleton tracker.
//!
//! The portal is a chain of unit-amount coins: each spend consumes a batch
//! of `(source_chain, nonce)` pairs, optionally rotates the validator set,
//! and creates exactly one odd-amount child (the next portal). The tracker
//! walks this lineage from the persisted last-known coin id, stopping at the
//! unspent tip, and is the sole writer of portal states. Consumed nonces are
//! folded into the compact used-set and the matching local messages are
//! marked `used`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use alloy_primitives::B256;
use clvmr::Allocator;
use clvmr::allocator::SExp;
use tokio::time::{Duration, sleep};

use crate::chain::FollowerError;
use crate::message::{ChainTag, SIG_USED, normalize_word};
use crate::store::{PortalState, Store};
use crate::used_set::UsedSet;

use super::clvm;
use super::rpc::{CoinSpend, FullNodeClient, NodeRpcError};

/// How long the tracker sleeps between polls once it sits at an unspent tip.
const TIP_POLL_DELAY: Duration = Duration::from_secs(5);

/// Bounded wait for a consumed message to appear locally before the tracker
/// gives up (the listener should only ever be seconds behind).
const MARK_USED_ATTEMPTS: u32 = 120;
const MARK_USED_DELAY: Duration = Duration::from_secs(1);

/// How often signers re-check the cell while the portal coin id is unset.
const CELL_POLL_DELAY: Duration = Duration::from_millis(100);

/// The portal coin id shared between the tracker (writer) and the signer
/// (reader). The latest value is the only one that matters, so this is a
/// mutex-protected cell rather than a channel; readers poll while it is
/// still unset.
#[derive(Debug)]
pub struct PortalCell {
    coin: Mutex<Option<B256>>,
    syncing: AtomicBool,
}

impl PortalCell {
    pub fn new() -> Self {
        Self {
            coin: Mutex::new(None),
            syncing: AtomicBool::new(true),
        }
    }

    pub fn set_coin(&self, coin_id: B256) {
        *self.coin.lock().expect("portal cell lock") = Some(coin_id);
    }

    pub fn coin(&self) -> Option<B256> {
        *self.coin.lock().expect("portal cell lock")
    }

    pub fn mark_synced(&self) {
        self.syncing.store(false, Ordering::Release);
    }

    /// True until the tracker has observed its tip coin unspent.
    pub fn syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub async fn wait_for_coin(&self) -> B256 {
        loop {
            if let Some(coin_id) = self.coin() {
                return coin_id;
            }
            sleep(CELL_POLL_DELAY).await;
        }
    }

    /// Blocks while the tracker is still catching up; returns once `syncing`
    /// has transitioned to false.
    pub async fn wait_until_synced(&self) {
        while self.syncing() {
            sleep(CELL_POLL_DELAY).await;
        }
    }
}

/// A `(source_chain, nonce)` pair consumed by a portal spend.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConsumedNonce {
    pub chain: ChainTag,
    /// Left-padded 32-byte form, the store key.
    pub nonce: B256,
    /// Integer form for the used-set.
    pub nonce_int: u64,
}

/// What a portal spend did.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PortalAdvance {
    pub child_coin_id: B256,
    pub consumed: Vec<ConsumedNonce>,
    /// True when the spend carried a validator-set update package.
    pub rotated: bool,
}

pub struct PortalTracker {
    chain: ChainTag,
    launcher_id: B256,
    node: Arc<FullNodeClient>,
    store: Store,
    cell: Arc<PortalCell>,
}

impl PortalTracker {
    pub fn new(
        chain: ChainTag,
        launcher_id: B256,
        node: Arc<FullNodeClient>,
        store: Store,
        cell: Arc<PortalCell>,
    ) -> Self {
        Self {
            chain,
            launcher_id,
            node,
            store,
            cell,
        }
    }

    pub async fn run(self) -> Result<(), FollowerError> {
        let mut tip = match self.store.load_last_portal_coin_id(self.chain).await? {
            Some(coin_id) => coin_id,
            None => self.bootstrap().await?,
        };
        tracing::info!(chain = %self.chain, tip = %tip, "portal tracker starting");
        loop {
            tip = self.step(tip).await?;
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

    async fn coin_record(&self, coin_id: &B256) -> Result<super::rpc::CoinRecord, FollowerError> {
        self.node
            .coin_record_by_name(coin_id)
            .await
            .map_err(|e| self.node_err(e))?
            .ok_or_else(|| self.inconsistent(format!("portal coin {coin_id} unknown to the node")))
    }

    /// First run: the configured launcher must already be spent; its
    /// singleton-creating output is the first portal state.
    async fn bootstrap(&self) -> Result<B256, FollowerError> {
        let launcher = self.coin_record(&self.launcher_id).await?;
        if !launcher.is_spent() {
            return Err(self.inconsistent("portal launcher has not been spent"));
        }
        let spend = self
            .node
            .puzzle_and_solution(&self.launcher_id, launcher.spent_block_index)
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
        let singleton = created
            .iter()
            .find(|coin| coin.amount == 1)
            .ok_or_else(|| self.inconsistent("launcher spend created no singleton"))?;

        let first_portal = clvm::coin_id(&self.launcher_id, &singleton.puzzle_hash, 1);
        let state = PortalState {
            chain: self.chain,
            coin_id: first_portal,
            parent_id: self.launcher_id,
            used: UsedSet::new(),
            confirmed_block_height: Some(launcher.spent_block_index),
        };
        self.store.record_portal_spend(&state).await?;
        tracing::info!(chain = %self.chain, coin_id = %first_portal, "resolved first portal from launcher");
        Ok(first_portal)
    }

    /// One lineage transition; returns the coin id to continue from.
    async fn step(&self, tip: B256) -> Result<B256, FollowerError> {
        let record = self.coin_record(&tip).await?;

        if !record.is_spent() {
            let parent_id = record.coin.parent_coin_info;
            if parent_id != self.launcher_id {
                let parent = self.coin_record(&parent_id).await?;
                if !parent.is_spent() {
                    // The spend that produced this tip was reorged away.
                    tracing::info!(
                        chain = %self.chain,
                        tip = %tip,
                        parent = %parent_id,
                        "portal parent rolled back; reverting to parent"
                    );
                    if let Some(state) = self.store.portal_state(self.chain, &tip).await? {
                        if let Some(height) = state.confirmed_block_height {
                            self.store
                                .null_portal_heights_at_or_above(self.chain, height)
                                .await?;
                        }
                    }
                    self.store
                        .persist_last_portal_coin_id(self.chain, &parent_id)
                        .await?;
                    return Ok(parent_id);
                }
            }

            self.cell.set_coin(tip);
            self.cell.mark_synced();
            sleep(TIP_POLL_DELAY).await;
            return Ok(tip);
        }

        let spend = self
            .node
            .puzzle_and_solution(&tip, record.spent_block_index)
            .await
            .map_err(|e| self.node_err(e))?;
        let advance = parse_portal_spend(self.chain, &spend, tip)?;

        let mut used = self
            .store
            .portal_state(self.chain, &tip)
            .await?
            .map(|state| state.used)
            .unwrap_or_default();
        for consumed in &advance.consumed {
            self.mark_used(consumed.chain, &consumed.nonce).await?;
            if let Err(e) = used.insert(consumed.chain, consumed.nonce_int) {
                // Replays after a restart land here; the on-chain state is
                // the authority, so this is not fatal.
                tracing::warn!(chain = %self.chain, error = %e, "nonce already in used set");
            }
        }
        if advance.rotated {
            tracing::info!(chain = %self.chain, "portal spend rotated the validator set");
        }

        let state = PortalState {
            chain: self.chain,
            coin_id: advance.child_coin_id,
            parent_id: tip,
            used,
            confirmed_block_height: Some(record.spent_block_index),
        };
        self.store.record_portal_spend(&state).await?;
        self.cell.set_coin(advance.child_coin_id);
        tracing::info!(
            chain = %self.chain,
            coin_id = %advance.child_coin_id,
            consumed = advance.consumed.len(),
            "portal advanced"
        );
        Ok(advance.child_coin_id)
    }

    /// Waits (bounded) for the consumed message to exist locally, then makes
    /// its `used` state terminal.
    async fn mark_used(&self, chain: ChainTag, nonce: &B256) -> Result<(), FollowerError> {
        for _ in 0..MARK_USED_ATTEMPTS {
            if let Some(message) = self.store.get_message(chain, nonce).await? {
                if !message.is_used() {
                    self.store.set_signature(chain, nonce, SIG_USED).await?;
                    tracing::info!(source_chain = %chain, nonce = %nonce, "message consumed by portal spend");
                }
                return Ok(());
            }
            tracing::info!(source_chain = %chain, nonce = %nonce, "consumed message not ingested yet; waiting");
            sleep(MARK_USED_DELAY).await;
        }
        Err(self.inconsistent(format!(
            "message {chain}-{nonce} consumed on-chain never appeared locally"
        )))
    }
}

/// Parses a portal spend: locates the singleton child and decodes the inner
/// solution's update-package indicator and consumed-nonce list.
pub fn parse_portal_spend(
    chain: ChainTag,
    spend: &CoinSpend,
    parent_coin_id: B256,
) -> Result<PortalAdvance, FollowerError> {
    let inconsistent = |reason: String| FollowerError::Inconsistent { chain, reason };

    let mut a = Allocator::new();
    let puzzle =
        clvm::parse(&mut a, &spend.puzzle_reveal).map_err(|e| inconsistent(e.to_string()))?;
    let solution = clvm::parse(&mut a, &spend.solution).map_err(|e| inconsistent(e.to_string()))?;
    let output = clvm::run(&mut a, puzzle, solution).map_err(|e| inconsistent(e.to_string()))?;

    let created = clvm::created_coins(&a, output).map_err(|e| inconsistent(e.to_string()))?;
    let child = created
        .iter()
        .find(|coin| coin.amount == 1)
        .ok_or_else(|| inconsistent("portal spend created no singleton child".to_string()))?;
    let child_coin_id = clvm::coin_id(&parent_coin_id, &child.puzzle_hash, child.amount);

    // Singleton solution: (lineage_proof my_amount inner_solution); the
    // inner solution opens with the update package and the consumed list.
    let solution_items = clvm::list_items(&a, solution);
    if solution_items.len() < 3 {
        return Err(inconsistent(
            "portal solution is not a singleton solution".to_string(),
        ));
    }
    let inner_items = clvm::list_items(&a, solution_items[2]);
    if inner_items.len() < 2 {
        return Err(inconsistent(
            "portal inner solution missing consumed-nonce list".to_string(),
        ));
    }

    let rotated = match a.sexp(inner_items[0]) {
        SExp::Pair(..) => true,
        SExp::Atom => clvm::atom(&a, inner_items[0]).is_some_and(|bytes| !bytes.is_empty()),
    };

    let mut consumed = Vec::new();
    for item in clvm::list_items(&a, inner_items[1]) {
        let SExp::Pair(chain_node, nonce_node) = a.sexp(item) else {
            return Err(inconsistent("consumed entry is not a pair".to_string()));
        };
        let chain_bytes = clvm::atom(&a, chain_node)
            .ok_or_else(|| inconsistent("consumed chain is not an atom".to_string()))?;
        let consumed_chain = ChainTag::try_from(chain_bytes.as_slice())
            .map_err(|e| inconsistent(e.to_string()))?;
        let nonce_bytes = clvm::atom(&a, nonce_node)
            .ok_or_else(|| inconsistent("consumed nonce is not an atom".to_string()))?;
        let nonce_int = clvm::int_from_atom(&nonce_bytes)
            .ok_or_else(|| inconsistent("consumed nonce does not fit in 64 bits".to_string()))?;
        consumed.push(ConsumedNonce {
            chain: consumed_chain,
            nonce: normalize_word(&nonce_bytes),
            nonce_int,
        });
    }

    Ok(PortalAdvance {
        child_coin_id,
        consumed,
        rotated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, int_to_nonce};
    use alloy_primitives::Bytes;
    use clvmr::serde::node_to_bytes;

    fn xch() -> ChainTag {
        "xch".parse().unwrap()
    }

    fn eth() -> ChainTag {
        "eth".parse().unwrap()
    }

    /// Builds a portal spend whose puzzle is `(q . conditions)` so running it
    /// yields the given conditions, and whose solution is a singleton
    /// solution carrying the given inner solution.
    fn portal_spend(
        parent: B256,
        child_puzzle_hash: B256,
        child_amount: u64,
        update_package: Option<(&[u8], &[u8])>,
        consumed: &[(ChainTag, u64)],
    ) -> CoinSpend {
        let mut a = Allocator::new();

        let op = clvm::build_atom(&mut a, &clvm::int_to_atom(clvm::CREATE_COIN)).unwrap();
        let ph = clvm::build_atom(&mut a, child_puzzle_hash.as_slice()).unwrap();
        let amount = clvm::build_atom(&mut a, &clvm::int_to_atom(child_amount)).unwrap();
        let condition = clvm::build_list(&mut a, &[op, ph, amount]).unwrap();
        let conditions = clvm::build_list(&mut a, &[condition]).unwrap();
        let quote = clvm::build_atom(&mut a, &[1]).unwrap();
        let puzzle = a.new_pair(quote, conditions).unwrap();

        let update = match update_package {
            Some((reveal, sol)) => {
                let reveal = clvm::build_atom(&mut a, reveal).unwrap();
                let sol = clvm::build_atom(&mut a, sol).unwrap();
                a.new_pair(reveal, sol).unwrap()
            }
            None => a.nil(),
        };
        let mut pairs = Vec::new();
        for (chain, nonce) in consumed {
            let chain_atom = clvm::build_atom(&mut a, chain.as_bytes()).unwrap();
            let nonce_atom = clvm::build_atom(&mut a, &clvm::int_to_atom(*nonce)).unwrap();
            pairs.push(a.new_pair(chain_atom, nonce_atom).unwrap());
        }
        let consumed_list = clvm::build_list(&mut a, &pairs).unwrap();
        let extra = a.nil();
        let inner = clvm::build_list(&mut a, &[update, consumed_list, extra]).unwrap();

        let lineage = clvm::build_atom(&mut a, &[0]).unwrap();
        let my_amount = clvm::build_atom(&mut a, &clvm::int_to_atom(1)).unwrap();
        let solution = clvm::build_list(&mut a, &[lineage, my_amount, inner]).unwrap();

        CoinSpend {
            coin: super::super::rpc::Coin {
                parent_coin_info: B256::repeat_byte(0xee),
                puzzle_hash: B256::repeat_byte(0xef),
                amount: 1,
            },
            puzzle_reveal: Bytes::from(node_to_bytes(&a, puzzle).unwrap()),
            solution: Bytes::from(node_to_bytes(&a, solution).unwrap()),
        }
    }

    #[test]
    fn parses_consumed_nonces_and_child() {
        let parent = B256::repeat_byte(0x11);
        let child_ph = B256::repeat_byte(0x22);
        let spend = portal_spend(parent, child_ph, 1, None, &[(eth(), 7), (eth(), 8)]);

        let advance = parse_portal_spend(xch(), &spend, parent).unwrap();
        assert_eq!(advance.child_coin_id, clvm::coin_id(&parent, &child_ph, 1));
        assert!(!advance.rotated);
        assert_eq!(
            advance.consumed,
            vec![
                ConsumedNonce {
                    chain: eth(),
                    nonce: int_to_nonce(7),
                    nonce_int: 7,
                },
                ConsumedNonce {
                    chain: eth(),
                    nonce: int_to_nonce(8),
                    nonce_int: 8,
                },
            ]
        );
    }

    #[test]
    fn rotation_with_empty_consumed_list_is_valid() {
        let parent = B256::repeat_byte(0x11);
        let spend = portal_spend(
            parent,
            B256::repeat_byte(0x22),
            1,
            Some((b"reveal", b"solution")),
            &[],
        );
        let advance = parse_portal_spend(xch(), &spend, parent).unwrap();
        assert!(advance.rotated);
        assert!(advance.consumed.is_empty());
    }

    #[test]
    fn missing_singleton_child_is_fatal() {
        let parent = B256::repeat_byte(0x11);
        // Even amount: no singleton child in the spend.
        let spend = portal_spend(parent, B256::repeat_byte(0x22), 2, None, &[]);
        assert!(matches!(
            parse_portal_spend(xch(), &spend, parent),
            Err(FollowerError::Inconsistent { .. })
        ));
    }

    fn tracker(store: Store) -> PortalTracker {
        PortalTracker::new(
            xch(),
            B256::repeat_byte(0x77),
            Arc::new(FullNodeClient::new("http://localhost:5000".parse().unwrap())),
            store,
            Arc::new(PortalCell::new()),
        )
    }

    #[tokio::test]
    async fn mark_used_is_terminal_and_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let message = Message {
            nonce: int_to_nonce(7),
            source_chain: eth(),
            source: B256::repeat_byte(1),
            destination_chain: xch(),
            destination: B256::repeat_byte(2),
            contents: vec![B256::repeat_byte(3)],
            block_number: 10,
            sig: "r1abc-c1def-s1ghi".to_string(),
        };
        store.put_message(&message).await.unwrap();

        let tracker = tracker(store.clone());
        tracker.mark_used(eth(), &message.nonce).await.unwrap();
        let loaded = store
            .get_message(eth(), &message.nonce)
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.is_used());

        // Second call must not un-use or otherwise disturb the row.
        tracker.mark_used(eth(), &message.nonce).await.unwrap();
        let loaded = store
            .get_message(eth(), &message.nonce)
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.is_used());
    }

    #[tokio::test]
    async fn portal_cell_polarity() {
        let cell = PortalCell::new();
        assert!(cell.syncing());
        cell.mark_synced();
        assert!(!cell.syncing());

        cell.set_coin(B256::repeat_byte(5));
        assert_eq!(cell.wait_for_coin().await, B256::repeat_byte(5));
    }
}
