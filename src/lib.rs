//! warp.green cross-chain message relay validator.
//!
//! The validator bridges messages between a coin/puzzle-model chain (the
//! X-chain) and EVM-compatible chains: it observes messages emitted on each
//! source chain, waits for enough confirmations, signs them under the
//! validator's hot key, and publishes the signatures over nostr relays so
//! anyone can aggregate a threshold of them into a settling transaction on
//! the destination chain. A portal singleton tracker follows the on-chain
//! portal coin, whose spends both finalize inbound deliveries (consuming
//! `(source_chain, nonce)` pairs) and rotate the validator key-set.
//!
//! # Modules
//!
//! - [`chain`] — per-chain followers: EVM log scanning + EIP-712 signing,
//!   X-chain coin scanning, portal tracking, and BLS signing.
//! - [`codec`] — the dash-separated bech32m signature wire format.
//! - [`config`] — `config.json` loading with environment indirection.
//! - [`message`] — core message and chain-tag types.
//! - [`proxy`] — plain-HTTP proxy in front of a TLS-authenticated full node.
//! - [`relay`] — nostr publisher: queueing, deduplication, broadcast.
//! - [`run`] — the `listen` orchestrator.
//! - [`store`] — SQLite persistence for messages and portal lineage.
//! - [`used_set`] — compact encoding of consumed nonces.

pub mod chain;
pub mod codec;
pub mod config;
pub mod message;
pub mod proxy;
pub mod relay;
pub mod run;
pub mod store;
pub mod telemetry;
pub mod used_set;
