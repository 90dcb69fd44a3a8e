//! The `listen` command: construct every configured follower, wait for the
//! nodes to come up, then run all tasks on one cooperative runtime and
//! supervise them.
//!
//! There is no in-process restart policy: any task failing is fatal and the
//! operator's supervisor restarts the whole process against the persisted
//! state.

use std::sync::Arc;

use futures_util::future::select_all;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::chain::evm::EvmFollower;
use crate::chain::xch::XchFollower;
use crate::chain::{ChainFollower, FollowerError};
use crate::config::{ChainConfig, Config};
use crate::relay::nostr::RelayKeys;
use crate::store::Store;

/// Returns a token that trips on any shutdown signal.
fn shutdown_token() -> Result<CancellationToken, std::io::Error> {
    let mut streams = [SignalKind::terminate(), SignalKind::interrupt()]
        .into_iter()
        .map(signal)
        .collect::<Result<Vec<_>, _>>()?;
    let token = CancellationToken::new();
    let trip = token.clone();
    tokio::spawn(async move {
        let pending = streams.iter_mut().map(|stream| Box::pin(stream.recv()));
        select_all(pending).await;
        trip.cancel();
    });
    Ok(token)
}

pub async fn listen(
    config: Config,
    log_startup_connection_errors: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize rustls crypto provider (ring); reqwest and the relay
    // websockets share it.
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .expect("Failed to initialize rustls crypto provider");

    let store = Store::open(&config.db_path).await?;
    let relay_keys = RelayKeys::from_mnemonic(config.nostr.my_mnemonic.inner())?;
    let (broadcaster, publisher) = crate::relay::broadcaster(
        config.nostr.relays.clone(),
        relay_keys,
        config.sig_log_path.clone(),
    );

    let mut followers: Vec<Arc<dyn ChainFollower>> = Vec::new();
    for (tag, chain) in config.chains.iter() {
        match chain {
            ChainConfig::Evm(evm) => {
                let signer = evm.signer(*tag)?;
                followers.push(Arc::new(EvmFollower::new(
                    *tag,
                    evm,
                    signer,
                    store.clone(),
                    broadcaster.clone(),
                )));
            }
            ChainConfig::Xch(xch) => {
                let hot_key = xch.hot_key(*tag)?;
                followers.push(Arc::new(XchFollower::new(
                    *tag,
                    xch,
                    hot_key,
                    store.clone(),
                    broadcaster.clone(),
                )));
            }
        }
    }
    if followers.is_empty() {
        return Err("no chains configured".into());
    }

    for follower in &followers {
        follower.wait_for_node(log_startup_connection_errors).await;
        tracing::info!(chain = %follower.chain(), "node reachable");
    }

    let cancellation_token = shutdown_token()?;

    let mut tasks: JoinSet<Result<(), FollowerError>> = JoinSet::new();
    tasks.spawn(async move {
        publisher.run().await;
        Ok(())
    });
    for follower in followers {
        follower.start(&mut tasks);
    }

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                tracing::info!("shutdown signal received");
                return Ok(());
            }
            joined = tasks.join_next() => {
                match joined {
                    // The publisher only returns once every sender is gone,
                    // which cannot happen while followers run.
                    Some(Ok(Ok(()))) => continue,
                    Some(Ok(Err(e))) => {
                        tracing::error!(error = %e, "task failed; exiting");
                        return Err(e.into());
                    }
                    Some(Err(join_error)) => {
                        tracing::error!(error = %join_error, "task panicked; exiting");
                        return Err(join_error.into());
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}
