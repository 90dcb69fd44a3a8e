//! Signature broadcast over nostr relays.
//!
//! Signers enqueue encoded signature strings; a single publisher task drains
//! the queue and fans each signature out to a short-lived worker. Workers
//! append to the local log first, skip signatures a relay already holds, and
//! retry failed publications a bounded number of times before dropping.

pub mod nostr;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use url::Url;

use crate::relay::nostr::{RelayClient, RelayKeys};

/// Queue capacity. Orders of magnitude above any sustainable signing rate;
/// overflow logs and drops rather than blocking a signer.
const QUEUE_CAPACITY: usize = 65_536;

/// Maximum concurrent publish workers per drain round.
const MAX_WORKERS: usize = 64;

const PUBLISH_ATTEMPTS: u32 = 3;
const PUBLISH_BACKOFF: Duration = Duration::from_secs(3);

/// Cheap cloneable handle used by signers to enqueue signatures.
#[derive(Clone)]
pub struct Broadcaster {
    tx: mpsc::Sender<String>,
}

impl Broadcaster {
    /// Enqueues a signature for publication. Never blocks.
    pub fn add_signature(&self, sig: &str) {
        if self.tx.try_send(sig.to_string()).is_err() {
            tracing::error!(sig, "publisher queue full; dropping signature");
        }
    }
}

struct Shared {
    relays: Vec<Url>,
    keys: RelayKeys,
    log_path: PathBuf,
}

/// The long-running publisher task owning the queue's receive side.
pub struct BroadcasterTask {
    rx: mpsc::Receiver<String>,
    shared: Arc<Shared>,
}

/// Creates the publisher pair: the enqueue handle and the task to spawn.
pub fn broadcaster(
    relays: Vec<Url>,
    keys: RelayKeys,
    log_path: PathBuf,
) -> (Broadcaster, BroadcasterTask) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    (
        Broadcaster { tx },
        BroadcasterTask {
            rx,
            shared: Arc::new(Shared {
                relays,
                keys,
                log_path,
            }),
        },
    )
}

impl BroadcasterTask {
    pub async fn run(mut self) {
        loop {
            let Some(first) = self.rx.recv().await else {
                // All senders dropped; process is shutting down.
                return;
            };
            let mut batch = vec![first];
            while batch.len() < MAX_WORKERS {
                match self.rx.try_recv() {
                    Ok(sig) => batch.push(sig),
                    Err(_) => break,
                }
            }

            let workers: Vec<_> = batch
                .into_iter()
                .map(|sig| tokio::spawn(send_signature(self.shared.clone(), sig)))
                .collect();
            for worker in workers {
                let _ = worker.await;
            }

            sleep(Duration::from_secs(1)).await;
        }
    }
}

async fn send_signature(shared: Arc<Shared>, sig: String) {
    // Local log before any network attempt.
    if let Err(e) = append_to_log(&shared.log_path, &sig).await {
        tracing::error!(error = %e, path = %shared.log_path.display(), "could not append to signature log");
    }

    let parts: Vec<&str> = sig.split('-').collect();
    let [route_data, coin_data, sig_data] = parts.as_slice() else {
        tracing::error!(sig, "malformed signature string reached the publisher; dropping");
        return;
    };

    for attempt in 1..=PUBLISH_ATTEMPTS {
        match publish_once(&shared, route_data, coin_data, sig_data).await {
            Ok(()) => return,
            Err(e) if attempt < PUBLISH_ATTEMPTS => {
                tracing::error!(error = %e, attempt, "failed to send signature to relays; retrying in 3s");
                sleep(PUBLISH_BACKOFF).await;
            }
            Err(e) => {
                tracing::error!(error = %e, sig, "failed to send signature to relays; giving up");
            }
        }
    }
}

async fn publish_once(
    shared: &Shared,
    route_data: &str,
    coin_data: &str,
    sig_data: &str,
) -> Result<(), nostr::RelayError> {
    let author = shared.keys.public_key_hex();

    // Skip publication if any relay already has this exact signature from us.
    for url in &shared.relays {
        let client = RelayClient::new(url.clone());
        match client.events_by_route(&author, route_data, coin_data).await {
            Ok(events) => {
                if events.iter().any(|e| e.content.contains(sig_data)) {
                    tracing::info!(
                        relay = %url,
                        route = route_data,
                        "signature already on relay; only logged locally"
                    );
                    return Ok(());
                }
            }
            Err(e) => {
                tracing::info!(relay = %url, error = %e, "could not check for existing signature; sending anyway");
            }
        }
    }

    let event = shared.keys.text_note(
        sig_data,
        vec![
            vec!["r".to_string(), route_data.to_string()],
            vec!["c".to_string(), coin_data.to_string()],
        ],
    )?;

    let mut delivered = false;
    let mut last_error = None;
    for url in &shared.relays {
        let client = RelayClient::new(url.clone());
        match client.publish(&event).await {
            Ok(()) => {
                tracing::info!(relay = %url, event_id = %event.id, "sent signature event");
                delivered = true;
            }
            Err(e) => {
                tracing::error!(relay = %url, error = %e, "relay publish failed");
                last_error = Some(e);
            }
        }
    }
    if delivered {
        Ok(())
    } else {
        Err(last_error.unwrap_or(nostr::RelayError::Closed))
    }
}

async fn append_to_log(path: &PathBuf, sig: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{sig}\n").as_bytes()).await?;
    file.flush().await
}
