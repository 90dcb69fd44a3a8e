//! Durable state: messages, portal lineage, and the portal tip cache.
//!
//! The store owns all records. Followers write messages for their own source
//! chain and signatures for their own destination chain; the portal tracker
//! is the sole writer of portal states. Multi-row mutations commit inside a
//! single transaction.

use std::path::Path;

use alloy_primitives::B256;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::message::{ChainTag, Message, join_contents, split_contents};
use crate::used_set::UsedSet;

/// One node of the portal singleton lineage.
///
/// Exactly one row per chain with a non-null height is the current tip; a
/// null height marks a provisional or rolled-back state.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PortalState {
    pub chain: ChainTag,
    pub coin_id: B256,
    pub parent_id: B256,
    pub used: UsedSet,
    pub confirmed_block_height: Option<u64>,
}

/// Store failures. All are fatal to the task that hits them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the database at `path` and runs the schema
    /// migration.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                nonce BLOB NOT NULL,
                source_chain BLOB NOT NULL,
                source BLOB NOT NULL,
                destination_chain BLOB NOT NULL,
                destination BLOB NOT NULL,
                contents BLOB NOT NULL,
                block_number INTEGER NOT NULL,
                sig TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (source_chain, nonce)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS portal_states (
                chain_id BLOB NOT NULL,
                coin_id BLOB NOT NULL,
                parent_id BLOB NOT NULL,
                used_chains_and_nonces BLOB NOT NULL,
                confirmed_block_height INTEGER,
                PRIMARY KEY (chain_id, coin_id)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS latest_portal_coin (
                chain_id BLOB PRIMARY KEY,
                coin_id BLOB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn put_message(&self, message: &Message) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO messages
                (nonce, source_chain, source, destination_chain, destination,
                 contents, block_number, sig)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.nonce.to_vec())
        .bind(message.source_chain.as_bytes().to_vec())
        .bind(message.source.to_vec())
        .bind(message.destination_chain.as_bytes().to_vec())
        .bind(message.destination.to_vec())
        .bind(join_contents(&message.contents))
        .bind(message.block_number as i64)
        .bind(message.sig.clone())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_message(
        &self,
        source_chain: ChainTag,
        nonce: &B256,
    ) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query("SELECT * FROM messages WHERE source_chain = ? AND nonce = ?")
            .bind(source_chain.as_bytes().to_vec())
            .bind(nonce.to_vec())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_message).transpose()
    }

    /// The message with the highest nonce for a source chain.
    pub async fn latest_message(
        &self,
        source_chain: ChainTag,
    ) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM messages WHERE source_chain = ? ORDER BY nonce DESC LIMIT 1",
        )
        .bind(source_chain.as_bytes().to_vec())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_message).transpose()
    }

    /// Highest confirmation height among persisted messages of a source
    /// chain, used as a scan resume point.
    pub async fn highest_block_number(
        &self,
        source_chain: ChainTag,
    ) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT MAX(block_number) FROM messages WHERE source_chain = ?")
            .bind(source_chain.as_bytes().to_vec())
            .fetch_one(&self.pool)
            .await?;
        let max: Option<i64> = row.try_get(0)?;
        Ok(max.map(|h| h as u64))
    }

    pub async fn unsigned_for_destination(
        &self,
        destination_chain: ChainTag,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE destination_chain = ? AND sig = '' ORDER BY nonce",
        )
        .bind(destination_chain.as_bytes().to_vec())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_message).collect()
    }

    /// Messages for a destination chain that carry a real signature (neither
    /// unsigned nor `used`); candidates for rebinding after a portal advance.
    pub async fn signed_for_destination(
        &self,
        destination_chain: ChainTag,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE destination_chain = ? AND sig != '' AND sig != 'used'
             ORDER BY nonce",
        )
        .bind(destination_chain.as_bytes().to_vec())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_message).collect()
    }

    pub async fn set_signature(
        &self,
        source_chain: ChainTag,
        nonce: &B256,
        sig: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE messages SET sig = ? WHERE source_chain = ? AND nonce = ?")
            .bind(sig.to_string())
            .bind(source_chain.as_bytes().to_vec())
            .bind(nonce.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn put_portal_state(&self, state: &PortalState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO portal_states
                (chain_id, coin_id, parent_id, used_chains_and_nonces, confirmed_block_height)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(state.chain.as_bytes().to_vec())
        .bind(state.coin_id.to_vec())
        .bind(state.parent_id.to_vec())
        .bind(state.used.to_bytes())
        .bind(state.confirmed_block_height.map(|h| h as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn portal_state(
        &self,
        chain: ChainTag,
        coin_id: &B256,
    ) -> Result<Option<PortalState>, StoreError> {
        let row = sqlx::query("SELECT * FROM portal_states WHERE chain_id = ? AND coin_id = ?")
            .bind(chain.as_bytes().to_vec())
            .bind(coin_id.to_vec())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_portal_state).transpose()
    }

    /// The current tip: the confirmed portal state at the greatest height.
    pub async fn portal_tip(&self, chain: ChainTag) -> Result<Option<PortalState>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM portal_states
             WHERE chain_id = ? AND confirmed_block_height IS NOT NULL
             ORDER BY confirmed_block_height DESC LIMIT 1",
        )
        .bind(chain.as_bytes().to_vec())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_portal_state).transpose()
    }

    /// Reorg helper: marks every state at or above `height` provisional.
    pub async fn null_portal_heights_at_or_above(
        &self,
        chain: ChainTag,
        height: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE portal_states SET confirmed_block_height = NULL
             WHERE chain_id = ? AND confirmed_block_height >= ?",
        )
        .bind(chain.as_bytes().to_vec())
        .bind(height as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a portal spend atomically: persists the child state, drops
    /// abandoned sibling children of the same parent, and advances the tip
    /// cache.
    pub async fn record_portal_spend(&self, state: &PortalState) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO portal_states
                (chain_id, coin_id, parent_id, used_chains_and_nonces, confirmed_block_height)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(state.chain.as_bytes().to_vec())
        .bind(state.coin_id.to_vec())
        .bind(state.parent_id.to_vec())
        .bind(state.used.to_bytes())
        .bind(state.confirmed_block_height.map(|h| h as i64))
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM portal_states WHERE chain_id = ? AND parent_id = ? AND coin_id != ?",
        )
        .bind(state.chain.as_bytes().to_vec())
        .bind(state.parent_id.to_vec())
        .bind(state.coin_id.to_vec())
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT OR REPLACE INTO latest_portal_coin (chain_id, coin_id) VALUES (?, ?)")
            .bind(state.chain.as_bytes().to_vec())
            .bind(state.coin_id.to_vec())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn persist_last_portal_coin_id(
        &self,
        chain: ChainTag,
        coin_id: &B256,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO latest_portal_coin (chain_id, coin_id) VALUES (?, ?)")
            .bind(chain.as_bytes().to_vec())
            .bind(coin_id.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_last_portal_coin_id(
        &self,
        chain: ChainTag,
    ) -> Result<Option<B256>, StoreError> {
        let row = sqlx::query("SELECT coin_id FROM latest_portal_coin WHERE chain_id = ?")
            .bind(chain.as_bytes().to_vec())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let raw: Vec<u8> = row.try_get("coin_id")?;
            b256_from(&raw, "latest_portal_coin.coin_id")
        })
        .transpose()
    }
}

fn b256_from(raw: &[u8], what: &str) -> Result<B256, StoreError> {
    if raw.len() != 32 {
        return Err(StoreError::Corrupt(format!(
            "{what}: expected 32 bytes, got {}",
            raw.len()
        )));
    }
    Ok(B256::from_slice(raw))
}

fn tag_from(raw: &[u8], what: &str) -> Result<ChainTag, StoreError> {
    ChainTag::try_from(raw).map_err(|e| StoreError::Corrupt(format!("{what}: {e}")))
}

fn row_to_message(row: SqliteRow) -> Result<Message, StoreError> {
    let nonce: Vec<u8> = row.try_get("nonce")?;
    let source_chain: Vec<u8> = row.try_get("source_chain")?;
    let source: Vec<u8> = row.try_get("source")?;
    let destination_chain: Vec<u8> = row.try_get("destination_chain")?;
    let destination: Vec<u8> = row.try_get("destination")?;
    let contents: Vec<u8> = row.try_get("contents")?;
    let block_number: i64 = row.try_get("block_number")?;
    let sig: String = row.try_get("sig")?;
    Ok(Message {
        nonce: b256_from(&nonce, "messages.nonce")?,
        source_chain: tag_from(&source_chain, "messages.source_chain")?,
        source: b256_from(&source, "messages.source")?,
        destination_chain: tag_from(&destination_chain, "messages.destination_chain")?,
        destination: b256_from(&destination, "messages.destination")?,
        contents: split_contents(&contents)
            .map_err(|e| StoreError::Corrupt(format!("messages.contents: {e}")))?,
        block_number: block_number as u64,
        sig,
    })
}

fn row_to_portal_state(row: SqliteRow) -> Result<PortalState, StoreError> {
    let chain: Vec<u8> = row.try_get("chain_id")?;
    let coin_id: Vec<u8> = row.try_get("coin_id")?;
    let parent_id: Vec<u8> = row.try_get("parent_id")?;
    let used: Vec<u8> = row.try_get("used_chains_and_nonces")?;
    let height: Option<i64> = row.try_get("confirmed_block_height")?;
    Ok(PortalState {
        chain: tag_from(&chain, "portal_states.chain_id")?,
        coin_id: b256_from(&coin_id, "portal_states.coin_id")?,
        parent_id: b256_from(&parent_id, "portal_states.parent_id")?,
        used: UsedSet::from_bytes(&used)
            .map_err(|e| StoreError::Corrupt(format!("portal_states.used: {e}")))?,
        confirmed_block_height: height.map(|h| h as u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SIG_USED, int_to_nonce};

    fn message(nonce: u64) -> Message {
        Message {
            nonce: int_to_nonce(nonce),
            source_chain: "eth".parse().unwrap(),
            source: B256::repeat_byte(0xaa),
            destination_chain: "xch".parse().unwrap(),
            destination: B256::repeat_byte(0xbb),
            contents: vec![B256::repeat_byte(1), B256::repeat_byte(2)],
            block_number: 100 + nonce,
            sig: String::new(),
        }
    }

    #[tokio::test]
    async fn message_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let m = message(1);
        store.put_message(&m).await.unwrap();
        let loaded = store
            .get_message(m.source_chain, &m.nonce)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, m);
    }

    #[tokio::test]
    async fn one_row_per_identity() {
        let store = Store::open_in_memory().await.unwrap();
        let mut m = message(1);
        store.put_message(&m).await.unwrap();
        m.block_number = 999;
        store.put_message(&m).await.unwrap();
        let latest = store.latest_message(m.source_chain).await.unwrap().unwrap();
        assert_eq!(latest.block_number, 999);
        assert_eq!(
            store.highest_block_number(m.source_chain).await.unwrap(),
            Some(999)
        );
    }

    #[tokio::test]
    async fn latest_message_orders_by_nonce() {
        let store = Store::open_in_memory().await.unwrap();
        for nonce in [1, 3, 2] {
            store.put_message(&message(nonce)).await.unwrap();
        }
        let latest = store
            .latest_message("eth".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.nonce_int(), Some(3));
    }

    #[tokio::test]
    async fn signature_lifecycle() {
        let store = Store::open_in_memory().await.unwrap();
        let m = message(1);
        let xch: ChainTag = "xch".parse().unwrap();
        store.put_message(&m).await.unwrap();

        assert_eq!(store.unsigned_for_destination(xch).await.unwrap().len(), 1);
        store
            .set_signature(m.source_chain, &m.nonce, "r1abc-c1def-s1ghi")
            .await
            .unwrap();
        assert!(store.unsigned_for_destination(xch).await.unwrap().is_empty());
        assert_eq!(store.signed_for_destination(xch).await.unwrap().len(), 1);

        store
            .set_signature(m.source_chain, &m.nonce, SIG_USED)
            .await
            .unwrap();
        assert!(store.signed_for_destination(xch).await.unwrap().is_empty());
        let loaded = store
            .get_message(m.source_chain, &m.nonce)
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.is_used());
    }

    #[tokio::test]
    async fn portal_tip_tracks_confirmed_heights() {
        let store = Store::open_in_memory().await.unwrap();
        let xch: ChainTag = "xch".parse().unwrap();
        let mut used = UsedSet::new();
        used.insert("eth".parse().unwrap(), 1).unwrap();

        let first = PortalState {
            chain: xch,
            coin_id: B256::repeat_byte(1),
            parent_id: B256::repeat_byte(0),
            used: UsedSet::new(),
            confirmed_block_height: Some(10),
        };
        let second = PortalState {
            chain: xch,
            coin_id: B256::repeat_byte(2),
            parent_id: B256::repeat_byte(1),
            used,
            confirmed_block_height: Some(20),
        };
        store.put_portal_state(&first).await.unwrap();
        store.record_portal_spend(&second).await.unwrap();

        let tip = store.portal_tip(xch).await.unwrap().unwrap();
        assert_eq!(tip.coin_id, second.coin_id);
        assert_eq!(
            store.load_last_portal_coin_id(xch).await.unwrap(),
            Some(second.coin_id)
        );

        store.null_portal_heights_at_or_above(xch, 20).await.unwrap();
        let tip = store.portal_tip(xch).await.unwrap().unwrap();
        assert_eq!(tip.coin_id, first.coin_id);
    }

    #[tokio::test]
    async fn record_portal_spend_drops_abandoned_siblings() {
        let store = Store::open_in_memory().await.unwrap();
        let xch: ChainTag = "xch".parse().unwrap();
        let parent = B256::repeat_byte(1);
        let stale = PortalState {
            chain: xch,
            coin_id: B256::repeat_byte(2),
            parent_id: parent,
            used: UsedSet::new(),
            confirmed_block_height: None,
        };
        store.put_portal_state(&stale).await.unwrap();

        let winner = PortalState {
            chain: xch,
            coin_id: B256::repeat_byte(3),
            parent_id: parent,
            used: UsedSet::new(),
            confirmed_block_height: Some(30),
        };
        store.record_portal_spend(&winner).await.unwrap();

        assert!(
            store
                .portal_state(xch, &stale.coin_id)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .portal_state(xch, &winner.coin_id)
                .await
                .unwrap()
                .is_some()
        );
    }
}
