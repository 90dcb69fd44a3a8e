//! Compact encoding of the `(source_chain, nonce)` pairs the portal has
//! consumed.
//!
//! Each chain entry is `(chain, floor, explicit…)` with the invariant that
//! every nonce in `1..=floor` is used, plus each explicit nonce above the
//! floor. Inserting the nonce right above the floor absorbs it (and any now
//! contiguous explicit nonces) into the floor, keeping the encoding small for
//! the common in-order case.

use serde::{Deserialize, Serialize};

use crate::message::ChainTag;

/// Per-chain run-length entry.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct UsedSetEntry {
    pub chain: ChainTag,
    /// All nonces `1..=floor` are consumed.
    pub floor: u64,
    /// Consumed nonces above the floor, sorted ascending.
    pub explicit: Vec<u64>,
}

/// The consumed-nonce set carried by each portal state.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UsedSet {
    entries: Vec<UsedSetEntry>,
}

/// Error returned when an insertion violates the set's invariants.
#[derive(Debug, thiserror::Error)]
#[error("nonce {nonce} for chain {chain} is already in the used set")]
pub struct AlreadyUsed {
    pub chain: ChainTag,
    pub nonce: u64,
}

impl UsedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff `(chain, nonce)` has been consumed.
    pub fn contains(&self, chain: ChainTag, nonce: u64) -> bool {
        match self.entries.iter().find(|e| e.chain == chain) {
            Some(entry) => nonce <= entry.floor || entry.explicit.binary_search(&nonce).is_ok(),
            None => false,
        }
    }

    /// Records `(chain, nonce)` as consumed, compacting contiguous runs into
    /// the floor.
    pub fn insert(&mut self, chain: ChainTag, nonce: u64) -> Result<(), AlreadyUsed> {
        let entry = match self.entries.iter_mut().find(|e| e.chain == chain) {
            Some(entry) => entry,
            None => {
                self.entries.push(if nonce == 1 {
                    UsedSetEntry {
                        chain,
                        floor: 1,
                        explicit: Vec::new(),
                    }
                } else {
                    UsedSetEntry {
                        chain,
                        floor: 0,
                        explicit: vec![nonce],
                    }
                });
                return Ok(());
            }
        };

        if nonce <= entry.floor || entry.explicit.contains(&nonce) {
            return Err(AlreadyUsed { chain, nonce });
        }

        entry.explicit.push(nonce);
        entry.explicit.sort_unstable();
        while entry
            .explicit
            .first()
            .is_some_and(|first| entry.floor + 1 == *first)
        {
            entry.floor = entry.explicit.remove(0);
        }
        Ok(())
    }

    pub fn entries(&self) -> &[UsedSetEntry] {
        &self.entries
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("used set serializes")
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth() -> ChainTag {
        "eth".parse().unwrap()
    }

    #[test]
    fn out_of_order_insertions_compact() {
        let mut set = UsedSet::new();
        for nonce in [1, 2, 3, 5, 4, 7] {
            set.insert(eth(), nonce).unwrap();
        }
        let entry = &set.entries()[0];
        assert_eq!(entry.floor, 5);
        assert_eq!(entry.explicit, vec![7]);

        for nonce in [1, 2, 3, 4, 5, 7] {
            assert!(set.contains(eth(), nonce));
        }
        assert!(!set.contains(eth(), 6));
        assert!(!set.contains(eth(), 8));
    }

    #[test]
    fn first_nonce_of_one_starts_the_floor() {
        let mut set = UsedSet::new();
        set.insert(eth(), 1).unwrap();
        let entry = &set.entries()[0];
        assert_eq!(entry.floor, 1);
        assert!(entry.explicit.is_empty());
    }

    #[test]
    fn first_nonce_above_one_stays_explicit() {
        let mut set = UsedSet::new();
        set.insert(eth(), 4).unwrap();
        let entry = &set.entries()[0];
        assert_eq!(entry.floor, 0);
        assert_eq!(entry.explicit, vec![4]);
        assert!(!set.contains(eth(), 1));
        assert!(set.contains(eth(), 4));
    }

    #[test]
    fn duplicate_insertion_is_rejected() {
        let mut set = UsedSet::new();
        set.insert(eth(), 1).unwrap();
        set.insert(eth(), 3).unwrap();
        assert!(set.insert(eth(), 1).is_err());
        assert!(set.insert(eth(), 3).is_err());
    }

    #[test]
    fn chains_are_independent() {
        let bse: ChainTag = "bse".parse().unwrap();
        let mut set = UsedSet::new();
        set.insert(eth(), 1).unwrap();
        set.insert(bse, 2).unwrap();
        assert!(set.contains(eth(), 1));
        assert!(!set.contains(bse, 1));
        assert!(set.contains(bse, 2));
    }

    #[test]
    fn membership_matches_inserted_pairs() {
        let mut set = UsedSet::new();
        let inserted = [3u64, 1, 9, 2, 4, 8];
        for nonce in inserted {
            set.insert(eth(), nonce).unwrap();
        }
        for nonce in 1..=12 {
            assert_eq!(set.contains(eth(), nonce), inserted.contains(&nonce));
        }
    }

    #[test]
    fn serialization_round_trips() {
        let mut set = UsedSet::new();
        set.insert(eth(), 1).unwrap();
        set.insert(eth(), 5).unwrap();
        let restored = UsedSet::from_bytes(&set.to_bytes()).unwrap();
        assert_eq!(restored, set);
    }
}
