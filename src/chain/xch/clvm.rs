//! CLVM plumbing: running spend programs, walking condition lists, tree
//! hashing, and the integer/coin-id encodings the chain derives identities
//! from.

use alloy_primitives::B256;
use clvmr::allocator::SExp;
use clvmr::reduction::Reduction;
use clvmr::serde::node_from_bytes;
use clvmr::{Allocator, ChiaDialect, NodePtr, run_program};
use sha2::{Digest, Sha256};

/// Condition opcode creating a child coin.
pub const CREATE_COIN: u64 = 51;

/// Execution cost limit for a single spend program.
const MAX_COST: u64 = 11_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum ClvmError {
    #[error("undeserializable program: {0}")]
    Serde(String),
    #[error("program evaluation failed: {0}")]
    Eval(String),
    #[error("malformed condition: {0}")]
    Condition(String),
    #[error("allocator exhausted: {0}")]
    Alloc(String),
}

/// Deserializes a CLVM program.
pub fn parse(a: &mut Allocator, bytes: &[u8]) -> Result<NodePtr, ClvmError> {
    node_from_bytes(a, bytes).map_err(|e| ClvmError::Serde(e.to_string()))
}

/// Runs a puzzle against its solution and returns the emitted conditions.
pub fn run(a: &mut Allocator, puzzle: NodePtr, solution: NodePtr) -> Result<NodePtr, ClvmError> {
    let dialect = ChiaDialect::new(0);
    let Reduction(_cost, output) = run_program(a, &dialect, puzzle, solution, MAX_COST)
        .map_err(|e| ClvmError::Eval(format!("{e:?}")))?;
    Ok(output)
}

/// Walks a proper list, collecting its items. Stops at the first non-pair.
pub fn list_items(a: &Allocator, mut node: NodePtr) -> Vec<NodePtr> {
    let mut items = Vec::new();
    while let SExp::Pair(first, rest) = a.sexp(node) {
        items.push(first);
        node = rest;
    }
    items
}

/// The node's atom bytes, or `None` if it is a pair.
pub fn atom(a: &Allocator, node: NodePtr) -> Option<Vec<u8>> {
    match a.sexp(node) {
        SExp::Atom => Some(a.atom(node).as_ref().to_vec()),
        SExp::Pair(..) => None,
    }
}

/// Standard CLVM tree hash: `sha256(1 || atom)` for atoms,
/// `sha256(2 || hash(first) || hash(rest))` for pairs.
pub fn tree_hash(a: &Allocator, node: NodePtr) -> B256 {
    match a.sexp(node) {
        SExp::Atom => {
            let mut hasher = Sha256::new();
            hasher.update([1u8]);
            hasher.update(a.atom(node).as_ref());
            B256::from_slice(&hasher.finalize())
        }
        SExp::Pair(first, rest) => {
            let mut hasher = Sha256::new();
            hasher.update([2u8]);
            hasher.update(tree_hash(a, first).as_slice());
            hasher.update(tree_hash(a, rest).as_slice());
            B256::from_slice(&hasher.finalize())
        }
    }
}

/// Builds a proper list out of already-allocated nodes.
pub fn build_list(a: &mut Allocator, items: &[NodePtr]) -> Result<NodePtr, ClvmError> {
    let mut node = a.nil();
    for item in items.iter().rev() {
        node = a
            .new_pair(*item, node)
            .map_err(|e| ClvmError::Alloc(format!("{e:?}")))?;
    }
    Ok(node)
}

pub fn build_atom(a: &mut Allocator, bytes: &[u8]) -> Result<NodePtr, ClvmError> {
    a.new_atom(bytes)
        .map_err(|e| ClvmError::Alloc(format!("{e:?}")))
}

/// Interprets an atom as an unsigned big-endian integer. `None` if the value
/// does not fit in 64 bits or is negative.
pub fn int_from_atom(atom: &[u8]) -> Option<u64> {
    if atom.first().is_some_and(|b| b & 0x80 != 0) {
        return None;
    }
    let significant: Vec<u8> = atom.iter().copied().skip_while(|b| *b == 0).collect();
    if significant.len() > 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[8 - significant.len()..].copy_from_slice(&significant);
    Some(u64::from_be_bytes(buf))
}

/// Minimal signed big-endian encoding of a non-negative integer, as used for
/// amounts inside coin-id hashing. Zero encodes as the empty atom.
pub fn int_to_atom(value: u64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(7);
    let mut out = bytes[start..].to_vec();
    if out[0] & 0x80 != 0 {
        out.insert(0, 0);
    }
    out
}

/// A coin's identity: `sha256(parent_id || puzzle_hash || amount)` with the
/// amount in its canonical integer encoding.
pub fn coin_id(parent_id: &B256, puzzle_hash: &B256, amount: u64) -> B256 {
    let mut hasher = Sha256::new();
    hasher.update(parent_id.as_slice());
    hasher.update(puzzle_hash.as_slice());
    hasher.update(int_to_atom(amount));
    B256::from_slice(&hasher.finalize())
}

/// A `CREATE_COIN` condition extracted from a spend's output.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CreatedCoin {
    pub puzzle_hash: B256,
    pub amount: u64,
    /// Memo atoms attached as the condition's optional fourth argument.
    pub memos: Vec<Vec<u8>>,
}

/// Extracts every `CREATE_COIN` condition from a spend's output list.
pub fn created_coins(a: &Allocator, output: NodePtr) -> Result<Vec<CreatedCoin>, ClvmError> {
    let mut created = Vec::new();
    for condition in list_items(a, output) {
        let parts = list_items(a, condition);
        let Some(opcode) = parts
            .first()
            .and_then(|node| atom(a, *node))
            .as_deref()
            .and_then(int_from_atom)
        else {
            continue;
        };
        if opcode != CREATE_COIN {
            continue;
        }
        if parts.len() < 3 {
            return Err(ClvmError::Condition(
                "CREATE_COIN with fewer than two arguments".to_string(),
            ));
        }
        let puzzle_hash = atom(a, parts[1])
            .filter(|bytes| bytes.len() == 32)
            .ok_or_else(|| {
                ClvmError::Condition("CREATE_COIN puzzle hash is not 32 bytes".to_string())
            })?;
        let amount = atom(a, parts[2])
            .as_deref()
            .and_then(int_from_atom)
            .ok_or_else(|| {
                ClvmError::Condition("CREATE_COIN amount is not an integer".to_string())
            })?;
        let memos = match parts.get(3) {
            Some(memo_list) => list_items(a, *memo_list)
                .into_iter()
                .map(|node| {
                    atom(a, node).ok_or_else(|| {
                        ClvmError::Condition("CREATE_COIN memo is not an atom".to_string())
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        created.push(CreatedCoin {
            puzzle_hash: B256::from_slice(&puzzle_hash),
            amount,
            memos,
        });
    }
    Ok(created)
}
