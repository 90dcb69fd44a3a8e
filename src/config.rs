//! Configuration for the relay validator.
//!
//! Loaded from a JSON file (`config.json` by default) whose top level maps
//! three-letter chain tags to per-chain settings, plus a `nostr` section for
//! the publisher and an optional `proxy` section for the full-node proxy.
//! Secret-bearing fields accept `$VAR` / `${VAR}` environment references so
//! keys can stay out of the file.

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use alloy_primitives::{Address, B256, hex};
use alloy_signer_local::PrivateKeySigner;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::chain::xch::sign::HotKey;
use crate::message::ChainTag;

/// Configuration error types. All are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("chain {chain}: invalid hot key: {reason}")]
    HotKey { chain: ChainTag, reason: String },
    #[error("chain {chain}: hot key is not part of the configured validator set")]
    HotKeyNotInValidatorSet { chain: ChainTag },
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// SQLite database location.
    #[serde(default = "config_defaults::default_db_path")]
    pub db_path: PathBuf,
    /// Local append-only log of every signature handed to the publisher.
    #[serde(default = "config_defaults::default_sig_log_path")]
    pub sig_log_path: PathBuf,
    #[serde(default)]
    pub chains: ChainsConfig,
    pub nostr: NostrConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

mod config_defaults {
    use std::path::PathBuf;

    pub fn default_db_path() -> PathBuf {
        PathBuf::from("data.db")
    }

    pub fn default_sig_log_path() -> PathBuf {
        PathBuf::from("messages.txt")
    }
}

/// Publisher endpoints and identity.
#[derive(Debug, Clone, Deserialize)]
pub struct NostrConfig {
    pub relays: Vec<Url>,
    /// BIP-39 mnemonic the relay identity derives from.
    pub my_mnemonic: LiteralOrEnv<String>,
}

/// Settings for the `rpc-proxy` command, which fronts the
/// certificate-authenticated full node with a plain-HTTP endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: Url,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

// ============================================================================
// Environment variable resolution
// ============================================================================

/// A config value that may be given indirectly: a string of the form
/// `$NAME` or `${NAME}` is read from the named environment variable at load
/// time, anything else is taken literally. Keeps key material out of
/// `config.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn inner(&self) -> &T {
        &self.0
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The environment variable a raw config string refers to, if it does.
fn env_reference(raw: &str) -> Option<&str> {
    let name = raw.strip_prefix('$')?;
    let name = name
        .strip_prefix('{')
        .and_then(|braced| braced.strip_suffix('}'))
        .unwrap_or(name);
    let well_formed =
        !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    well_formed.then_some(name)
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let raw = String::deserialize(deserializer)?;
        let resolved = match env_reference(&raw) {
            Some(name) => std::env::var(name).map_err(|_| {
                D::Error::custom(format!(
                    "config value '{raw}' points at unset environment variable {name}"
                ))
            })?,
            None => raw,
        };
        resolved.parse::<T>().map(Self).map_err(D::Error::custom)
    }
}

// ============================================================================
// Key material
// ============================================================================

/// A validated E-chain hot private key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvmPrivateKey(B256);

impl EvmPrivateKey {
    pub fn signer(&self) -> Result<PrivateKeySigner, String> {
        PrivateKeySigner::from_bytes(&self.0).map_err(|e| e.to_string())
    }
}

impl FromStr for EvmPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(Self)
            .map_err(|e| format!("invalid evm private key: {}", e))
    }
}

/// A validated X-chain BLS hot private key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XchPrivateKey(B256);

impl XchPrivateKey {
    pub fn hot_key(&self) -> Result<HotKey, String> {
        HotKey::from_bytes(&self.0.0).map_err(|e| e.to_string())
    }
}

impl FromStr for XchPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(Self)
            .map_err(|e| format!("invalid bls private key: {}", e))
    }
}

/// A 48-byte compressed G1 public key, as carried in validator sets.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsPublicKey([u8; 48]);

impl BlsPublicKey {
    pub fn as_bytes(&self) -> &[u8; 48] {
        &self.0
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKey(0x{})", hex::encode(self.0))
    }
}

impl FromStr for BlsPublicKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| format!("invalid bls public key hex: {}", e))?;
        let bytes: [u8; 48] = raw
            .try_into()
            .map_err(|_| "bls public key must be 48 bytes".to_string())?;
        blst::min_pk::PublicKey::from_bytes(&bytes)
            .map_err(|e| format!("bls public key is not a valid G1 point: {e:?}"))?;
        Ok(Self(bytes))
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

// ============================================================================
// Chain configurations
// ============================================================================

/// Configuration specific to an EVM-compatible chain.
#[derive(Debug, Clone, Deserialize)]
pub struct EvmChainConfig {
    pub rpc_url: Url,
    /// Earliest block to scan.
    #[serde(default)]
    pub min_height: u64,
    /// Confirmation depth before signing.
    pub sign_min_height: u64,
    pub portal_address: Address,
    /// The validator set's signer addresses.
    #[serde(default)]
    pub hot_addresses: Vec<Address>,
    pub my_hot_private_key: LiteralOrEnv<EvmPrivateKey>,
    /// Present iff the chain is an OP-stack L2.
    #[serde(default)]
    pub l1_block_contract_address: Option<Address>,
}

impl EvmChainConfig {
    /// Builds the hot signer and checks it belongs to the validator set.
    pub fn signer(&self, chain: ChainTag) -> Result<PrivateKeySigner, ConfigError> {
        let signer = self
            .my_hot_private_key
            .signer()
            .map_err(|reason| ConfigError::HotKey { chain, reason })?;
        if !self.hot_addresses.is_empty() && !self.hot_addresses.contains(&signer.address()) {
            return Err(ConfigError::HotKeyNotInValidatorSet { chain });
        }
        Ok(signer)
    }
}

/// Configuration specific to the X-chain.
#[derive(Debug, Clone, Deserialize)]
pub struct XchChainConfig {
    pub rpc_url: Url,
    #[serde(default)]
    pub min_height: u64,
    pub sign_min_height: u64,
    /// 32-byte launcher coin id of the portal singleton.
    pub portal_launcher_id: B256,
    /// Puzzle identity bridging requests are paid to.
    pub bridging_puzzle_hash: B256,
    /// Minimum coin amount for a bridging request to be ingested.
    pub per_message_toll: u64,
    /// Chain-scoped BLS signing domain.
    pub agg_sig_data: B256,
    pub portal_threshold: u32,
    pub portal_keys: Vec<BlsPublicKey>,
    /// Cold rotation set; used by offline ceremonies, validated here only.
    #[serde(default)]
    pub multisig_threshold: u32,
    #[serde(default)]
    pub multisig_keys: Vec<BlsPublicKey>,
    pub my_hot_private_key: LiteralOrEnv<XchPrivateKey>,
}

impl XchChainConfig {
    /// Builds the hot key and checks it belongs to the validator set.
    pub fn hot_key(&self, chain: ChainTag) -> Result<HotKey, ConfigError> {
        let hot_key = self
            .my_hot_private_key
            .hot_key()
            .map_err(|reason| ConfigError::HotKey { chain, reason })?;
        let public = hot_key.public_bytes();
        if !self.portal_keys.is_empty()
            && !self.portal_keys.iter().any(|key| key.as_bytes() == &public)
        {
            return Err(ConfigError::HotKeyNotInValidatorSet { chain });
        }
        Ok(hot_key)
    }
}

/// One configured chain. The family is determined by which portal identity
/// the entry carries: `portal_address` (EVM) or `portal_launcher_id`
/// (X-chain).
#[derive(Debug, Clone)]
pub enum ChainConfig {
    Evm(Box<EvmChainConfig>),
    Xch(Box<XchChainConfig>),
}

/// All configured chains, keyed by chain tag.
#[derive(Debug, Clone, Default)]
pub struct ChainsConfig(pub Vec<(ChainTag, ChainConfig)>);

impl Deref for ChainsConfig {
    type Target = Vec<(ChainTag, ChainConfig)>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ChainsConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{MapAccess, Visitor};

        struct ChainsVisitor;

        impl<'de> Visitor<'de> for ChainsVisitor {
            type Value = ChainsConfig;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of chain tags to chain configurations")
            }

            fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut chains = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(tag) = access.next_key::<ChainTag>()? {
                    let raw: serde_json::Value = access.next_value()?;
                    let config = if raw.get("portal_launcher_id").is_some() {
                        let inner: XchChainConfig =
                            serde_json::from_value(raw).map_err(serde::de::Error::custom)?;
                        ChainConfig::Xch(Box::new(inner))
                    } else if raw.get("portal_address").is_some() {
                        let inner: EvmChainConfig =
                            serde_json::from_value(raw).map_err(serde::de::Error::custom)?;
                        ChainConfig::Evm(Box::new(inner))
                    } else {
                        return Err(serde::de::Error::custom(format!(
                            "chain {tag}: neither portal_address nor portal_launcher_id present"
                        )));
                    };
                    chains.push((tag, config));
                }
                Ok(ChainsConfig(chains))
            }
        }

        deserializer.deserialize_map(ChainsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const EVM_KEY: &str = "0xcafe000000000000000000000000000000000000000000000000000000000001";
    const XCH_KEY: &str = "0x000000000000000000000000000000000000000000000000000000000000002a";

    fn full_config_json() -> serde_json::Value {
        serde_json::json!({
            "db_path": "relay.db",
            "chains": {
                "eth": {
                    "rpc_url": "https://rpc.example.org",
                    "min_height": 19_000_000u64,
                    "sign_min_height": 12,
                    "portal_address": "0x00000000000000000000000000000000000000aa",
                    "my_hot_private_key": EVM_KEY,
                },
                "bse": {
                    "rpc_url": "https://l2.example.org",
                    "sign_min_height": 12,
                    "portal_address": "0x00000000000000000000000000000000000000ab",
                    "my_hot_private_key": EVM_KEY,
                    "l1_block_contract_address": "0x4200000000000000000000000000000000000015",
                },
                "xch": {
                    "rpc_url": "http://localhost:5000",
                    "min_height": 5_000_000u64,
                    "sign_min_height": 32,
                    "portal_launcher_id": "0x1111111111111111111111111111111111111111111111111111111111111111",
                    "bridging_puzzle_hash": "0x2222222222222222222222222222222222222222222222222222222222222222",
                    "per_message_toll": 1_000_000_000u64,
                    "agg_sig_data": "0x3333333333333333333333333333333333333333333333333333333333333333",
                    "portal_threshold": 1,
                    "portal_keys": [],
                    "my_hot_private_key": XCH_KEY,
                },
            },
            "nostr": {
                "relays": ["wss://relay.example.org"],
                "my_mnemonic": "leader monkey parrot ring guide accident before fence cannon height naive bean",
            },
            "proxy": {
                "listen_addr": "127.0.0.1:5000",
                "upstream_url": "https://localhost:8555",
                "cert_path": "/etc/node/full_node.crt",
                "key_path": "/etc/node/full_node.key",
            },
        })
    }

    #[test]
    fn full_config_parses_and_dispatches_families() {
        let config: Config = serde_json::from_value(full_config_json()).unwrap();
        assert_eq!(config.db_path, PathBuf::from("relay.db"));
        assert_eq!(config.chains.len(), 3);

        let eth: ChainTag = "eth".parse().unwrap();
        let bse: ChainTag = "bse".parse().unwrap();
        let xch: ChainTag = "xch".parse().unwrap();

        for (tag, chain) in config.chains.iter() {
            match chain {
                ChainConfig::Evm(evm) if *tag == eth => {
                    assert!(evm.l1_block_contract_address.is_none());
                    assert!(evm.signer(eth).is_ok());
                }
                ChainConfig::Evm(evm) if *tag == bse => {
                    assert!(evm.l1_block_contract_address.is_some());
                }
                ChainConfig::Xch(x) if *tag == xch => {
                    assert_eq!(x.per_message_toll, 1_000_000_000);
                    assert!(x.hot_key(xch).is_ok());
                }
                other => panic!("unexpected chain entry: {tag} -> {other:?}"),
            }
        }
        assert!(config.proxy.is_some());
    }

    #[test]
    fn chain_without_portal_identity_is_rejected() {
        let mut raw = full_config_json();
        raw["chains"]["eth"]
            .as_object_mut()
            .unwrap()
            .remove("portal_address");
        assert!(serde_json::from_value::<Config>(raw).is_err());
    }

    #[test]
    fn env_reference_resolves_for_secrets() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        // Safety: guarded by `ENV_LOCK`, so no concurrent env mutation occurs.
        unsafe { env::set_var("TEST_RELAY_HOT_KEY", EVM_KEY) };

        let mut raw = full_config_json();
        raw["chains"]["eth"]["my_hot_private_key"] = "$TEST_RELAY_HOT_KEY".into();
        let config: Config = serde_json::from_value(raw).unwrap();
        let eth: ChainTag = "eth".parse().unwrap();
        let Some((_, ChainConfig::Evm(evm))) =
            config.chains.iter().find(|(tag, _)| *tag == eth)
        else {
            panic!("expected an evm chain entry for eth");
        };
        assert_eq!(
            *evm.my_hot_private_key.inner(),
            EVM_KEY.parse::<EvmPrivateKey>().unwrap()
        );

        // Safety: guarded by `ENV_LOCK`.
        unsafe { env::remove_var("TEST_RELAY_HOT_KEY") };
    }

    #[test]
    fn env_reference_syntax() {
        assert_eq!(env_reference("$HOT_KEY"), Some("HOT_KEY"));
        assert_eq!(env_reference("${HOT_KEY}"), Some("HOT_KEY"));
        // Literals, malformed references, and empty names stay literal.
        assert_eq!(env_reference("0xcafe"), None);
        assert_eq!(env_reference("$"), None);
        assert_eq!(env_reference("${}"), None);
        assert_eq!(env_reference("$NOT-A-NAME"), None);
        assert_eq!(env_reference("${UNCLOSED"), None);
    }

    #[test]
    fn missing_env_reference_is_an_error() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let mut raw = full_config_json();
        raw["chains"]["eth"]["my_hot_private_key"] = "$TEST_RELAY_MISSING_KEY".into();
        assert!(serde_json::from_value::<Config>(raw).is_err());
    }

    #[test]
    fn hot_key_must_be_in_validator_set_when_one_is_given() {
        let eth: ChainTag = "eth".parse().unwrap();
        let mut raw = full_config_json();
        raw["chains"]["eth"]["hot_addresses"] =
            serde_json::json!(["0x00000000000000000000000000000000000000ff"]);
        let config: Config = serde_json::from_value(raw).unwrap();
        let Some((_, ChainConfig::Evm(evm))) =
            config.chains.iter().find(|(tag, _)| *tag == eth)
        else {
            panic!("expected an evm chain entry for eth");
        };
        assert!(matches!(
            evm.signer(eth),
            Err(ConfigError::HotKeyNotInValidatorSet { .. })
        ));
    }

    #[test]
    fn bls_public_key_rejects_garbage() {
        assert!("0x1234".parse::<BlsPublicKey>().is_err());
        let not_on_curve = format!("0x{}", "11".repeat(48));
        assert!(not_on_curve.parse::<BlsPublicKey>().is_err());
    }
}
