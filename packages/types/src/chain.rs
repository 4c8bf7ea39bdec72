use std::{str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// A `ChainKey` identifies a blockchain network by namespace and chain id, e.g. `eip155:1`.
///
/// Follows https://chainagnostic.org/CAIPs/caip-2, with the namespace relaxed to 1-32 characters.
/// Only the `eip155` namespace is served by this connector, but other namespaces still parse
/// so that callers get a precise "unsupported chain" error instead of a format error.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainKey {
    pub namespace: ChainKeyNamespace,
    pub id: ChainKeyId,
}

type ChainKeyResult<T> = Result<T, ChainKeyError>;

static CHAIN_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([-a-z0-9]{1,32}):([-_a-zA-Z0-9]{1,32})$").unwrap());

static NAMESPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-a-z0-9]{1,32}$").unwrap());

static ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[-_a-zA-Z0-9]{1,32}$").unwrap());

impl ChainKey {
    pub fn new(s: impl Into<String>) -> ChainKeyResult<Self> {
        let s = s.into();
        let captures = CHAIN_KEY_REGEX
            .captures(&s)
            .ok_or(ChainKeyError::FormatError)?;

        let namespace = ChainKeyNamespace::new(&captures[1])?;
        let id = ChainKeyId::new(&captures[2])?;

        Ok(Self { namespace, id })
    }

    /// Shorthand for `eip155:{chain_id}`
    pub fn eip155(chain_id: u64) -> Self {
        Self {
            namespace: ChainKeyNamespace(ChainKeyNamespace::EIP155.to_string()),
            id: ChainKeyId(chain_id.to_string()),
        }
    }

    pub fn is_evm(&self) -> bool {
        self.namespace.as_str() == ChainKeyNamespace::EIP155
    }

    /// The numeric EVM chain id, only for the `eip155` namespace
    pub fn evm_chain_id(&self) -> ChainKeyResult<u64> {
        if !self.is_evm() {
            return Err(ChainKeyError::NotEvm(self.to_string()));
        }
        self.id
            .as_str()
            .parse()
            .map_err(|_| ChainKeyError::InvalidId)
    }
}

impl<'de> Deserialize<'de> for ChainKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ChainKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl std::fmt::Display for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

impl FromStr for ChainKey {
    type Err = ChainKeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for ChainKey {
    type Error = ChainKeyError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ----------------------------
// ChainKeyNamespace
// ----------------------------
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainKeyNamespace(String);

impl ChainKeyNamespace {
    pub const EIP155: &str = "eip155";

    pub fn new(s: impl Into<String>) -> ChainKeyResult<Self> {
        let s = s.into();
        if NAMESPACE_REGEX.is_match(&s) {
            Ok(Self(s))
        } else {
            Err(ChainKeyError::InvalidNamespace)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChainKeyNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------
// ChainKeyId
// ----------------------------
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainKeyId(String);

impl ChainKeyId {
    pub fn new(s: impl Into<String>) -> ChainKeyResult<Self> {
        let s = s.into();
        if ID_REGEX.is_match(&s) {
            Ok(Self(s))
        } else {
            Err(ChainKeyError::InvalidId)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChainKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------
// Errors
// ----------------------------
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum ChainKeyError {
    #[error("ChainKey must follow the CAIP-2-like format of 'namespace:id'")]
    FormatError,
    #[error("Invalid namespace component")]
    InvalidNamespace,
    #[error("Invalid id component")]
    InvalidId,
    #[error("Not an eip155 chain: {0}")]
    NotEvm(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_chain_keys() {
        assert!(ChainKey::new("eip155:1").is_ok());
        assert!(ChainKey::new("eip155:1666600000").is_ok());
        assert!(ChainKey::new("cosmos:cosmoshub-4").is_ok());
    }

    #[test]
    fn invalid_chain_keys() {
        assert!(ChainKey::new("no-colon").is_err());
        assert!(ChainKey::new("too:many:colons").is_err());
        assert!(ChainKey::new(":1").is_err());
        assert!(ChainKey::new("eip155:").is_err());
        assert!(ChainKey::new("EIP155:1").is_err());
    }

    #[test]
    fn evm_chain_id() {
        let key = ChainKey::new("eip155:11155111").unwrap();
        assert!(key.is_evm());
        assert_eq!(key.evm_chain_id().unwrap(), 11155111);
        assert_eq!(key, ChainKey::eip155(11155111));

        let key = ChainKey::new("near:mainnet").unwrap();
        assert_eq!(
            key.evm_chain_id(),
            Err(ChainKeyError::NotEvm("near:mainnet".to_string()))
        );

        let key = ChainKey::new("eip155:goerli").unwrap();
        assert_eq!(key.evm_chain_id(), Err(ChainKeyError::InvalidId));
    }

    #[test]
    fn serde_as_string() {
        let key: ChainKey = serde_json::from_str("\"eip155:5\"").unwrap();
        assert_eq!(key.to_string(), "eip155:5");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"eip155:5\"");
    }
}
