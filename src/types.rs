//! Wire and domain types shared across the relay service.
//!
//! Wire encodings are canonical: 20-byte fields are lower-case `0x`-hex,
//! 256-bit quantities are decimal strings, byte strings are `0x`-hex.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound relay request exactly as received on the wire.
///
/// Every field is a string in its wire encoding; the verifier owns parsing
/// so that a malformed field produces a typed error naming that field
/// instead of an opaque deserialization failure.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayRequestWire {
    pub from: String,
    pub to: String,
    pub value: String,
    pub gas: String,
    /// The user's replay counter at the forwarder contract.
    pub nonce: String,
    pub data: String,
    pub signature: String,
    pub network: String,
    #[serde(default)]
    pub token_address: Option<String>,
    #[serde(default)]
    pub token_kind: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub token_id: Option<String>,
}

/// Token standard carried by a request's optional token fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    #[serde(rename = "fungible")]
    Fungible,
    #[serde(rename = "non-fungible")]
    NonFungible,
    #[serde(rename = "multi")]
    Multi,
}

impl TokenKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fungible" => Some(Self::Fungible),
            "non-fungible" => Some(Self::NonFungible),
            "multi" => Some(Self::Multi),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fungible => "fungible",
            Self::NonFungible => "non-fungible",
            Self::Multi => "multi",
        }
    }
}

/// Token movement declared by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub address: Address,
    pub kind: TokenKind,
    pub amount: U256,
    pub token_id: U256,
}

/// A request that has passed the verifier: fields parsed, domain binding
/// checked, signer recovered and matched against `from`.
#[derive(Debug, Clone)]
pub struct VerifiedRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub gas: U256,
    pub user_nonce: U256,
    pub data: alloy::primitives::Bytes,
    pub signature: alloy::primitives::Signature,
    pub network: String,
    pub chain_id: u64,
    pub forwarder: Address,
    pub token: Option<TokenTransfer>,
}

/// Lifecycle state of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
    Dropped,
}

impl TxStatus {
    /// Terminal states are immutable once reached.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Dropped => "dropped",
        }
    }
}

/// Durable record of one on-chain submission. Keyed by `tx_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_address: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_kind: Option<TokenKind>,
    #[serde(
        with = "u256_dec_opt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub token_amount: Option<U256>,
    #[serde(
        with = "u256_dec_opt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub token_id: Option<U256>,
    pub status: TxStatus,
    #[serde(with = "u256_dec")]
    pub value: U256,
    pub gas_limit: u64,
    /// Fee the relayer submitted with; replaced by the receipt's effective
    /// price on confirmation.
    #[serde(with = "u256_dec")]
    pub gas_price: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    /// Sequence number the allocator issued for this submission.
    pub nonce: u64,
    pub relayer: Address,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stuck_since: Option<DateTime<Utc>>,
}

/// Policy rule kind. Rules are additive: a request must pass every rule
/// that applies to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    #[serde(rename = "allowlist")]
    Allowlist,
    #[serde(rename = "quota")]
    Quota,
    #[serde(rename = "gas-cap")]
    GasCap,
    #[serde(rename = "token-cap")]
    TokenCap,
}

impl RuleKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allowlist" => Some(Self::Allowlist),
            "quota" => Some(Self::Quota),
            "gas-cap" => Some(Self::GasCap),
            "token-cap" => Some(Self::TokenCap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowlist => "allowlist",
            Self::Quota => "quota",
            Self::GasCap => "gas-cap",
            Self::TokenCap => "token-cap",
        }
    }
}

/// What a rule applies to: everything, one network, or one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Any,
    Network(String),
    Account(Address),
}

impl RuleTarget {
    pub fn parse(s: &str) -> Result<Self, String> {
        if s == "*" {
            return Ok(Self::Any);
        }
        if s.starts_with("0x") || s.starts_with("0X") {
            return s
                .parse::<Address>()
                .map(Self::Account)
                .map_err(|_| format!("invalid account target: {s}"));
        }
        if s.is_empty() {
            return Err("empty rule target".into());
        }
        Ok(Self::Network(s.to_string()))
    }

    pub fn applies_to(&self, network: &str, from: Address) -> bool {
        match self {
            Self::Any => true,
            Self::Network(n) => n == network,
            Self::Account(a) => *a == from,
        }
    }
}

impl std::fmt::Display for RuleTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Network(n) => write!(f, "{n}"),
            Self::Account(a) => write!(f, "{a:#x}"),
        }
    }
}

impl Serialize for RuleTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RuleTarget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Durable policy rule. The `value` stays opaque at the storage layer; the
/// policy engine owns the per-kind schema and validates on write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub kind: RuleKind,
    pub target: RuleTarget,
    pub value: serde_json::Value,
    pub enabled: bool,
}

/// Canonical lower-case hex form of an account identifier.
pub fn canonical_address(address: Address) -> String {
    format!("{address:#x}")
}

/// Serde adapter: 256-bit quantities as decimal strings on the wire.
pub mod u256_dec {
    use alloy::primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str_radix(&s, 10).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: optional decimal 256-bit quantities.
pub mod u256_dec_opt {
    use alloy::primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<U256>, serializer: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<U256>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        match s {
            Some(s) => U256::from_str_radix(&s, 10)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
