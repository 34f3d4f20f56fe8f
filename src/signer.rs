//! Signer capability: local private key or remote KMS.
//!
//! Signatures are deterministic per input under a fixed key (RFC 6979
//! nonces), so re-signing the same unsigned transaction reproduces the same
//! bytes and the same hash. No variant exposes raw key material.

use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use std::sync::Arc;

use crate::config::SignerConfig;
use crate::error::Error;
use crate::kms::KmsSigner;

/// A signed wire-format transaction plus its deterministic hash. The hash
/// is known before broadcast, which is what lets the pipeline persist the
/// pending record first.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub hash: B256,
    pub raw: Vec<u8>,
}

/// Signing backend for the relayer.
pub enum RelayerSigner {
    Local { signer: PrivateKeySigner },
    /// Private key never leaves the remote service.
    Kms { client: Arc<KmsSigner> },
}

impl RelayerSigner {
    /// Build the configured backend. The relayer address is resolved here,
    /// at startup, for both variants.
    pub async fn from_config(config: &SignerConfig) -> Result<Self, Error> {
        match config.kind.as_str() {
            "local" => {
                let key = config
                    .private_key
                    .as_deref()
                    .ok_or_else(|| Error::Config("local signer requires private_key".into()))?;
                let signer: PrivateKeySigner = key
                    .parse()
                    .map_err(|e| Error::Config(format!("invalid private key: {e}")))?;
                Ok(Self::Local { signer })
            }
            "kms" => {
                let url = config
                    .kms_url
                    .as_deref()
                    .ok_or_else(|| Error::Config("kms signer requires kms_url".into()))?;
                let key_id = config
                    .kms_key_id
                    .as_deref()
                    .ok_or_else(|| Error::Config("kms signer requires kms_key_id".into()))?;
                let client = KmsSigner::connect(url, key_id).await?;
                Ok(Self::Kms {
                    client: Arc::new(client),
                })
            }
            other => Err(Error::Config(format!("unknown signer kind: {other}"))),
        }
    }

    /// The relayer account this backend signs for.
    pub fn address(&self) -> Address {
        match self {
            Self::Local { signer } => signer.address(),
            Self::Kms { client } => client.address(),
        }
    }

    /// Sign an EIP-1559 transaction. Local: synchronous (~microseconds).
    /// KMS: one HTTPS round trip.
    pub async fn sign_transaction(&self, tx: TxEip1559) -> Result<SignedTx, Error> {
        let digest = tx.signature_hash();
        let signature = match self {
            Self::Local { signer } => signer
                .sign_hash_sync(&digest)
                .map_err(|e| Error::SignerUnavailable(format!("local signing failed: {e}")))?,
            Self::Kms { client } => client.sign_digest(digest).await?,
        };
        let signed = tx.into_signed(signature);
        let hash = *signed.hash();
        let raw = TxEnvelope::Eip1559(signed).encoded_2718();
        Ok(SignedTx { hash, raw })
    }

    /// Backend reachability for /health and /ready. Local keys are always
    /// reachable.
    pub async fn health_check(&self) -> Result<(), Error> {
        match self {
            Self::Local { .. } => Ok(()),
            Self::Kms { client } => client.health_check().await,
        }
    }
}

impl std::fmt::Debug for RelayerSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { signer } => write!(f, "RelayerSigner::Local({:#x})", signer.address()),
            Self::Kms { client } => write!(f, "RelayerSigner::Kms({:#x})", client.address()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, TxKind, U256};

    fn make_tx(nonce: u64) -> TxEip1559 {
        TxEip1559 {
            chain_id: 31337,
            nonce,
            gas_limit: 100_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            to: TxKind::Call(Address::repeat_byte(0xfd)),
            value: U256::from(1u64),
            access_list: Default::default(),
            input: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn local_signing_is_deterministic() {
        let signer = RelayerSigner::Local {
            signer: PrivateKeySigner::random(),
        };
        let a = signer.sign_transaction(make_tx(7)).await.unwrap();
        let b = signer.sign_transaction(make_tx(7)).await.unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.raw, b.raw);

        let c = signer.sign_transaction(make_tx(8)).await.unwrap();
        assert_ne!(a.hash, c.hash);
    }

    #[tokio::test]
    async fn hash_matches_raw_bytes() {
        let signer = RelayerSigner::Local {
            signer: PrivateKeySigner::random(),
        };
        let signed = signer.sign_transaction(make_tx(0)).await.unwrap();
        assert_eq!(signed.hash, alloy::primitives::keccak256(&signed.raw));
        assert!(!signed.raw.is_empty());
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let config = SignerConfig {
            kind: "local".into(),
            private_key: None,
            kms_url: None,
            kms_key_id: None,
        };
        let err = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(RelayerSigner::from_config(&config))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
