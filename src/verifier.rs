//! Signed-request verification.
//!
//! Order matters: structural validation, network membership, hard ceilings,
//! then the EIP-712 domain binding and signer recovery. Each failure names
//! the offending field. The verifier never consults the chain; user-nonce
//! replay defence belongs to the forwarder contract.

use alloy::primitives::{Address, Bytes, Signature, B256, U256};
use alloy::sol;
use alloy::sol_types::{eip712_domain, SolCall, SolStruct};
use std::collections::HashMap;

use crate::config::Config;
use crate::error::Error;
use crate::types::{RelayRequestWire, TokenKind, TokenTransfer, VerifiedRequest};

sol! {
    /// Payload the user signs. Field order fixes the type hash; this must
    /// match the forwarder contract bit-exactly.
    #[derive(Debug)]
    struct ForwardRequest {
        address from;
        address to;
        uint256 value;
        uint256 gas;
        uint256 nonce;
        bytes data;
    }

    function execute(ForwardRequest req, bytes signature) payable returns (bool success, bytes ret);
}

/// Domain name the forwarder contract registers under.
const DOMAIN_NAME: &str = "MinimalForwarder";
/// Domain version, part of the compatibility contract.
const DOMAIN_VERSION: &str = "0.0.1";

/// Typed-data digest a request binds to, domain-separated by chain id and
/// forwarder address.
pub fn signing_digest(request: &ForwardRequest, chain_id: u64, forwarder: Address) -> B256 {
    let domain = eip712_domain! {
        name: DOMAIN_NAME,
        version: DOMAIN_VERSION,
        chain_id: chain_id,
        verifying_contract: forwarder,
    };
    request.eip712_signing_hash(&domain)
}

/// Calldata for the forwarder's `execute(req, signature)`.
pub fn execute_calldata(request: &VerifiedRequest) -> Bytes {
    let call = executeCall {
        req: ForwardRequest {
            from: request.from,
            to: request.to,
            value: request.value,
            gas: request.gas,
            nonce: request.user_nonce,
            data: request.data.clone(),
        },
        signature: Bytes::copy_from_slice(&request.signature.as_bytes()),
    };
    call.abi_encode().into()
}

struct NetworkBinding {
    chain_id: u64,
    forwarder: Address,
}

/// Request verifier. Pure and synchronous.
pub struct Verifier {
    networks: HashMap<String, NetworkBinding>,
    hard_max_gas_limit: U256,
    hard_max_value: U256,
}

impl Verifier {
    pub fn new(config: &Config) -> Self {
        let networks = config
            .networks
            .iter()
            .map(|(name, net)| {
                (
                    name.clone(),
                    NetworkBinding {
                        chain_id: net.chain_id,
                        forwarder: net.forwarder,
                    },
                )
            })
            .collect();
        Self {
            networks,
            hard_max_gas_limit: U256::from(config.hard_max_gas_limit),
            hard_max_value: config.hard_max_value,
        }
    }

    /// Run the full verification pipeline on a wire request.
    pub fn verify(&self, wire: &RelayRequestWire) -> Result<VerifiedRequest, Error> {
        // (1) Structural validation.
        let from = parse_address("from", &wire.from)?;
        let to = parse_address("to", &wire.to)?;
        let value = parse_u256_dec("value", &wire.value)?;
        let gas = parse_u256_dec("gas", &wire.gas)?;
        let user_nonce = parse_u256_dec("nonce", &wire.nonce)?;
        let data = parse_hex_bytes("data", &wire.data)?;
        let signature = parse_signature("signature", &wire.signature)?;
        let token = parse_token_fields(wire)?;

        // (2) Network membership.
        let binding = self
            .networks
            .get(&wire.network)
            .ok_or_else(|| Error::UnsupportedNetwork(wire.network.clone()))?;

        // (3) Hard ceilings, independent of policy.
        if gas > self.hard_max_gas_limit {
            return Err(Error::InvalidRequest {
                field: "gas",
                reason: format!("exceeds hard ceiling {}", self.hard_max_gas_limit),
            });
        }
        if value > self.hard_max_value {
            return Err(Error::InvalidRequest {
                field: "value",
                reason: format!("exceeds hard ceiling {}", self.hard_max_value),
            });
        }

        // (4) Reconstruct the domain-bound digest.
        let payload = ForwardRequest {
            from,
            to,
            value,
            gas,
            nonce: user_nonce,
            data: data.clone(),
        };
        let digest = signing_digest(&payload, binding.chain_id, binding.forwarder);

        // (5) Recover the signer; it must be `from`.
        let recovered = signature
            .recover_address_from_prehash(&digest)
            .map_err(|e| Error::InvalidRequest {
                field: "signature",
                reason: format!("unrecoverable signature: {e}"),
            })?;
        if recovered != from {
            return Err(Error::InvalidRequest {
                field: "signature",
                reason: "signer does not match `from`".into(),
            });
        }

        Ok(VerifiedRequest {
            from,
            to,
            value,
            gas,
            user_nonce,
            data,
            signature,
            network: wire.network.clone(),
            chain_id: binding.chain_id,
            forwarder: binding.forwarder,
            token,
        })
    }
}

fn parse_address(field: &'static str, s: &str) -> Result<Address, Error> {
    let hex = s.strip_prefix("0x").ok_or(Error::InvalidRequest {
        field,
        reason: "missing 0x prefix".into(),
    })?;
    if hex.len() != 40 {
        return Err(Error::InvalidRequest {
            field,
            reason: format!("expected 20-byte hex, got {} chars", hex.len()),
        });
    }
    s.parse::<Address>().map_err(|_| Error::InvalidRequest {
        field,
        reason: "not valid hex".into(),
    })
}

fn parse_u256_dec(field: &'static str, s: &str) -> Result<U256, Error> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidRequest {
            field,
            reason: "expected a decimal unsigned integer".into(),
        });
    }
    U256::from_str_radix(s, 10).map_err(|_| Error::InvalidRequest {
        field,
        reason: "does not fit in 256 bits".into(),
    })
}

fn parse_hex_bytes(field: &'static str, s: &str) -> Result<Bytes, Error> {
    let hex = s.strip_prefix("0x").ok_or(Error::InvalidRequest {
        field,
        reason: "missing 0x prefix".into(),
    })?;
    if hex.len() % 2 != 0 {
        return Err(Error::InvalidRequest {
            field,
            reason: "odd-length hex".into(),
        });
    }
    s.parse::<Bytes>().map_err(|_| Error::InvalidRequest {
        field,
        reason: "not valid hex".into(),
    })
}

fn parse_signature(field: &'static str, s: &str) -> Result<Signature, Error> {
    let bytes = parse_hex_bytes(field, s)?;
    if bytes.len() != 65 {
        return Err(Error::InvalidRequest {
            field,
            reason: format!("expected 65 bytes, got {}", bytes.len()),
        });
    }
    Signature::from_raw(&bytes).map_err(|e| Error::InvalidRequest {
        field,
        reason: format!("malformed signature: {e}"),
    })
}

fn parse_token_fields(wire: &RelayRequestWire) -> Result<Option<TokenTransfer>, Error> {
    let Some(token_address) = &wire.token_address else {
        return Ok(None);
    };
    let address = parse_address("token_address", token_address)?;
    let kind_str = wire.token_kind.as_deref().ok_or(Error::InvalidRequest {
        field: "token_kind",
        reason: "required when token_address is present".into(),
    })?;
    let kind = TokenKind::parse(kind_str).ok_or(Error::InvalidRequest {
        field: "token_kind",
        reason: "expected fungible, non-fungible or multi".into(),
    })?;
    let amount = match &wire.amount {
        Some(s) => parse_u256_dec("amount", s)?,
        None if kind == TokenKind::NonFungible => U256::from(1u64),
        None => {
            return Err(Error::InvalidRequest {
                field: "amount",
                reason: "required for fungible and multi tokens".into(),
            })
        }
    };
    let token_id = match &wire.token_id {
        Some(s) => parse_u256_dec("token_id", s)?,
        None if kind == TokenKind::Fungible => U256::ZERO,
        None => {
            return Err(Error::InvalidRequest {
                field: "token_id",
                reason: "required for non-fungible and multi tokens".into(),
            })
        }
    };
    Ok(Some(TokenTransfer {
        address,
        kind,
        amount,
        token_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    fn make_config() -> Config {
        let mut config = Config::default();
        config.networks.insert(
            "localhost".into(),
            NetworkConfig {
                chain_id: 31337,
                rpc_url: "http://127.0.0.1:8545".into(),
                fallback_rpc_url: None,
                forwarder: Address::repeat_byte(0xfd),
                private_rpc_url: None,
            },
        );
        config
    }

    fn signed_wire(signer: &PrivateKeySigner, config: &Config) -> RelayRequestWire {
        let net = &config.networks["localhost"];
        let payload = ForwardRequest {
            from: signer.address(),
            to: Address::repeat_byte(0xbb),
            value: U256::from(10u64).pow(U256::from(18u64)),
            gas: U256::from(100_000u64),
            nonce: U256::ZERO,
            data: Bytes::new(),
        };
        let digest = signing_digest(&payload, net.chain_id, net.forwarder);
        let sig = signer.sign_hash_sync(&digest).unwrap();
        RelayRequestWire {
            from: format!("{:#x}", signer.address()),
            to: format!("{:#x}", Address::repeat_byte(0xbb)),
            value: payload.value.to_string(),
            gas: "100000".into(),
            nonce: "0".into(),
            data: "0x".into(),
            signature: format!("0x{}", alloy::hex::encode(sig.as_bytes())),
            network: "localhost".into(),
            token_address: None,
            token_kind: None,
            amount: None,
            token_id: None,
        }
    }

    #[test]
    fn valid_signature_verifies() {
        let config = make_config();
        let verifier = Verifier::new(&config);
        let signer = PrivateKeySigner::random();
        let wire = signed_wire(&signer, &config);
        let verified = verifier.verify(&wire).unwrap();
        assert_eq!(verified.from, signer.address());
        assert_eq!(verified.chain_id, 31337);
    }

    #[test]
    fn mutated_signature_fails() {
        let config = make_config();
        let verifier = Verifier::new(&config);
        let signer = PrivateKeySigner::random();
        let mut wire = signed_wire(&signer, &config);
        // Flip one nibble in the middle of the signature.
        let mut bytes: Vec<char> = wire.signature.chars().collect();
        bytes[40] = if bytes[40] == '0' { '1' } else { '0' };
        wire.signature = bytes.into_iter().collect();
        let err = verifier.verify(&wire).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { field: "signature", .. }));
    }

    #[test]
    fn mutated_fields_fail_recovery() {
        let config = make_config();
        let verifier = Verifier::new(&config);
        let signer = PrivateKeySigner::random();

        let mut wire = signed_wire(&signer, &config);
        wire.value = "1000000000000000001".into();
        assert!(verifier.verify(&wire).is_err());

        let mut wire = signed_wire(&signer, &config);
        wire.nonce = "1".into();
        assert!(verifier.verify(&wire).is_err());

        let mut wire = signed_wire(&signer, &config);
        wire.data = "0x00".into();
        assert!(verifier.verify(&wire).is_err());
    }

    #[test]
    fn from_must_match_signer() {
        let config = make_config();
        let verifier = Verifier::new(&config);
        let signer = PrivateKeySigner::random();
        let other = PrivateKeySigner::random();
        let mut wire = signed_wire(&signer, &config);
        wire.from = format!("{:#x}", other.address());
        let err = verifier.verify(&wire).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { field: "signature", .. }));
    }

    #[test]
    fn structural_errors_name_fields() {
        let config = make_config();
        let verifier = Verifier::new(&config);
        let signer = PrivateKeySigner::random();

        let mut wire = signed_wire(&signer, &config);
        wire.from = "f39fd6e51aad88f6f4ce6ab8827279cfffb92266".into();
        assert!(matches!(
            verifier.verify(&wire).unwrap_err(),
            Error::InvalidRequest { field: "from", .. }
        ));

        let mut wire = signed_wire(&signer, &config);
        wire.value = "12e3".into();
        assert!(matches!(
            verifier.verify(&wire).unwrap_err(),
            Error::InvalidRequest { field: "value", .. }
        ));

        let mut wire = signed_wire(&signer, &config);
        wire.gas = "".into();
        assert!(matches!(
            verifier.verify(&wire).unwrap_err(),
            Error::InvalidRequest { field: "gas", .. }
        ));
    }

    #[test]
    fn unknown_network_rejected() {
        let config = make_config();
        let verifier = Verifier::new(&config);
        let signer = PrivateKeySigner::random();
        let mut wire = signed_wire(&signer, &config);
        wire.network = "goerli".into();
        assert!(matches!(
            verifier.verify(&wire).unwrap_err(),
            Error::UnsupportedNetwork(_)
        ));
    }

    #[test]
    fn hard_ceilings_precede_signature_checks() {
        let config = make_config();
        let verifier = Verifier::new(&config);
        let signer = PrivateKeySigner::random();
        let mut wire = signed_wire(&signer, &config);
        wire.gas = (config.hard_max_gas_limit + 1).to_string();
        assert!(matches!(
            verifier.verify(&wire).unwrap_err(),
            Error::InvalidRequest { field: "gas", .. }
        ));
    }

    #[test]
    fn token_fields_validated_together() {
        let config = make_config();
        let verifier = Verifier::new(&config);
        let signer = PrivateKeySigner::random();

        let mut wire = signed_wire(&signer, &config);
        wire.token_address = Some(format!("{:#x}", Address::repeat_byte(0x77)));
        assert!(matches!(
            verifier.verify(&wire).unwrap_err(),
            Error::InvalidRequest { field: "token_kind", .. }
        ));

        wire.token_kind = Some("fungible".into());
        assert!(matches!(
            verifier.verify(&wire).unwrap_err(),
            Error::InvalidRequest { field: "amount", .. }
        ));

        wire.amount = Some("1000".into());
        let verified = verifier.verify(&wire).unwrap();
        let token = verified.token.unwrap();
        assert_eq!(token.kind, TokenKind::Fungible);
        assert_eq!(token.amount, U256::from(1000u64));
    }

    #[test]
    fn domain_change_breaks_binding() {
        // Same payload signed for chain 31337 must not verify against 31338.
        let signer = PrivateKeySigner::random();
        let payload = ForwardRequest {
            from: signer.address(),
            to: Address::repeat_byte(0xbb),
            value: U256::ZERO,
            gas: U256::from(21_000u64),
            nonce: U256::ZERO,
            data: Bytes::new(),
        };
        let forwarder = Address::repeat_byte(0xfd);
        let d1 = signing_digest(&payload, 31337, forwarder);
        let d2 = signing_digest(&payload, 31338, forwarder);
        let d3 = signing_digest(&payload, 31337, Address::repeat_byte(0xfe));
        assert_ne!(d1, d2);
        assert_ne!(d1, d3);
    }
}
