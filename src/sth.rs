//! Signed Tree Heads and their signatures.
//!
//! An STH is trusted only once its `DigitallySigned` blob verifies under the
//! log's public key from the known-logs list. CT logs sign with either
//! ECDSA/P-256 or RSA PKCS#1 v1.5, both over SHA-256 of the TLS-serialized
//! `TreeHeadSignature` structure (RFC 6962 §3.5).

use serde::{Deserialize, Serialize};
use sha2::Sha256;
use signature::Verifier;
use spki::ObjectIdentifier;

use crate::error::MirrorError;
use crate::Hash;

// HashAlgorithm / SignatureAlgorithm identifiers from the TLS
// DigitallySigned header (RFC 5246 §7.4.1.4.1).
const HASH_SHA256: u8 = 4;
const SIG_RSA: u8 = 1;
const SIG_ECDSA: u8 = 3;

const SIGNATURE_TYPE_TREE_HEAD: u8 = 1;
const VERSION_V1: u8 = 0;

/// A Signed Tree Head exactly as the log serves it; also the on-disk format
/// of the trusted `sth.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTreeHead {
    pub tree_size: u64,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
    #[serde(with = "crate::b64")]
    pub sha256_root_hash: Hash,
    #[serde(with = "crate::b64bytes")]
    pub tree_head_signature: Vec<u8>,
}

impl SignedTreeHead {
    /// The TLS-serialized `TreeHeadSignature` the log signed:
    /// `version || signature_type || timestamp || tree_size || root_hash`.
    pub fn signed_payload(&self) -> [u8; 50] {
        let mut buf = [0u8; 50];
        buf[0] = VERSION_V1;
        buf[1] = SIGNATURE_TYPE_TREE_HEAD;
        buf[2..10].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[10..18].copy_from_slice(&self.tree_size.to_be_bytes());
        buf[18..].copy_from_slice(&self.sha256_root_hash);
        buf
    }
}

/// A log's public key, parsed from the base64 SPKI in the known-logs list.
#[derive(Debug, Clone)]
pub enum LogPublicKey {
    EcdsaP256(p256::ecdsa::VerifyingKey),
    Rsa(rsa::pkcs1v15::VerifyingKey<Sha256>),
}

const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

impl LogPublicKey {
    /// Parse a DER-encoded SubjectPublicKeyInfo, dispatching on its
    /// algorithm identifier.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, MirrorError> {
        let info = spki::SubjectPublicKeyInfoRef::try_from(der)
            .map_err(|e| MirrorError::Config(format!("malformed log public key: {e}")))?;
        let oid = info.algorithm.oid;
        if oid == OID_EC_PUBLIC_KEY {
            use p256::pkcs8::DecodePublicKey;
            let key = p256::ecdsa::VerifyingKey::from_public_key_der(der)
                .map_err(|e| MirrorError::Config(format!("invalid P-256 log key: {e}")))?;
            Ok(Self::EcdsaP256(key))
        } else if oid == OID_RSA_ENCRYPTION {
            use rsa::pkcs8::DecodePublicKey;
            let key = rsa::RsaPublicKey::from_public_key_der(der)
                .map_err(|e| MirrorError::Config(format!("invalid RSA log key: {e}")))?;
            Ok(Self::Rsa(rsa::pkcs1v15::VerifyingKey::new(key)))
        } else {
            Err(MirrorError::Config(format!(
                "unsupported log key algorithm {oid}"
            )))
        }
    }

    /// Verify an STH's `tree_head_signature` against this key.
    pub fn verify_sth(&self, sth: &SignedTreeHead) -> Result<(), MirrorError> {
        let (hash_algo, sig_algo, sig) = split_digitally_signed(&sth.tree_head_signature)?;
        if hash_algo != HASH_SHA256 {
            return Err(MirrorError::SignatureInvalid(format!(
                "unsupported hash algorithm {hash_algo}"
            )));
        }
        let msg = sth.signed_payload();
        match (self, sig_algo) {
            (Self::EcdsaP256(key), SIG_ECDSA) => {
                let sig = p256::ecdsa::Signature::from_der(sig).map_err(|e| {
                    MirrorError::SignatureInvalid(format!("malformed ECDSA signature: {e}"))
                })?;
                key.verify(&msg, &sig)
                    .map_err(|_| MirrorError::SignatureInvalid("ECDSA verification failed".into()))
            }
            (Self::Rsa(key), SIG_RSA) => {
                let sig = rsa::pkcs1v15::Signature::try_from(sig).map_err(|e| {
                    MirrorError::SignatureInvalid(format!("malformed RSA signature: {e}"))
                })?;
                key.verify(&msg, &sig)
                    .map_err(|_| MirrorError::SignatureInvalid("RSA verification failed".into()))
            }
            _ => Err(MirrorError::SignatureInvalid(format!(
                "signature algorithm {sig_algo} does not match the log key"
            ))),
        }
    }
}

/// Split a TLS `DigitallySigned` blob into `(hash_algo, sig_algo, signature)`.
fn split_digitally_signed(blob: &[u8]) -> Result<(u8, u8, &[u8]), MirrorError> {
    if blob.len() < 4 {
        return Err(MirrorError::SignatureInvalid(
            "DigitallySigned shorter than its header".into(),
        ));
    }
    let declared = u16::from_be_bytes([blob[2], blob[3]]) as usize;
    let sig = &blob[4..];
    if declared != sig.len() {
        return Err(MirrorError::SignatureInvalid(format!(
            "signature length {} does not match declared {declared}",
            sig.len()
        )));
    }
    Ok((blob[0], blob[1], sig))
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::{Signature, SigningKey};
    use p256::pkcs8::EncodePublicKey;

    use super::*;

    fn test_key() -> SigningKey {
        SigningKey::from_slice(&[0x17; 32]).unwrap()
    }

    fn signed_sth(key: &SigningKey, tree_size: u64, root: Hash) -> SignedTreeHead {
        let mut sth = SignedTreeHead {
            tree_size,
            timestamp: 1_469_185_818_000,
            sha256_root_hash: root,
            tree_head_signature: Vec::new(),
        };
        let sig: Signature = key.sign(&sth.signed_payload());
        let der = sig.to_der();
        let mut blob = vec![HASH_SHA256, SIG_ECDSA];
        blob.extend_from_slice(&(der.as_bytes().len() as u16).to_be_bytes());
        blob.extend_from_slice(der.as_bytes());
        sth.tree_head_signature = blob;
        sth
    }

    fn log_key(key: &SigningKey) -> LogPublicKey {
        let spki = key.verifying_key().to_public_key_der().unwrap();
        LogPublicKey::from_spki_der(spki.as_bytes()).unwrap()
    }

    #[test]
    fn signed_payload_layout() {
        let sth = SignedTreeHead {
            tree_size: 3,
            timestamp: 0x0102030405060708,
            sha256_root_hash: [0xaa; 32],
            tree_head_signature: Vec::new(),
        };
        let payload = sth.signed_payload();
        assert_eq!(payload[0], 0);
        assert_eq!(payload[1], 1);
        assert_eq!(&payload[2..10], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&payload[10..18], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&payload[18..], &[0xaa; 32]);
    }

    #[test]
    fn valid_ecdsa_sth_verifies() {
        let key = test_key();
        let sth = signed_sth(&key, 42, [0x11; 32]);
        log_key(&key).verify_sth(&sth).unwrap();
    }

    #[test]
    fn corrupted_signature_is_rejected() {
        let key = test_key();
        let mut sth = signed_sth(&key, 42, [0x11; 32]);
        let last = sth.tree_head_signature.len() - 1;
        sth.tree_head_signature[last] ^= 0x01;
        assert!(matches!(
            log_key(&key).verify_sth(&sth),
            Err(MirrorError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn tampered_tree_size_is_rejected() {
        let key = test_key();
        let mut sth = signed_sth(&key, 42, [0x11; 32]);
        sth.tree_size = 43;
        assert!(log_key(&key).verify_sth(&sth).is_err());
    }

    #[test]
    fn mismatched_signature_algorithm_is_rejected() {
        let key = test_key();
        let mut sth = signed_sth(&key, 42, [0x11; 32]);
        sth.tree_head_signature[1] = SIG_RSA;
        assert!(log_key(&key).verify_sth(&sth).is_err());
    }

    #[test]
    fn wrong_declared_length_is_rejected() {
        let key = test_key();
        let mut sth = signed_sth(&key, 1, [0; 32]);
        sth.tree_head_signature[3] ^= 0x01;
        assert!(log_key(&key).verify_sth(&sth).is_err());
    }

    #[test]
    fn unsupported_key_algorithm_is_rejected() {
        // Minimal SPKI claiming Ed25519 (OID 1.3.101.112) with an empty key.
        let der = [
            0x30, 0x0a, // SEQUENCE
            0x30, 0x05, // AlgorithmIdentifier
            0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112
            0x03, 0x01, 0x00, // BIT STRING, no unused bits, empty
        ];
        assert!(matches!(
            LogPublicKey::from_spki_der(&der),
            Err(MirrorError::Config(_))
        ));
    }

    #[test]
    fn sth_json_round_trip() {
        let key = test_key();
        let sth = signed_sth(&key, 7, [0x5c; 32]);
        let json = serde_json::to_string(&sth).unwrap();
        assert!(json.contains("sha256_root_hash"));
        let parsed: SignedTreeHead = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, sth);
        log_key(&key).verify_sth(&parsed).unwrap();
    }
}
