//! RFC 6962 §3.4 `MerkleTreeLeaf` decoding.
//!
//! The rest of the pipeline only depends on an entry's `leaf_hash`; decoding
//! exists to reject malformed or unknown structures before anything touches
//! the archive, and to expose the typed payload to consumers of the shards.

use crate::error::MirrorError;
use crate::{leaf_hash, Hash};

const LEAF_VERSION_V1: u8 = 0;
const LEAF_TYPE_TIMESTAMPED_ENTRY: u8 = 0;
const ENTRY_TYPE_X509: u16 = 0;
const ENTRY_TYPE_PRECERT: u16 = 1;

/// One log entry as it travels through the pipeline: the raw wire bytes plus
/// the precomputed leaf hash.
#[derive(Debug, Clone)]
pub struct Entry {
    pub index: u64,
    pub leaf_bytes: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub leaf_hash: Hash,
}

impl Entry {
    /// Wrap raw wire bytes, computing the leaf hash in one pass.
    pub fn new(index: u64, leaf_bytes: Vec<u8>, extra_data: Vec<u8>) -> Self {
        let leaf_hash = leaf_hash(&leaf_bytes);
        Self {
            index,
            leaf_bytes,
            extra_data,
            leaf_hash,
        }
    }

    pub fn decode(&self) -> Result<DecodedLeaf, MirrorError> {
        decode_leaf(self.index, &self.leaf_bytes)
    }
}

/// The two RFC 6962 log entry kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafPayload {
    /// An end-entity certificate, DER encoded.
    X509 { certificate: Vec<u8> },
    /// A precertificate: the issuer key hash plus the signed TBSCertificate.
    Precert {
        issuer_key_hash: Hash,
        tbs_certificate: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLeaf {
    pub timestamp_ms: u64,
    pub payload: LeafPayload,
    pub extensions: Vec<u8>,
}

impl DecodedLeaf {
    /// Parse the `extra_data` that accompanied this leaf on the wire: the
    /// certificate chain for an x509 entry, or the full `PrecertChainEntry`
    /// (pre-certificate followed by its chain) for a precert entry.
    pub fn decode_extra(&self, index: u64, extra: &[u8]) -> Result<CertificateChain, MirrorError> {
        let mut reader = Reader::new(index, extra);
        let pre_certificate = match self.payload {
            LeafPayload::X509 { .. } => None,
            LeafPayload::Precert { .. } => Some(reader.opaque24("pre_certificate", 1)?),
        };
        let mut chain_reader = Reader::new(index, reader.opaque24("certificate_chain", 0)?);
        let mut chain = Vec::new();
        while !chain_reader.is_empty() {
            chain.push(chain_reader.opaque24("chain certificate", 1)?.to_vec());
        }
        reader.finish()?;
        Ok(CertificateChain {
            pre_certificate: pre_certificate.map(<[u8]>::to_vec),
            chain,
        })
    }
}

/// Issuer chain carried in `extra_data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    pub pre_certificate: Option<Vec<u8>>,
    pub chain: Vec<Vec<u8>>,
}

/// Decode a `MerkleTreeLeaf`. Unknown versions, leaf types, and entry types
/// are rejected, as are short buffers and trailing bytes.
pub fn decode_leaf(index: u64, leaf: &[u8]) -> Result<DecodedLeaf, MirrorError> {
    let mut reader = Reader::new(index, leaf);

    let version = reader.u8("version")?;
    if version != LEAF_VERSION_V1 {
        return Err(MirrorError::decode(index, format!("unknown leaf version {version}")));
    }
    let leaf_type = reader.u8("leaf type")?;
    if leaf_type != LEAF_TYPE_TIMESTAMPED_ENTRY {
        return Err(MirrorError::decode(index, format!("unknown leaf type {leaf_type}")));
    }

    let timestamp_ms = reader.u64("timestamp")?;
    let entry_type = reader.u16("entry type")?;
    let payload = match entry_type {
        ENTRY_TYPE_X509 => LeafPayload::X509 {
            certificate: reader.opaque24("certificate", 1)?.to_vec(),
        },
        ENTRY_TYPE_PRECERT => LeafPayload::Precert {
            issuer_key_hash: reader.array32("issuer_key_hash")?,
            tbs_certificate: reader.opaque24("tbs_certificate", 1)?.to_vec(),
        },
        other => {
            return Err(MirrorError::decode(index, format!("unknown entry type {other}")));
        }
    };
    let extensions = reader.opaque16("extensions")?.to_vec();
    reader.finish()?;

    Ok(DecodedLeaf {
        timestamp_ms,
        payload,
        extensions,
    })
}

/// Cursor over TLS-style length-prefixed bytes; every failure carries the
/// entry index it occurred at.
struct Reader<'a> {
    index: u64,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(index: u64, buf: &'a [u8]) -> Self {
        Self { index, buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], MirrorError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(MirrorError::decode(
                self.index,
                format!("buffer too short reading {what}"),
            )),
        }
    }

    fn u8(&mut self, what: &str) -> Result<u8, MirrorError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, MirrorError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self, what: &str) -> Result<u64, MirrorError> {
        let b = self.take(8, what)?;
        Ok(u64::from_be_bytes(b.try_into().expect("8 bytes")))
    }

    fn array32(&mut self, what: &str) -> Result<Hash, MirrorError> {
        Ok(self.take(32, what)?.try_into().expect("32 bytes"))
    }

    /// TLS `opaque<min..2^16-1>`.
    fn opaque16(&mut self, what: &str) -> Result<&'a [u8], MirrorError> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }

    /// TLS `opaque<min..2^24-1>`.
    fn opaque24(&mut self, what: &str, min: usize) -> Result<&'a [u8], MirrorError> {
        let b = self.take(3, what)?;
        let len = u32::from_be_bytes([0, b[0], b[1], b[2]]) as usize;
        if len < min {
            return Err(MirrorError::decode(
                self.index,
                format!("{what} shorter than the {min}-byte minimum"),
            ));
        }
        self.take(len, what)
    }

    fn finish(&self) -> Result<(), MirrorError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(MirrorError::decode(
                self.index,
                format!("{} trailing bytes", self.buf.len() - self.pos),
            ))
        }
    }
}

/// TLS-encode a `MerkleTreeLeaf`; the inverse of [`decode_leaf`], used by the
/// test fixtures and by tools that re-emit archived entries.
pub fn encode_leaf(leaf: &DecodedLeaf) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(LEAF_VERSION_V1);
    out.push(LEAF_TYPE_TIMESTAMPED_ENTRY);
    out.extend_from_slice(&leaf.timestamp_ms.to_be_bytes());
    match &leaf.payload {
        LeafPayload::X509 { certificate } => {
            out.extend_from_slice(&ENTRY_TYPE_X509.to_be_bytes());
            push_opaque24(&mut out, certificate);
        }
        LeafPayload::Precert {
            issuer_key_hash,
            tbs_certificate,
        } => {
            out.extend_from_slice(&ENTRY_TYPE_PRECERT.to_be_bytes());
            out.extend_from_slice(issuer_key_hash);
            push_opaque24(&mut out, tbs_certificate);
        }
    }
    out.extend_from_slice(&(leaf.extensions.len() as u16).to_be_bytes());
    out.extend_from_slice(&leaf.extensions);
    out
}

fn push_opaque24(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len() as u32;
    out.extend_from_slice(&len.to_be_bytes()[1..]);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x509_leaf(timestamp_ms: u64, der: &[u8]) -> Vec<u8> {
        encode_leaf(&DecodedLeaf {
            timestamp_ms,
            payload: LeafPayload::X509 {
                certificate: der.to_vec(),
            },
            extensions: Vec::new(),
        })
    }

    #[test]
    fn decodes_x509_entry() {
        let bytes = x509_leaf(1_469_185_818_000, b"\x30\x82\x01\x00fake-der");
        let decoded = decode_leaf(0, &bytes).unwrap();
        assert_eq!(decoded.timestamp_ms, 1_469_185_818_000);
        assert_eq!(
            decoded.payload,
            LeafPayload::X509 {
                certificate: b"\x30\x82\x01\x00fake-der".to_vec()
            }
        );
        assert!(decoded.extensions.is_empty());
    }

    #[test]
    fn decodes_precert_entry() {
        let leaf = DecodedLeaf {
            timestamp_ms: 99,
            payload: LeafPayload::Precert {
                issuer_key_hash: [0xab; 32],
                tbs_certificate: b"tbs-bytes".to_vec(),
            },
            extensions: b"\x01\x02".to_vec(),
        };
        let decoded = decode_leaf(7, &encode_leaf(&leaf)).unwrap();
        assert_eq!(decoded, leaf);
    }

    #[test]
    fn rejects_unknown_version_and_leaf_type() {
        let mut bytes = x509_leaf(1, b"der");
        bytes[0] = 1;
        assert!(matches!(
            decode_leaf(3, &bytes),
            Err(MirrorError::Decode { index: 3, .. })
        ));

        let mut bytes = x509_leaf(1, b"der");
        bytes[1] = 2;
        assert!(decode_leaf(3, &bytes).is_err());
    }

    #[test]
    fn rejects_unknown_entry_type() {
        let mut bytes = x509_leaf(1, b"der");
        bytes[11] = 9;
        assert!(decode_leaf(0, &bytes).is_err());
    }

    #[test]
    fn rejects_short_buffer_and_trailing_bytes() {
        let bytes = x509_leaf(1, b"der");
        assert!(decode_leaf(0, &bytes[..bytes.len() - 1]).is_err());
        assert!(decode_leaf(0, &[]).is_err());

        let mut padded = bytes;
        padded.push(0);
        assert!(decode_leaf(0, &padded).is_err());
    }

    #[test]
    fn rejects_empty_certificate() {
        let bytes = encode_leaf(&DecodedLeaf {
            timestamp_ms: 1,
            payload: LeafPayload::X509 {
                certificate: Vec::new(),
            },
            extensions: Vec::new(),
        });
        assert!(decode_leaf(0, &bytes).is_err());
    }

    #[test]
    fn entry_hash_matches_rfc_prefix_rule() {
        let bytes = x509_leaf(5, b"cert");
        let entry = Entry::new(12, bytes.clone(), Vec::new());
        assert_eq!(entry.leaf_hash, crate::leaf_hash(&bytes));
        assert_eq!(entry.index, 12);
    }

    #[test]
    fn x509_extra_data_is_a_chain() {
        let decoded = decode_leaf(0, &x509_leaf(1, b"der")).unwrap();

        // chain of two certificates, each opaque24-framed, inside an
        // opaque24 wrapper
        let mut extra = Vec::new();
        let mut inner = Vec::new();
        push_opaque24(&mut inner, b"intermediate");
        push_opaque24(&mut inner, b"root");
        push_opaque24(&mut extra, &inner);

        let chain = decoded.decode_extra(0, &extra).unwrap();
        assert_eq!(chain.pre_certificate, None);
        assert_eq!(chain.chain, vec![b"intermediate".to_vec(), b"root".to_vec()]);
    }

    #[test]
    fn precert_extra_data_carries_the_precertificate() {
        let decoded = decode_leaf(0, &encode_leaf(&DecodedLeaf {
            timestamp_ms: 1,
            payload: LeafPayload::Precert {
                issuer_key_hash: [1; 32],
                tbs_certificate: b"tbs".to_vec(),
            },
            extensions: Vec::new(),
        }))
        .unwrap();

        let mut extra = Vec::new();
        push_opaque24(&mut extra, b"precert-der");
        let mut inner = Vec::new();
        push_opaque24(&mut inner, b"issuer");
        push_opaque24(&mut extra, &inner);

        let chain = decoded.decode_extra(0, &extra).unwrap();
        assert_eq!(chain.pre_certificate, Some(b"precert-der".to_vec()));
        assert_eq!(chain.chain, vec![b"issuer".to_vec()]);
    }

    #[test]
    fn extra_data_trailing_bytes_are_rejected() {
        let decoded = decode_leaf(0, &x509_leaf(1, b"der")).unwrap();
        let mut extra = Vec::new();
        push_opaque24(&mut extra, &[]);
        extra.push(0xff);
        assert!(decoded.decode_extra(0, &extra).is_err());
    }
}
