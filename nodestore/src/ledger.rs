//! Ledger headers and their pinned binary framing.

use crate::map::RadixMap;
use alloy_primitives::B256;
use eyre::{eyre, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Hash prefix tag for ledger header objects. Framing is pinned for
/// interop: a header blob is the 4-byte big-endian prefix followed by the
/// canonical ledger-info bytes.
pub const HASH_PREFIX_LEDGER_MASTER: u32 = u32::from_be_bytes(*b"LWR\0");

/// Encoded header length: prefix, seq, close_time, three root hashes.
const HEADER_LEN: usize = 4 + 4 + 8 + 32 * 3;

/// A ledger header: a numbered snapshot referencing an account-state tree
/// and optionally a transaction tree by their root hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerInfo {
    pub seq: u32,
    pub hash: B256,
    pub parent_hash: B256,
    /// State-map root. A valid ledger never has a zero account hash.
    pub account_hash: B256,
    /// Transaction-map root; zero when the ledger carries no transactions.
    pub tx_hash: B256,
    pub close_time: u64,
}

impl LedgerInfo {
    /// Canonical header blob: `[prefix || seq || close_time || parent_hash
    /// || tx_hash || account_hash]`, all fields big-endian.
    pub fn encode_header(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&HASH_PREFIX_LEDGER_MASTER.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.close_time.to_be_bytes());
        out.extend_from_slice(self.parent_hash.as_slice());
        out.extend_from_slice(self.tx_hash.as_slice());
        out.extend_from_slice(self.account_hash.as_slice());
        out
    }

    /// Decode a header blob. The ledger hash is recomputed from the framed
    /// bytes, so a corrupt blob cannot masquerade as the requested ledger.
    pub fn decode_header(data: &[u8]) -> Result<Self> {
        if data.len() != HEADER_LEN {
            return Err(eyre!(
                "ledger header length mismatch: expected {HEADER_LEN}, got {}",
                data.len()
            ));
        }
        let prefix = u32::from_be_bytes(data[0..4].try_into().expect("fixed slice"));
        if prefix != HASH_PREFIX_LEDGER_MASTER {
            return Err(eyre!("unknown hash prefix {prefix:#010x}"));
        }
        let seq = u32::from_be_bytes(data[4..8].try_into().expect("fixed slice"));
        let close_time = u64::from_be_bytes(data[8..16].try_into().expect("fixed slice"));
        let parent_hash = B256::from_slice(&data[16..48]);
        let tx_hash = B256::from_slice(&data[48..80]);
        let account_hash = B256::from_slice(&data[80..112]);
        Ok(Self {
            seq,
            hash: hash_header(data),
            parent_hash,
            account_hash,
            tx_hash,
            close_time,
        })
    }

    /// The ledger hash: digest of the framed header bytes.
    pub fn compute_hash(&self) -> B256 {
        hash_header(&self.encode_header())
    }
}

fn hash_header(framed: &[u8]) -> B256 {
    B256::from_slice(&Sha256::digest(framed))
}

/// A ledger: header plus (when the caller has them resident) the state and
/// transaction maps. Ledgers reassembled from a backend carry only the
/// header; copy sources must carry their maps.
#[derive(Debug, Clone)]
pub struct Ledger {
    info: LedgerInfo,
    state_map: Option<Arc<RadixMap>>,
    tx_map: Option<Arc<RadixMap>>,
}

impl Ledger {
    pub fn new(info: LedgerInfo, state_map: Arc<RadixMap>, tx_map: Option<Arc<RadixMap>>) -> Self {
        Self {
            info,
            state_map: Some(state_map),
            tx_map,
        }
    }

    /// A header-only ledger, as returned by `fetch_ledger`.
    pub fn from_info(info: LedgerInfo) -> Self {
        Self {
            info,
            state_map: None,
            tx_map: None,
        }
    }

    pub fn info(&self) -> &LedgerInfo {
        &self.info
    }

    pub fn state_map(&self) -> Option<&Arc<RadixMap>> {
        self.state_map.as_ref()
    }

    pub fn tx_map(&self) -> Option<&Arc<RadixMap>> {
        self.tx_map.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> LedgerInfo {
        let mut info = LedgerInfo {
            seq: 42,
            hash: B256::ZERO,
            parent_hash: B256::from([1u8; 32]),
            account_hash: B256::from([2u8; 32]),
            tx_hash: B256::from([3u8; 32]),
            close_time: 700_000,
        };
        info.hash = info.compute_hash();
        info
    }

    #[test]
    fn header_round_trip() {
        let info = info();
        let framed = info.encode_header();
        assert_eq!(framed.len(), HEADER_LEN);
        assert_eq!(&framed[0..4], b"LWR\0");

        let decoded = LedgerInfo::decode_header(&framed).expect("decode");
        assert_eq!(decoded, info);
        assert_eq!(decoded.hash, info.compute_hash());
    }

    #[test]
    fn decode_rejects_bad_framing() {
        let info = info();
        let mut framed = info.encode_header();
        framed[0] = b'X';
        assert!(LedgerInfo::decode_header(&framed).is_err());
        assert!(LedgerInfo::decode_header(&framed[..50]).is_err());
    }

    #[test]
    fn corrupt_header_changes_hash() {
        let info = info();
        let mut framed = info.encode_header();
        framed[20] ^= 0xff;
        let decoded = LedgerInfo::decode_header(&framed).expect("decode");
        assert_ne!(decoded.hash, info.hash);
    }
}
