//! Lock script codec
//!
//! Builds and parses the three on-chain artifacts of a Glacier lock:
//!
//! ```text
//! redeem script:  <height> OP_CLTV OP_DROP OP_DUP OP_HASH160 <pkh> OP_EQUALVERIFY OP_CHECKSIG
//! lock address:   P2SH(hash160(redeem script))
//! discovery tag:  OP_RETURN "GLACIER <height>"
//! ```
//!
//! The tag is advisory. It carries no commitment; only re-deriving the redeem
//! script proves a lock belongs to this wallet.

use bitcoin::absolute::LOCK_TIME_THRESHOLD;
use bitcoin::opcodes::all::*;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{Address, Network, PubkeyHash, Script, ScriptBuf};
use glacier_core::{KeyError, KeyPath, WalletKeys};
use thiserror::Error;

/// Leading bytes of every discovery tag payload
pub const LOCK_TAG: &[u8] = b"GLACIER";

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Lock height {0} is not a block height")]
    NotABlockHeight(u32),

    #[error("Key derivation failed: {0}")]
    Key(#[from] KeyError),

    #[error("Redeem script rejected for P2SH: {0}")]
    RedeemScript(String),

    #[error("Push data rejected: {0}")]
    Push(String),
}

/// Redeem script for a lock at `lock_height` owned by `pubkey_hash`.
///
/// The height is pushed minimally (`OP_0`, `OP_1`..`OP_16`, else a script
/// number). No check is made that it is below the height/time threshold.
pub fn build_redeem_script(lock_height: u32, pubkey_hash: &PubkeyHash) -> ScriptBuf {
    Builder::new()
        .push_int(lock_height as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(pubkey_hash)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// Unspendable output tagging a transaction as a lock at `lock_height`.
pub fn build_lock_marker(lock_height: u32) -> Result<ScriptBuf, ScriptError> {
    let text = format!("GLACIER {}", lock_height);
    let data =
        PushBytesBuf::try_from(text.into_bytes()).map_err(|e| ScriptError::Push(e.to_string()))?;
    Ok(ScriptBuf::new_op_return(data))
}

/// P2SH address committing to `redeem_script`.
pub fn lock_address_for(redeem_script: &Script, network: Network) -> Result<Address, ScriptError> {
    Address::p2sh(redeem_script, network).map_err(|e| ScriptError::RedeemScript(e.to_string()))
}

/// Last data push of an OP_RETURN output, if any.
fn marker_payload(script: &Script) -> Option<&[u8]> {
    if !script.is_op_return() {
        return None;
    }
    script
        .instructions()
        .filter_map(|ins| match ins {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes()),
            _ => None,
        })
        .last()
}

/// True iff `script` is an OP_RETURN whose payload starts with `GLACIER`.
pub fn is_lock_marker(script: &Script) -> bool {
    marker_payload(script)
        .map(|payload| payload.starts_with(LOCK_TAG))
        .unwrap_or(false)
}

/// Lock height carried by a discovery tag. Anything malformed yields `None`.
pub fn parse_lock_marker(script: &Script) -> Option<u32> {
    let payload = marker_payload(script)?;
    if !payload.starts_with(LOCK_TAG) {
        return None;
    }

    let text = String::from_utf8_lossy(payload);
    let rest = text.strip_prefix("GLACIER ")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// A lock owned by this wallet.
///
/// Built either fresh for a new lock or while validating a discovered one;
/// both go through [`LockDescriptor::from_parts`] so the redeem script is
/// byte-identical for the same height and key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDescriptor {
    pub lock_height: u32,
    pub owner_pubkey_hash: PubkeyHash,
    pub redeem_script: ScriptBuf,
    pub lock_address: Address,
}

impl LockDescriptor {
    /// Derive the lock at `lock_height` from the wallet's lock branch.
    pub fn derive(keys: &WalletKeys, lock_height: u32) -> Result<Self, ScriptError> {
        if lock_height >= LOCK_TIME_THRESHOLD {
            return Err(ScriptError::NotABlockHeight(lock_height));
        }
        let pubkey_hash = keys.pubkey_hash(KeyPath::lock(lock_height))?;
        Self::from_parts(lock_height, pubkey_hash, keys.network())
    }

    pub fn from_parts(
        lock_height: u32,
        owner_pubkey_hash: PubkeyHash,
        network: Network,
    ) -> Result<Self, ScriptError> {
        let redeem_script = build_redeem_script(lock_height, &owner_pubkey_hash);
        let lock_address = lock_address_for(&redeem_script, network)?;
        Ok(Self {
            lock_height,
            owner_pubkey_hash,
            redeem_script,
            lock_address,
        })
    }

    /// Key path that signs for this lock.
    pub fn key_path(&self) -> KeyPath {
        KeyPath::lock(self.lock_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_keys;
    use bitcoin::hashes::Hash;

    fn pkh(byte: u8) -> PubkeyHash {
        PubkeyHash::from_byte_array([byte; 20])
    }

    #[test]
    fn test_redeem_script_layout() {
        let script = build_redeem_script(150, &pkh(0x11));
        let bytes = script.as_bytes();

        // 150 needs a sign byte: push 2 bytes [0x96, 0x00]
        assert_eq!(&bytes[..3], &[0x02, 0x96, 0x00]);
        assert_eq!(bytes[3], OP_CLTV.to_u8());
        assert_eq!(bytes[4], OP_DROP.to_u8());
        assert_eq!(bytes[5], OP_DUP.to_u8());
        assert_eq!(bytes[6], OP_HASH160.to_u8());
        assert_eq!(bytes[7], 20);
        assert_eq!(&bytes[8..28], &[0x11; 20]);
        assert_eq!(bytes[28], OP_EQUALVERIFY.to_u8());
        assert_eq!(bytes[29], OP_CHECKSIG.to_u8());
        assert_eq!(bytes.len(), 30);
    }

    #[test]
    fn test_small_heights_use_minimal_opcodes() {
        let zero = build_redeem_script(0, &pkh(1));
        assert_eq!(zero.as_bytes()[0], OP_PUSHBYTES_0.to_u8());

        let sixteen = build_redeem_script(16, &pkh(1));
        assert_eq!(sixteen.as_bytes()[0], OP_PUSHNUM_16.to_u8());

        let seventeen = build_redeem_script(17, &pkh(1));
        assert_eq!(&seventeen.as_bytes()[..2], &[0x01, 17]);
    }

    #[test]
    fn test_redeem_script_deterministic() {
        for height in [0, 1, 202, 850_000] {
            let a = build_redeem_script(height, &pkh(7));
            let b = build_redeem_script(height, &pkh(7));
            assert_eq!(a, b);
            assert_eq!(
                lock_address_for(&a, Network::Testnet).unwrap(),
                lock_address_for(&b, Network::Testnet).unwrap()
            );
        }
        assert_ne!(
            build_redeem_script(202, &pkh(7)),
            build_redeem_script(203, &pkh(7))
        );
    }

    #[test]
    fn test_lock_address_is_p2sh_of_redeem() {
        let redeem = build_redeem_script(202, &pkh(9));
        let address = lock_address_for(&redeem, Network::Bitcoin).unwrap();
        assert_eq!(address.script_pubkey(), ScriptBuf::new_p2sh(&redeem.script_hash()));
        assert!(address.to_string().starts_with('3'));
    }

    #[test]
    fn test_marker_roundtrip() {
        for height in [0, 1, 16, 17, 127, 128, 255, 256, 202, 499_999_999, u32::MAX] {
            let marker = build_lock_marker(height).unwrap();
            assert!(marker.is_op_return());
            assert!(is_lock_marker(&marker));
            assert_eq!(parse_lock_marker(&marker), Some(height));
        }
    }

    fn op_return(data: &[u8]) -> ScriptBuf {
        ScriptBuf::new_op_return(PushBytesBuf::try_from(data.to_vec()).unwrap())
    }

    #[test]
    fn test_foreign_op_return_not_marker() {
        assert!(!is_lock_marker(&op_return(b"omni")));
        assert!(!is_lock_marker(&op_return(b"glacier 5")));
        assert_eq!(parse_lock_marker(&op_return(b"omni 5")), None);
    }

    #[test]
    fn test_non_op_return_not_marker() {
        let redeem = build_redeem_script(5, &pkh(1));
        let p2sh = ScriptBuf::new_p2sh(&redeem.script_hash());
        assert!(!is_lock_marker(&p2sh));
        assert_eq!(parse_lock_marker(&p2sh), None);
    }

    #[test]
    fn test_malformed_markers_parse_to_none() {
        // Tagged but no height: recognized as a marker, but not parseable
        let bare = op_return(b"GLACIER");
        assert!(is_lock_marker(&bare));
        assert_eq!(parse_lock_marker(&bare), None);

        assert_eq!(parse_lock_marker(&op_return(b"GLACIER abc")), None);
        assert_eq!(parse_lock_marker(&op_return(b"GLACIER99")), None);
        // Out of u32 range
        assert_eq!(parse_lock_marker(&op_return(b"GLACIER 99999999999")), None);
        // Trailing garbage after digits is ignored
        assert_eq!(parse_lock_marker(&op_return(b"GLACIER 42 extra")), Some(42));
    }

    #[test]
    fn test_descriptor_fresh_matches_parts() {
        let keys = test_keys();
        let fresh = LockDescriptor::derive(&keys, 202).unwrap();
        let pkh = keys.pubkey_hash(KeyPath::lock(202)).unwrap();
        let rebuilt = LockDescriptor::from_parts(202, pkh, keys.network()).unwrap();

        assert_eq!(fresh, rebuilt);
        assert_eq!(
            fresh.lock_address,
            lock_address_for(&fresh.redeem_script, keys.network()).unwrap()
        );
    }

    #[test]
    fn test_descriptor_rejects_timestamps() {
        let keys = test_keys();
        assert!(matches!(
            LockDescriptor::derive(&keys, LOCK_TIME_THRESHOLD),
            Err(ScriptError::NotABlockHeight(_))
        ));
    }
}
