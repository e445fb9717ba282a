//! Lock validation
//!
//! A candidate from the scanner is trusted only after the redeem script for
//! its tagged height is re-derived from this wallet's lock branch and hashes to
//! the exact P2SH address found on chain. Anything else is "not our lock" and
//! is dropped without error.

use bitcoin::{Address, Amount};
use glacier_chain::{ChainSource, OutputKind};
use glacier_core::WalletKeys;
use std::collections::BTreeMap;

use crate::scan::LockCandidate;
use crate::script::LockDescriptor;

/// Balance and maturity of one validated lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub descriptor: LockDescriptor,
    pub balance: Amount,
    /// Current height has reached the lock height
    pub spendable: bool,
}

impl LockStatus {
    pub fn lock_height(&self) -> u32 {
        self.descriptor.lock_height
    }

    pub fn address(&self) -> &Address {
        &self.descriptor.lock_address
    }

    /// Spendable with something to sweep.
    pub fn is_matured(&self) -> bool {
        self.spendable && self.balance > Amount::ZERO
    }
}

pub struct LockRegistry<'a> {
    keys: &'a WalletKeys,
}

impl<'a> LockRegistry<'a> {
    pub fn new(keys: &'a WalletKeys) -> Self {
        Self { keys }
    }

    /// Validate one candidate against the key for its tagged height.
    pub fn validate(&self, candidate: &LockCandidate) -> Option<LockDescriptor> {
        let txid = candidate.tx.txid;
        let outputs = &candidate.tx.outputs;

        if outputs.len() != 2 {
            log::debug!("Discarding {}: {} outputs", txid, outputs.len());
            return None;
        }
        let (tags, others): (Vec<_>, Vec<_>) =
            outputs.iter().partition(|o| o.kind == OutputKind::OpReturn);
        if tags.len() != 1 {
            log::debug!("Discarding {}: {} data outputs", txid, tags.len());
            return None;
        }

        let lock_height = candidate.lock_height;
        let lock_output = others[0];
        let on_chain = match (&lock_output.kind, &lock_output.address) {
            (OutputKind::P2sh, Some(address)) => address,
            _ => {
                log::debug!("Discarding {}: lock output is not P2SH", txid);
                return None;
            }
        };

        let expected = match LockDescriptor::derive(self.keys, lock_height) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                log::debug!("Discarding {}: {}", txid, e);
                return None;
            }
        };

        if expected.lock_address != *on_chain {
            log::debug!(
                "Discarding {}: address {} is not ours for height {}",
                txid,
                on_chain,
                lock_height
            );
            return None;
        }

        Some(expected)
    }

    /// Validate every candidate. One descriptor per lock height, ordered by height.
    pub fn validate_all(&self, candidates: &[LockCandidate]) -> Vec<LockDescriptor> {
        let mut by_height = BTreeMap::new();
        for candidate in candidates {
            if let Some(descriptor) = self.validate(candidate) {
                by_height.entry(descriptor.lock_height).or_insert(descriptor);
            }
        }
        by_height.into_values().collect()
    }

    /// Current balance and maturity of each lock.
    ///
    /// A lock whose balance lookup fails is logged and left out.
    pub fn status(
        &self,
        chain: &dyn ChainSource,
        descriptors: Vec<LockDescriptor>,
        current_height: u32,
    ) -> Vec<LockStatus> {
        let mut statuses = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            match chain.address_info(&descriptor.lock_address) {
                Ok(info) => statuses.push(LockStatus {
                    spendable: current_height >= descriptor.lock_height,
                    balance: info.balance,
                    descriptor,
                }),
                Err(e) => log::warn!(
                    "Skipping lock at height {}: {}",
                    descriptor.lock_height,
                    e
                ),
            }
        }
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{build_lock_marker, build_redeem_script, lock_address_for};
    use crate::test_utils::{lock_transaction, op_return, raw_transaction, test_keys};
    use bitcoin::hashes::Hash;
    use bitcoin::{Network, OutPoint, PubkeyHash, ScriptBuf, TxOut, Txid};
    use glacier_chain::{ChainTransaction, MemoryChain};

    fn spend() -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([0xAA; 32]),
            vout: 0,
        }
    }

    fn candidate(tx: &bitcoin::Transaction) -> LockCandidate {
        LockCandidate::from_transaction(ChainTransaction::from_transaction(tx, Network::Regtest))
            .unwrap()
    }

    /// Candidate with an arbitrary height, bypassing the tag checks.
    fn tagged(tx: &bitcoin::Transaction, lock_height: u32) -> LockCandidate {
        LockCandidate {
            tx: ChainTransaction::from_transaction(tx, Network::Regtest),
            lock_height,
        }
    }

    #[test]
    fn test_own_lock_validates() {
        let keys = test_keys();
        let lock = LockDescriptor::derive(&keys, 150).unwrap();
        let tx = lock_transaction(spend(), &lock, Amount::from_sat(3000));

        let validated = LockRegistry::new(&keys).validate(&candidate(&tx)).unwrap();
        assert_eq!(validated, lock);
        assert_eq!(validated.redeem_script, lock.redeem_script);
    }

    #[test]
    fn test_output_order_does_not_matter() {
        let keys = test_keys();
        let lock = LockDescriptor::derive(&keys, 150).unwrap();
        let mut tx = lock_transaction(spend(), &lock, Amount::from_sat(3000));
        tx.output.reverse();

        assert!(LockRegistry::new(&keys).validate(&candidate(&tx)).is_some());
    }

    #[test]
    fn test_foreign_key_rejected() {
        let keys = test_keys();
        // Same height, someone else's key
        let foreign = LockDescriptor::from_parts(
            150,
            PubkeyHash::from_byte_array([0x42; 20]),
            Network::Regtest,
        )
        .unwrap();
        let tx = lock_transaction(spend(), &foreign, Amount::from_sat(3000));

        assert!(LockRegistry::new(&keys).validate(&candidate(&tx)).is_none());
    }

    #[test]
    fn test_tag_height_mismatch_rejected() {
        let keys = test_keys();
        let lock = LockDescriptor::derive(&keys, 150).unwrap();
        let tx = raw_transaction(
            spend(),
            vec![
                TxOut {
                    value: Amount::from_sat(3000),
                    script_pubkey: lock.lock_address.script_pubkey(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: build_lock_marker(151).unwrap(),
                },
            ],
        );

        let found = candidate(&tx);
        assert_eq!(found.lock_height, 151);
        assert!(LockRegistry::new(&keys).validate(&found).is_none());
    }

    #[test]
    fn test_candidate_height_drives_validation() {
        let keys = test_keys();
        let lock = LockDescriptor::derive(&keys, 150).unwrap();
        let tx = lock_transaction(spend(), &lock, Amount::from_sat(3000));
        let registry = LockRegistry::new(&keys);

        assert_eq!(registry.validate(&tagged(&tx, 150)), Some(lock));
        assert!(registry.validate(&tagged(&tx, 149)).is_none());
    }

    #[test]
    fn test_key_reuse_across_branch_rejected() {
        // Right height, but the pubkey hash comes from the receive branch
        let keys = test_keys();
        let pkh = keys
            .pubkey_hash(glacier_core::KeyPath::receive(150))
            .unwrap();
        let redeem = build_redeem_script(150, &pkh);
        let address = lock_address_for(&redeem, Network::Regtest).unwrap();
        let tx = raw_transaction(
            spend(),
            vec![
                TxOut {
                    value: Amount::from_sat(3000),
                    script_pubkey: address.script_pubkey(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: build_lock_marker(150).unwrap(),
                },
            ],
        );

        assert!(LockRegistry::new(&keys).validate(&candidate(&tx)).is_none());
    }

    #[test]
    fn test_malformed_shapes_rejected() {
        let keys = test_keys();
        let lock = LockDescriptor::derive(&keys, 150).unwrap();
        let registry = LockRegistry::new(&keys);

        // Two data outputs
        let double_tag = raw_transaction(
            spend(),
            vec![
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: build_lock_marker(150).unwrap(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: build_lock_marker(150).unwrap(),
                },
            ],
        );
        assert!(registry.validate(&candidate(&double_tag)).is_none());

        // Unparseable tag never becomes a candidate
        let mut bad_tag = lock_transaction(spend(), &lock, Amount::from_sat(3000));
        bad_tag.output[1].script_pubkey = op_return(b"GLACIER soon");
        assert!(LockCandidate::from_transaction(ChainTransaction::from_transaction(
            &bad_tag,
            Network::Regtest
        ))
        .is_none());

        // Lock output is not P2SH
        let mut segwit = lock_transaction(spend(), &lock, Amount::from_sat(3000));
        segwit.output[0].script_pubkey =
            ScriptBuf::new_p2wsh(&lock.redeem_script.wscript_hash());
        assert!(registry.validate(&candidate(&segwit)).is_none());

        // Single output
        let mut lonely = lock_transaction(spend(), &lock, Amount::from_sat(3000));
        lonely.output.truncate(1);
        assert!(registry.validate(&tagged(&lonely, 150)).is_none());
    }

    #[test]
    fn test_validate_all_dedupes_by_height() {
        let keys = test_keys();
        let lock_150 = LockDescriptor::derive(&keys, 150).unwrap();
        let lock_100 = LockDescriptor::derive(&keys, 100).unwrap();

        let first = lock_transaction(spend(), &lock_150, Amount::from_sat(3000));
        let second = lock_transaction(
            OutPoint {
                txid: Txid::from_byte_array([0xBB; 32]),
                vout: 0,
            },
            &lock_150,
            Amount::from_sat(2000),
        );
        let third = lock_transaction(spend(), &lock_100, Amount::from_sat(1000));

        let validated = LockRegistry::new(&keys).validate_all(&[
            candidate(&first),
            candidate(&second),
            candidate(&third),
        ]);
        let heights: Vec<u32> = validated.iter().map(|d| d.lock_height).collect();
        assert_eq!(heights, vec![100, 150]);
    }

    #[test]
    fn test_status_reports_balance_and_maturity() {
        let keys = test_keys();
        let mut chain = MemoryChain::new(Network::Regtest, 150);
        let mature = LockDescriptor::derive(&keys, 150).unwrap();
        let pending = LockDescriptor::derive(&keys, 151).unwrap();
        let empty = LockDescriptor::derive(&keys, 100).unwrap();
        chain.fund(&mature.lock_address, Amount::from_sat(3000));
        chain.fund(&pending.lock_address, Amount::from_sat(4000));

        let statuses = LockRegistry::new(&keys).status(
            &chain,
            vec![empty.clone(), mature.clone(), pending.clone()],
            150,
        );

        assert_eq!(statuses.len(), 3);
        assert!(statuses[0].spendable);
        assert_eq!(statuses[0].balance, Amount::ZERO);
        assert!(!statuses[0].is_matured());

        assert!(statuses[1].is_matured());
        assert_eq!(statuses[1].balance, Amount::from_sat(3000));

        assert!(!statuses[2].spendable);
        assert!(!statuses[2].is_matured());
    }

    #[test]
    fn test_status_skips_failed_lookup() {
        let keys = test_keys();
        let mut chain = MemoryChain::new(Network::Regtest, 200);
        let lock = LockDescriptor::derive(&keys, 150).unwrap();
        chain.fail_address(&lock.lock_address);

        let statuses = LockRegistry::new(&keys).status(&chain, vec![lock], 200);
        assert!(statuses.is_empty());
    }
}
