//! Receive-branch scanner
//!
//! Walks receive addresses `0, 1, 2, …` and stops at the first one with no
//! history. Each used address contributes its UTXOs as new-lock inputs and its
//! tagged transactions as lock candidates.
//!
//! The walk is strictly sequential: whether index `i + 1` is visited depends on
//! the usage result of index `i`. There is no gap limit.

use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Txid};
use glacier_chain::{ChainError, ChainSource, ChainTransaction, OutputKind};
use glacier_core::{KeyError, KeyPath, WalletKeys};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::script::{is_lock_marker, parse_lock_marker};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Key derivation failed: {0}")]
    Key(#[from] KeyError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

/// One visited receive address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub index: u32,
    /// Full derivation path, e.g. `m/84'/1'/0'/0/3`
    pub path: String,
    pub address: Address,
    pub used: bool,
    pub balance: Amount,
}

/// A UTXO on a receive address, queued for the new-lock draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingInput {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub path: KeyPath,
    pub script_pubkey: ScriptBuf,
}

/// A tagged transaction awaiting validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockCandidate {
    pub tx: ChainTransaction,
    /// Height read from the discovery tag
    pub lock_height: u32,
}

impl LockCandidate {
    /// Two-output transaction whose tag parses to a height.
    pub fn from_transaction(tx: ChainTransaction) -> Option<Self> {
        if tx.outputs.len() != 2 {
            return None;
        }
        let lock_height = tx
            .outputs
            .iter()
            .find(|o| o.kind == OutputKind::OpReturn && is_lock_marker(&o.script_pubkey))
            .and_then(|o| parse_lock_marker(&o.script_pubkey))?;
        Some(Self { tx, lock_height })
    }
}

/// Everything one scan collected. Partial when addresses were skipped.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub addresses: Vec<DerivedAddress>,
    pub candidates: Vec<LockCandidate>,
    pub funding: Vec<FundingInput>,
    /// Indices whose chain lookups failed
    pub skipped: Vec<u32>,
}

impl ScanReport {
    /// First visited address with no history; the sweep destination.
    pub fn first_unused(&self) -> Option<&DerivedAddress> {
        self.addresses.iter().find(|a| !a.used)
    }

    pub fn funding_total(&self) -> Amount {
        self.funding.iter().map(|f| f.value).sum()
    }
}

pub struct ChainScanner<'a> {
    keys: &'a WalletKeys,
    chain: &'a dyn ChainSource,
}

impl<'a> ChainScanner<'a> {
    pub fn new(keys: &'a WalletKeys, chain: &'a dyn ChainSource) -> Self {
        Self { keys, chain }
    }

    /// Visit at most `count` receive addresses, stopping after the first unused one.
    ///
    /// A chain failure at one index is logged and that index is skipped; the
    /// walk continues with the next index.
    pub fn scan(&self, count: u32) -> ScanReport {
        let mut report = ScanReport::default();
        let mut candidates: BTreeMap<Txid, LockCandidate> = BTreeMap::new();

        for index in 0..count {
            match self.visit(index, &mut report.funding, &mut candidates) {
                Ok(visited) => {
                    let used = visited.used;
                    report.addresses.push(visited);
                    if !used {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Skipping receive address {}: {}", index, e);
                    report.skipped.push(index);
                }
            }
        }

        report.candidates = candidates.into_values().collect();
        log::debug!(
            "Scanned {} addresses: {} funding inputs, {} lock candidates",
            report.addresses.len(),
            report.funding.len(),
            report.candidates.len()
        );
        report
    }

    /// Look up one address. Nothing is committed to the report unless every
    /// lookup for the address succeeds.
    fn visit(
        &self,
        index: u32,
        funding: &mut Vec<FundingInput>,
        candidates: &mut BTreeMap<Txid, LockCandidate>,
    ) -> Result<DerivedAddress, ScanError> {
        let path = KeyPath::receive(index);
        let address = self.keys.receive_address(index)?;
        let info = self.chain.address_info(&address)?;

        let visited = DerivedAddress {
            index,
            path: self.keys.path_string(path),
            address: address.clone(),
            used: info.used,
            balance: info.balance,
        };
        if !info.used {
            return Ok(visited);
        }

        let mut inputs = Vec::new();
        if info.balance > Amount::ZERO {
            let script_pubkey = address.script_pubkey();
            for utxo in self.chain.address_utxos(&address)? {
                inputs.push(FundingInput {
                    outpoint: utxo.outpoint,
                    value: utxo.value,
                    path,
                    script_pubkey: script_pubkey.clone(),
                });
            }
        }

        let mut found = Vec::new();
        for tx in self.chain.address_transactions(&address)? {
            let txid = tx.txid;
            let has_data = tx.outputs.iter().any(|o| o.kind == OutputKind::OpReturn);
            match LockCandidate::from_transaction(tx) {
                Some(candidate) => found.push(candidate),
                None if has_data => log::debug!("Unrecognized OP_RETURN in {}", txid),
                None => {}
            }
        }

        funding.extend(inputs);
        for candidate in found {
            candidates.entry(candidate.tx.txid).or_insert(candidate);
        }
        Ok(visited)
    }
}
