//! Request pipeline
//!
//! [`Glacier::run`] performs one complete pass for a request:
//!
//! 1. read the chain tip
//! 2. scan receive addresses
//! 3. validate lock candidates and read their balances
//! 4. build the new-lock and unlock drafts
//! 5. sign and finalize both
//!
//! Nothing is broadcast by `run`. [`Glacier::broadcast`] submits the signed
//! transactions afterwards, so a signing failure can never leave one of the
//! two transactions on the network without the other being ready.

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Network, Transaction, Txid};
use glacier_chain::{ChainError, ChainSource};
use glacier_core::WalletKeys;
use serde::Serialize;
use thiserror::Error;

use crate::draft::{DraftError, LockParams, TxBuilder};
use crate::registry::LockRegistry;
use crate::scan::ChainScanner;
use crate::sign::{SignError, Signer};

#[derive(Error, Debug)]
pub enum GlacierError {
    #[error("Wallet is on {wallet} but chain source serves {chain}")]
    NetworkMismatch { wallet: Network, chain: Network },

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Draft error: {0}")]
    Draft(#[from] DraftError),

    #[error("Signing error: {0}")]
    Sign(#[from] SignError),

    #[error("Broadcast of {txid} rejected: {reason}")]
    BroadcastRejected { txid: Txid, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AddressReport {
    pub index: u32,
    pub path: String,
    pub address: String,
    pub used: bool,
    pub balance_sats: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockReport {
    pub lock_height: u32,
    pub address: String,
    pub balance_sats: u64,
    pub spendable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewLockReport {
    pub lock_height: u32,
    pub address: String,
    pub amount_sats: u64,
    pub inputs: usize,
    pub draft_psbt: String,
    pub signed_tx: String,
    pub txid: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnlockReport {
    pub locktime: u32,
    pub lock_heights: Vec<u32>,
    pub inputs: usize,
    pub amount_sats: u64,
    pub destination: String,
    pub draft_psbt: String,
    pub signed_tx: String,
    pub txid: String,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct GlacierReport {
    pub network: String,
    pub xpub: String,
    pub current_height: u32,
    pub addresses: Vec<AddressReport>,
    pub locks: Vec<LockReport>,
    pub new_lock: Option<NewLockReport>,
    pub unlock: Option<UnlockReport>,
    /// Receive indices skipped after chain errors
    pub skipped_addresses: Vec<u32>,
    /// Txids accepted by the network
    pub broadcast: Vec<String>,
    #[serde(skip)]
    pub signed: Vec<Transaction>,
}

pub struct Glacier<'a> {
    keys: &'a WalletKeys,
    params: LockParams,
}

impl<'a> Glacier<'a> {
    pub fn new(keys: &'a WalletKeys, params: LockParams) -> Self {
        Self { keys, params }
    }

    /// Run the pipeline over at most `count` receive addresses.
    pub fn run(&self, chain: &dyn ChainSource, count: u32) -> Result<GlacierReport, GlacierError> {
        self.params.validate()?;
        if chain.network() != self.keys.network() {
            return Err(GlacierError::NetworkMismatch {
                wallet: self.keys.network(),
                chain: chain.network(),
            });
        }

        let current_height = chain.current_height()?;
        log::info!("Running Glacier at height {} (count {})", current_height, count);

        let scan = ChainScanner::new(self.keys, chain).scan(count);

        let registry = LockRegistry::new(self.keys);
        let descriptors = registry.validate_all(&scan.candidates);
        let locks = registry.status(chain, descriptors, current_height);

        let builder = TxBuilder::new(self.keys, self.params);
        let new_lock = builder.build_new_lock(&scan.funding, current_height)?;
        let destination = scan.first_unused().map(|a| &a.address);
        let unlock = builder.build_unlock(chain, &locks, destination, current_height)?;

        let signer = Signer::new(self.keys);
        let mut signed = Vec::new();

        let new_lock_report = match new_lock {
            Some(draft) => {
                let draft_psbt = draft.draft.to_hex();
                let inputs = draft.draft.input_count();
                let tx = signer.sign_and_finalize(draft.draft)?;
                let report = NewLockReport {
                    lock_height: draft.lock.lock_height,
                    address: draft.lock.lock_address.to_string(),
                    amount_sats: draft.amount.to_sat(),
                    inputs,
                    draft_psbt,
                    signed_tx: serialize_hex(&tx),
                    txid: tx.compute_txid().to_string(),
                };
                signed.push(tx);
                Some(report)
            }
            None => None,
        };

        let unlock_report = match unlock {
            Some(draft) => {
                let draft_psbt = draft.draft.to_hex();
                let inputs = draft.draft.input_count();
                let locktime = draft.draft.lock_time().to_consensus_u32();
                let tx = signer.sign_and_finalize(draft.draft)?;
                let report = UnlockReport {
                    locktime,
                    lock_heights: draft.lock_heights,
                    inputs,
                    amount_sats: draft.amount.to_sat(),
                    destination: draft.destination.to_string(),
                    draft_psbt,
                    signed_tx: serialize_hex(&tx),
                    txid: tx.compute_txid().to_string(),
                };
                signed.push(tx);
                Some(report)
            }
            None => None,
        };

        Ok(GlacierReport {
            network: self.keys.network().to_string(),
            xpub: self.keys.account_xpub().to_string(),
            current_height,
            addresses: scan
                .addresses
                .iter()
                .map(|a| AddressReport {
                    index: a.index,
                    path: a.path.clone(),
                    address: a.address.to_string(),
                    used: a.used,
                    balance_sats: a.balance.to_sat(),
                })
                .collect(),
            locks: locks
                .iter()
                .map(|l| LockReport {
                    lock_height: l.lock_height(),
                    address: l.address().to_string(),
                    balance_sats: l.balance.to_sat(),
                    spendable: l.spendable,
                })
                .collect(),
            new_lock: new_lock_report,
            unlock: unlock_report,
            skipped_addresses: scan.skipped,
            broadcast: Vec::new(),
            signed,
        })
    }

    /// Submit every signed transaction in `report`, in order.
    ///
    /// The first rejection stops the submission and is returned; nothing is
    /// retried.
    pub fn broadcast(
        &self,
        chain: &dyn ChainSource,
        report: &mut GlacierReport,
    ) -> Result<Vec<Txid>, GlacierError> {
        let mut accepted = Vec::new();
        for tx in &report.signed {
            let txid = tx.compute_txid();
            match chain.broadcast(tx) {
                Ok(id) => {
                    log::info!("Broadcast {}", id);
                    report.broadcast.push(id.to_string());
                    accepted.push(id);
                }
                Err(e) => {
                    log::warn!("Broadcast of {} rejected: {}", txid, e);
                    return Err(GlacierError::BroadcastRejected {
                        txid,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(accepted)
    }
}
