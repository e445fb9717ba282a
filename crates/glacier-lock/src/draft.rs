//! Draft construction
//!
//! Two independent unsigned drafts per request:
//!
//! - **New lock**: every receive-address UTXO found by the scan, swept into the
//!   lock address for `current height + lock_offset`, followed by the discovery
//!   tag output.
//! - **Unlock**: every matured lock with a balance, swept to the first unused
//!   receive address. Inputs carry the full previous transaction because the
//!   redeem script is spent through a legacy script-sig.
//!
//! Drafts are PSBTs plus one [`InputTemplate`] per input telling the signer
//! which key to use and how to finalize.

use bitcoin::absolute::LockTime;
use bitcoin::psbt::Psbt;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use glacier_chain::ChainSource;
use glacier_core::{KeyError, KeyPath, WalletKeys};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::registry::LockStatus;
use crate::scan::FundingInput;
use crate::script::{build_lock_marker, LockDescriptor, ScriptError};

/// Flat fee taken from every draft
pub const DEFAULT_FEE: Amount = Amount::from_sat(1000);

/// Blocks between the current tip and a new lock's height
pub const DEFAULT_LOCK_OFFSET: u32 = 6;

pub const MIN_LOCK_OFFSET: u32 = 2;
pub const MAX_LOCK_OFFSET: u32 = 6;

#[derive(Error, Debug)]
pub enum DraftError {
    #[error("Invalid draft parameters: {0}")]
    InvalidParams(String),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Key derivation failed: {0}")]
    Key(#[from] KeyError),

    #[error("PSBT creation failed: {0}")]
    PsbtError(String),

    #[error("No unused receive address to sweep matured locks to")]
    NoSweepAddress,

    #[error("Insufficient funds: need more than {needed}, have {available}")]
    InsufficientFunds { needed: Amount, available: Amount },

    #[error("Height {0} cannot be used as a lock time")]
    InvalidHeight(u32),

    #[error("Previous transaction does not match UTXO {0}")]
    PrevoutMismatch(OutPoint),
}

/// Fee and lock-height policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockParams {
    pub fee: Amount,
    pub lock_offset: u32,
}

impl Default for LockParams {
    fn default() -> Self {
        Self {
            fee: DEFAULT_FEE,
            lock_offset: DEFAULT_LOCK_OFFSET,
        }
    }
}

impl LockParams {
    pub fn validate(&self) -> Result<(), DraftError> {
        if self.fee == Amount::ZERO {
            return Err(DraftError::InvalidParams("fee must be positive".into()));
        }
        if !(MIN_LOCK_OFFSET..=MAX_LOCK_OFFSET).contains(&self.lock_offset) {
            return Err(DraftError::InvalidParams(format!(
                "lock offset {} outside {}..={}",
                self.lock_offset, MIN_LOCK_OFFSET, MAX_LOCK_OFFSET
            )));
        }
        Ok(())
    }
}

/// How an input is signed and finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputTemplate {
    /// P2WPKH receive output: witness `[sig, pubkey]`
    SingleKeyWitness { path: KeyPath },
    /// P2SH lock output: script-sig `[sig, pubkey, redeem script]`
    CltvP2sh {
        path: KeyPath,
        lock_height: u32,
        redeem_script: ScriptBuf,
    },
}

impl InputTemplate {
    pub fn path(&self) -> KeyPath {
        match self {
            InputTemplate::SingleKeyWitness { path } => *path,
            InputTemplate::CltvP2sh { path, .. } => *path,
        }
    }
}

/// An unsigned transaction with per-input signing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedDraft {
    pub psbt: Psbt,
    /// One entry per input, same order
    pub templates: Vec<InputTemplate>,
}

impl UnsignedDraft {
    /// Base16 PSBT serialization.
    pub fn to_hex(&self) -> String {
        self.psbt.serialize_hex()
    }

    pub fn lock_time(&self) -> LockTime {
        self.psbt.unsigned_tx.lock_time
    }

    pub fn input_count(&self) -> usize {
        self.psbt.unsigned_tx.input.len()
    }
}

#[derive(Debug, Clone)]
pub struct NewLockDraft {
    pub lock: LockDescriptor,
    /// Value sent to the lock address
    pub amount: Amount,
    pub draft: UnsignedDraft,
}

#[derive(Debug, Clone)]
pub struct UnlockDraft {
    /// Heights of the locks swept, ascending
    pub lock_heights: Vec<u32>,
    pub destination: Address,
    /// Value sent to the destination
    pub amount: Amount,
    pub draft: UnsignedDraft,
}

pub struct TxBuilder<'a> {
    keys: &'a WalletKeys,
    params: LockParams,
}

impl<'a> TxBuilder<'a> {
    pub fn new(keys: &'a WalletKeys, params: LockParams) -> Self {
        Self { keys, params }
    }

    /// Draft moving every funding input into a new lock.
    ///
    /// Returns `None` when there is nothing to lock: no inputs, or a lock
    /// value that would not cover the fee of sweeping it later.
    pub fn build_new_lock(
        &self,
        funding: &[FundingInput],
        current_height: u32,
    ) -> Result<Option<NewLockDraft>, DraftError> {
        if funding.is_empty() {
            return Ok(None);
        }

        let total: Amount = funding.iter().map(|f| f.value).sum();
        let amount = match total.checked_sub(self.params.fee) {
            Some(amount) if amount > self.params.fee => amount,
            _ => {
                log::info!(
                    "Not locking {} sat: does not cover two {} sat fees",
                    total.to_sat(),
                    self.params.fee.to_sat()
                );
                return Ok(None);
            }
        };

        let lock_height = current_height
            .checked_add(self.params.lock_offset)
            .ok_or(DraftError::InvalidHeight(current_height))?;
        let lock = LockDescriptor::derive(self.keys, lock_height)?;

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: funding
                .iter()
                .map(|f| unsigned_input(f.outpoint, Sequence::MAX))
                .collect(),
            output: vec![
                TxOut {
                    value: amount,
                    script_pubkey: lock.lock_address.script_pubkey(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: build_lock_marker(lock_height)?,
                },
            ],
        };

        let mut psbt =
            Psbt::from_unsigned_tx(tx).map_err(|e| DraftError::PsbtError(e.to_string()))?;
        let mut templates = Vec::with_capacity(funding.len());

        for (i, input) in funding.iter().enumerate() {
            psbt.inputs[i].witness_utxo = Some(TxOut {
                value: input.value,
                script_pubkey: input.script_pubkey.clone(),
            });
            self.annotate_origin(&mut psbt, i, input.path)?;
            templates.push(InputTemplate::SingleKeyWitness { path: input.path });
        }

        log::info!(
            "New lock draft: {} sat from {} inputs to {} (height {})",
            amount.to_sat(),
            funding.len(),
            lock.lock_address,
            lock_height
        );

        Ok(Some(NewLockDraft {
            lock,
            amount,
            draft: UnsignedDraft { psbt, templates },
        }))
    }

    /// Draft sweeping every matured lock to `destination`.
    ///
    /// Returns `None` when no lock is both spendable and funded. Locks whose
    /// UTXOs or previous transactions cannot be fetched are left out.
    pub fn build_unlock(
        &self,
        chain: &dyn ChainSource,
        locks: &[LockStatus],
        destination: Option<&Address>,
        current_height: u32,
    ) -> Result<Option<UnlockDraft>, DraftError> {
        let matured: Vec<&LockStatus> = locks
            .iter()
            .filter(|l| l.is_matured() && l.lock_height() <= current_height)
            .collect();
        if matured.is_empty() {
            return Ok(None);
        }
        let destination = destination.ok_or(DraftError::NoSweepAddress)?;

        let mut inputs: Vec<(Transaction, OutPoint, &LockDescriptor)> = Vec::new();
        let mut lock_heights = Vec::new();
        for lock in matured {
            match self.collect_lock_inputs(chain, &lock.descriptor) {
                Ok(found) if found.is_empty() => {
                    log::debug!("Lock at height {} has no UTXOs", lock.lock_height());
                }
                Ok(found) => {
                    lock_heights.push(lock.lock_height());
                    inputs.extend(found.into_iter().map(|(tx, op)| (tx, op, &lock.descriptor)));
                }
                Err(CollectError::Chain(e)) => {
                    log::warn!("Skipping lock at height {}: {}", lock.lock_height(), e);
                }
                Err(CollectError::Draft(e)) => return Err(e),
            }
        }
        if inputs.is_empty() {
            return Ok(None);
        }

        let max_height = inputs
            .iter()
            .map(|(_, _, d)| d.lock_height)
            .max()
            .unwrap_or_default();
        let lock_time =
            LockTime::from_height(max_height).map_err(|_| DraftError::InvalidHeight(max_height))?;

        let total: Amount = inputs
            .iter()
            .map(|(prev, op, _)| prev.output[op.vout as usize].value)
            .sum();
        let amount = match total.checked_sub(self.params.fee) {
            Some(amount) if amount > Amount::ZERO => amount,
            _ => {
                return Err(DraftError::InsufficientFunds {
                    needed: self.params.fee,
                    available: total,
                })
            }
        };

        let tx = Transaction {
            version: Version::TWO,
            lock_time,
            input: inputs
                .iter()
                .map(|(_, op, _)| unsigned_input(*op, Sequence::ENABLE_LOCKTIME_NO_RBF))
                .collect(),
            output: vec![TxOut {
                value: amount,
                script_pubkey: destination.script_pubkey(),
            }],
        };

        let mut psbt =
            Psbt::from_unsigned_tx(tx).map_err(|e| DraftError::PsbtError(e.to_string()))?;
        let mut templates = Vec::with_capacity(inputs.len());

        for (i, (prev, _, descriptor)) in inputs.into_iter().enumerate() {
            psbt.inputs[i].non_witness_utxo = Some(prev);
            psbt.inputs[i].redeem_script = Some(descriptor.redeem_script.clone());
            self.annotate_origin(&mut psbt, i, descriptor.key_path())?;
            templates.push(InputTemplate::CltvP2sh {
                path: descriptor.key_path(),
                lock_height: descriptor.lock_height,
                redeem_script: descriptor.redeem_script.clone(),
            });
        }

        lock_heights.sort_unstable();
        log::info!(
            "Unlock draft: {} sat from locks {:?} to {} (locktime {})",
            amount.to_sat(),
            lock_heights,
            destination,
            max_height
        );

        Ok(Some(UnlockDraft {
            lock_heights,
            destination: destination.clone(),
            amount,
            draft: UnsignedDraft { psbt, templates },
        }))
    }

    /// UTXOs of one lock with their full previous transactions.
    fn collect_lock_inputs(
        &self,
        chain: &dyn ChainSource,
        lock: &LockDescriptor,
    ) -> Result<Vec<(Transaction, OutPoint)>, CollectError> {
        let expected = lock.lock_address.script_pubkey();
        let mut found = Vec::new();

        for utxo in chain.address_utxos(&lock.lock_address)? {
            let prev = chain.get_transaction(&utxo.outpoint.txid)?;
            let matches = prev
                .output
                .get(utxo.outpoint.vout as usize)
                .map(|out| out.script_pubkey == expected && out.value == utxo.value)
                .unwrap_or(false);
            if !matches {
                return Err(CollectError::Draft(DraftError::PrevoutMismatch(
                    utxo.outpoint,
                )));
            }
            found.push((prev, utxo.outpoint));
        }
        Ok(found)
    }

    fn annotate_origin(
        &self,
        psbt: &mut Psbt,
        index: usize,
        path: KeyPath,
    ) -> Result<(), DraftError> {
        let pubkey = self.keys.public_key(path)?;
        let origin = self.keys.key_origin(path)?;
        let mut derivation = BTreeMap::new();
        derivation.insert(pubkey, origin);
        psbt.inputs[index].bip32_derivation = derivation;
        Ok(())
    }
}

enum CollectError {
    Chain(glacier_chain::ChainError),
    Draft(DraftError),
}

impl From<glacier_chain::ChainError> for CollectError {
    fn from(e: glacier_chain::ChainError) -> Self {
        CollectError::Chain(e)
    }
}

fn unsigned_input(previous_output: OutPoint, sequence: Sequence) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence,
        witness: Witness::default(),
    }
}
