//! Glacier chain-data access
//!
//! Everything Glacier needs to know about the chain goes through
//! [`ChainSource`]:
//! - address usage and balance (scanning the receive branch)
//! - UTXOs and history per address (gathering inputs, finding lock transactions)
//! - full previous transactions (legacy P2SH spends)
//! - block height and broadcasting
//!
//! Two backends ship with the crate: [`ElectrumClient`] for real networks and
//! [`MemoryChain`], a deterministic in-memory ledger for tests and demos.
//!
//! All calls are blocking. A request owns its client; nothing is cached across
//! requests.

pub mod electrum;
pub mod memory;

pub use electrum::{default_server, ElectrumClient};
pub use memory::MemoryChain;

use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Transaction, Txid};
use thiserror::Error;

/// Errors from chain-data operations
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Electrum protocol error: {0}")]
    Protocol(#[from] electrum_client::Error),

    #[error("Transaction not found: {0}")]
    TxNotFound(Txid),

    #[error("Broadcast failed: {0}")]
    BroadcastFailed(String),

    #[error("Chain data unavailable for {0}")]
    Unavailable(String),
}

/// Usage summary for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressInfo {
    /// At least one transaction (confirmed or mempool) touches the address
    pub used: bool,
    /// Funded minus spent, never negative
    pub balance: Amount,
}

/// A UTXO (unspent transaction output)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// The outpoint (txid:vout)
    pub outpoint: OutPoint,
    /// Value in satoshis
    pub value: Amount,
}

/// Standard output template of a decoded output script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    OpReturn,
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    NonStandard,
}

impl OutputKind {
    pub fn classify(script: &bitcoin::Script) -> Self {
        if script.is_op_return() {
            OutputKind::OpReturn
        } else if script.is_p2pkh() {
            OutputKind::P2pkh
        } else if script.is_p2sh() {
            OutputKind::P2sh
        } else if script.is_p2wpkh() {
            OutputKind::P2wpkh
        } else if script.is_p2wsh() {
            OutputKind::P2wsh
        } else if script.is_p2tr() {
            OutputKind::P2tr
        } else {
            OutputKind::NonStandard
        }
    }
}

/// One output of a [`ChainTransaction`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutput {
    pub kind: OutputKind,
    pub script_pubkey: ScriptBuf,
    /// Address for the configured network, when the script has one
    pub address: Option<Address>,
    pub value: Amount,
}

/// A transaction with its outputs decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub txid: Txid,
    pub outputs: Vec<ChainOutput>,
}

impl ChainTransaction {
    /// Decode the outputs of `tx` for `network`.
    pub fn from_transaction(tx: &Transaction, network: Network) -> Self {
        let outputs = tx
            .output
            .iter()
            .map(|out| ChainOutput {
                kind: OutputKind::classify(&out.script_pubkey),
                script_pubkey: out.script_pubkey.clone(),
                address: Address::from_script(&out.script_pubkey, network).ok(),
                value: out.value,
            })
            .collect();

        Self {
            txid: tx.compute_txid(),
            outputs,
        }
    }
}

/// Chain-data collaborator.
///
/// Object-safe so a request can hold any backend as `&dyn ChainSource`.
pub trait ChainSource {
    /// Network the backend serves
    fn network(&self) -> Network;

    /// Current chain tip height
    fn current_height(&self) -> Result<u32, ChainError>;

    /// Usage and balance of an address
    fn address_info(&self, address: &Address) -> Result<AddressInfo, ChainError>;

    /// Unspent outputs paying to an address
    fn address_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ChainError>;

    /// Every transaction touching an address, outputs decoded
    fn address_transactions(&self, address: &Address)
        -> Result<Vec<ChainTransaction>, ChainError>;

    /// Full transaction by txid
    fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError>;

    /// Submit a signed transaction. Rejection is an error; never retried.
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError>;
}
