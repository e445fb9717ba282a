//! In-memory ledger implementing [`ChainSource`].
//!
//! Deterministic and offline. Transactions applied to the ledger update the
//! UTXO set and the per-script history the same way an indexer would, so the
//! scanner sees the same shapes it gets from Electrum.

use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    absolute::LockTime, Address, Amount, Network, OutPoint, ScriptBuf, Transaction, TxIn, TxOut,
    Txid,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::{AddressInfo, ChainError, ChainSource, ChainTransaction, Utxo};

pub struct MemoryChain {
    network: Network,
    height: u32,
    transactions: HashMap<Txid, Transaction>,
    unspent: BTreeMap<OutPoint, (ScriptBuf, Amount)>,
    history: HashMap<ScriptBuf, Vec<Txid>>,
    failing: HashSet<ScriptBuf>,
    reject_broadcasts: bool,
    funding_nonce: u32,
    queried: Mutex<Vec<Address>>,
    broadcasts: Mutex<Vec<Transaction>>,
}

impl MemoryChain {
    pub fn new(network: Network, height: u32) -> Self {
        Self {
            network,
            height,
            transactions: HashMap::new(),
            unspent: BTreeMap::new(),
            history: HashMap::new(),
            failing: HashSet::new(),
            reject_broadcasts: false,
            funding_nonce: 0,
            queried: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_height(&mut self, height: u32) {
        self.height = height;
    }

    /// Pay `value` to `address` from an external source. Returns the new outpoint.
    pub fn fund(&mut self, address: &Address, value: Amount) -> OutPoint {
        self.funding_nonce += 1;
        let mut source = [0xEE; 32];
        source[..4].copy_from_slice(&self.funding_nonce.to_le_bytes());

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array(source),
                    vout: 0,
                },
                ..Default::default()
            }],
            output: vec![TxOut {
                value,
                script_pubkey: address.script_pubkey(),
            }],
        };

        let txid = self.apply(tx);
        OutPoint { txid, vout: 0 }
    }

    /// Apply a transaction: spend its inputs, create its outputs, and record it
    /// in the history of every script it touches.
    pub fn apply(&mut self, tx: Transaction) -> Txid {
        let txid = tx.compute_txid();

        for input in &tx.input {
            if let Some((script, _)) = self.unspent.remove(&input.previous_output) {
                self.record(script, txid);
            }
        }

        for (vout, output) in tx.output.iter().enumerate() {
            if output.script_pubkey.is_op_return() {
                continue;
            }
            self.unspent.insert(
                OutPoint {
                    txid,
                    vout: vout as u32,
                },
                (output.script_pubkey.clone(), output.value),
            );
            self.record(output.script_pubkey.clone(), txid);
        }

        self.transactions.insert(txid, tx);
        txid
    }

    /// Every chain call for `address` fails from now on.
    pub fn fail_address(&mut self, address: &Address) {
        self.failing.insert(address.script_pubkey());
    }

    pub fn reject_broadcasts(&mut self, reject: bool) {
        self.reject_broadcasts = reject;
    }

    /// Addresses whose usage was queried, in query order.
    pub fn queried_addresses(&self) -> Vec<Address> {
        self.queried
            .lock()
            .map(|q| q.clone())
            .unwrap_or_default()
    }

    /// Transactions accepted by [`ChainSource::broadcast`], in order.
    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcasts
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    fn record(&mut self, script: ScriptBuf, txid: Txid) {
        let entries = self.history.entry(script).or_default();
        if !entries.contains(&txid) {
            entries.push(txid);
        }
    }

    fn check(&self, address: &Address) -> Result<ScriptBuf, ChainError> {
        let script = address.script_pubkey();
        if self.failing.contains(&script) {
            return Err(ChainError::Unavailable(address.to_string()));
        }
        Ok(script)
    }
}

impl ChainSource for MemoryChain {
    fn network(&self) -> Network {
        self.network
    }

    fn current_height(&self) -> Result<u32, ChainError> {
        Ok(self.height)
    }

    fn address_info(&self, address: &Address) -> Result<AddressInfo, ChainError> {
        if let Ok(mut queried) = self.queried.lock() {
            queried.push(address.clone());
        }
        let script = self.check(address)?;

        let used = self
            .history
            .get(&script)
            .map(|h| !h.is_empty())
            .unwrap_or(false);
        let balance = self
            .unspent
            .values()
            .filter(|(s, _)| *s == script)
            .map(|(_, v)| *v)
            .sum();

        Ok(AddressInfo { used, balance })
    }

    fn address_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ChainError> {
        let script = self.check(address)?;

        Ok(self
            .unspent
            .iter()
            .filter(|(_, (s, _))| *s == script)
            .map(|(outpoint, (_, value))| Utxo {
                outpoint: *outpoint,
                value: *value,
            })
            .collect())
    }

    fn address_transactions(
        &self,
        address: &Address,
    ) -> Result<Vec<ChainTransaction>, ChainError> {
        let script = self.check(address)?;

        let txids = self.history.get(&script).cloned().unwrap_or_default();
        txids
            .iter()
            .map(|txid| {
                let tx = self.get_transaction(txid)?;
                Ok(ChainTransaction::from_transaction(&tx, self.network))
            })
            .collect()
    }

    fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        self.transactions
            .get(txid)
            .cloned()
            .ok_or(ChainError::TxNotFound(*txid))
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        if self.reject_broadcasts {
            return Err(ChainError::BroadcastFailed(
                "transaction rejected by memory ledger".to_string(),
            ));
        }
        if let Ok(mut accepted) = self.broadcasts.lock() {
            accepted.push(tx.clone());
        }
        Ok(tx.compute_txid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::WPubkeyHash;

    fn address(byte: u8) -> Address {
        let script = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([byte; 20]));
        Address::from_script(&script, Network::Regtest).unwrap()
    }

    #[test]
    fn test_fund_marks_used_and_funded() {
        let mut chain = MemoryChain::new(Network::Regtest, 100);
        let a = address(1);

        let info = chain.address_info(&a).unwrap();
        assert!(!info.used);
        assert_eq!(info.balance, Amount::ZERO);

        let outpoint = chain.fund(&a, Amount::from_sat(5000));
        let info = chain.address_info(&a).unwrap();
        assert!(info.used);
        assert_eq!(info.balance, Amount::from_sat(5000));

        let utxos = chain.address_utxos(&a).unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].outpoint, outpoint);
    }

    #[test]
    fn test_distinct_funding_transactions() {
        let mut chain = MemoryChain::new(Network::Regtest, 100);
        let a = address(1);
        let first = chain.fund(&a, Amount::from_sat(1000));
        let second = chain.fund(&a, Amount::from_sat(1000));
        assert_ne!(first.txid, second.txid);
        assert_eq!(chain.address_utxos(&a).unwrap().len(), 2);
    }

    #[test]
    fn test_spend_keeps_history() {
        let mut chain = MemoryChain::new(Network::Regtest, 100);
        let a = address(1);
        let b = address(2);
        let outpoint = chain.fund(&a, Amount::from_sat(5000));

        let spend = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: outpoint,
                ..Default::default()
            }],
            output: vec![TxOut {
                value: Amount::from_sat(4000),
                script_pubkey: b.script_pubkey(),
            }],
        };
        let txid = chain.apply(spend);

        let info = chain.address_info(&a).unwrap();
        assert!(info.used);
        assert_eq!(info.balance, Amount::ZERO);

        let history = chain.address_transactions(&a).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].txid, txid);
        assert_eq!(chain.address_info(&b).unwrap().balance, Amount::from_sat(4000));
    }

    #[test]
    fn test_failure_injection_and_query_log() {
        let mut chain = MemoryChain::new(Network::Regtest, 100);
        let a = address(1);
        chain.fail_address(&a);

        assert!(matches!(
            chain.address_info(&a),
            Err(ChainError::Unavailable(_))
        ));
        assert!(chain.address_utxos(&a).is_err());
        assert_eq!(chain.queried_addresses(), vec![a]);
    }

    #[test]
    fn test_broadcast_rejection() {
        let mut chain = MemoryChain::new(Network::Regtest, 100);
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        };

        assert_eq!(chain.broadcast(&tx).unwrap(), tx.compute_txid());
        chain.reject_broadcasts(true);
        assert!(matches!(
            chain.broadcast(&tx),
            Err(ChainError::BroadcastFailed(_))
        ));
        assert_eq!(chain.broadcasts().len(), 1);
    }
}
