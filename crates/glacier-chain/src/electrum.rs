//! Electrum backend
//!
//! # Security
//!
//! - Always use SSL/TLS connections (ssl:// or tcp+tls://)
//! - Validate all data received from server
//! - Never send private keys over the wire
//!
//! # Example
//!
//! ```ignore
//! use glacier_chain::{ChainSource, ElectrumClient};
//! use bitcoin::Network;
//!
//! let client = ElectrumClient::new("ssl://mempool.space:40002", Network::Testnet)?;
//! let height = client.current_height()?;
//! println!("Current block height: {}", height);
//! ```

use bitcoin::{Address, Amount, Network, OutPoint, Transaction, Txid};
use electrum_client::{ElectrumApi, Error as ElectrumError};

use crate::{AddressInfo, ChainError, ChainSource, ChainTransaction, Utxo};

/// Electrum client for Bitcoin network operations
pub struct ElectrumClient {
    client: electrum_client::Client,
    network: Network,
}

impl ElectrumClient {
    /// Create a new Electrum client
    ///
    /// # Arguments
    /// * `url` - Electrum server URL (e.g., "ssl://electrum.blockstream.info:60002")
    /// * `network` - Bitcoin network (Mainnet, Testnet, Signet, Regtest)
    pub fn new(url: &str, network: Network) -> Result<Self, ChainError> {
        if !url.starts_with("ssl://") && !url.contains("tls") {
            log::warn!("Connecting to Electrum without SSL - insecure for mainnet!");
        }

        let client = electrum_client::Client::new(url)
            .map_err(|e: ElectrumError| ChainError::Connection(e.to_string()))?;

        log::debug!("Connected to Electrum at {}", url);
        Ok(Self { client, network })
    }
}

impl ChainSource for ElectrumClient {
    fn network(&self) -> Network {
        self.network
    }

    fn current_height(&self) -> Result<u32, ChainError> {
        let header = self.client.block_headers_subscribe()?;
        Ok(header.height as u32)
    }

    fn address_info(&self, address: &Address) -> Result<AddressInfo, ChainError> {
        let script = address.script_pubkey();
        let history = self.client.script_get_history(&script)?;
        let balance = self.client.script_get_balance(&script)?;
        // unconfirmed can be negative (pending spends)
        let total = balance.confirmed as i64 + balance.unconfirmed;

        Ok(AddressInfo {
            used: !history.is_empty(),
            balance: Amount::from_sat(total.max(0) as u64),
        })
    }

    fn address_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ChainError> {
        let unspent = self.client.script_list_unspent(&address.script_pubkey())?;

        Ok(unspent
            .into_iter()
            .map(|u| Utxo {
                outpoint: OutPoint {
                    txid: u.tx_hash,
                    vout: u.tx_pos as u32,
                },
                value: Amount::from_sat(u.value),
            })
            .collect())
    }

    fn address_transactions(
        &self,
        address: &Address,
    ) -> Result<Vec<ChainTransaction>, ChainError> {
        let history = self.client.script_get_history(&address.script_pubkey())?;

        history
            .iter()
            .map(|item| {
                let tx = self.get_transaction(&item.tx_hash)?;
                Ok(ChainTransaction::from_transaction(&tx, self.network))
            })
            .collect()
    }

    fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        self.client
            .transaction_get(txid)
            .map_err(|e| tx_lookup_error(*txid, e))
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        self.client
            .transaction_broadcast(tx)
            .map_err(|e: ElectrumError| ChainError::BroadcastFailed(e.to_string()))
    }
}

/// Server-side "unknown transaction" becomes `TxNotFound`; anything else
/// keeps its cause.
fn tx_lookup_error(txid: Txid, err: ElectrumError) -> ChainError {
    let missing = match &err {
        ElectrumError::Protocol(response) => {
            let text = response.to_string().to_lowercase();
            text.contains("no such") || text.contains("not found")
        }
        _ => false,
    };
    if missing {
        ChainError::TxNotFound(txid)
    } else {
        ChainError::Protocol(err)
    }
}

/// Default Electrum servers for each network
pub fn default_server(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "ssl://electrum.blockstream.info:60002",
        Network::Testnet => "ssl://mempool.space:40002",
        Network::Signet => "ssl://mempool.space:60602",
        Network::Regtest => "tcp://127.0.0.1:60401",
        _ => "ssl://electrum.blockstream.info:60002",
    }
}
