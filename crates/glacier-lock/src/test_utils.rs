//! Shared test utilities for glacier-lock tests.
//!
//! Provides a deterministic wallet and helpers that put lock-shaped
//! transactions on a [`MemoryChain`].

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Transaction, TxIn, TxOut, Txid};
use glacier_chain::MemoryChain;
use glacier_core::{seed_from_words, WalletKeys};

use crate::script::{build_lock_marker, LockDescriptor};

/// BIP-39 test mnemonic (`abandon` x11 + `about`).
pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// Regtest wallet keys for the test mnemonic.
pub fn test_keys() -> WalletKeys {
    test_keys_on(Network::Regtest)
}

pub fn test_keys_on(network: Network) -> WalletKeys {
    let seed = seed_from_words(TEST_MNEMONIC, "").unwrap();
    WalletKeys::from_seed(&seed, network).unwrap()
}

/// Unsigned version-2 transaction spending `spend` into `outputs`.
pub fn raw_transaction(spend: OutPoint, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: spend,
            ..Default::default()
        }],
        output: outputs,
    }
}

/// Lock transaction as Glacier would build it: `[lock output, discovery tag]`.
pub fn lock_transaction(spend: OutPoint, lock: &LockDescriptor, value: Amount) -> Transaction {
    raw_transaction(
        spend,
        vec![
            TxOut {
                value,
                script_pubkey: lock.lock_address.script_pubkey(),
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: build_lock_marker(lock.lock_height).unwrap(),
            },
        ],
    )
}

/// Fund receive address `index` and lock `value` at `lock_height` from it,
/// the way an earlier run of the pipeline would have.
///
/// Returns the lock descriptor and the txid of the lock transaction.
pub fn place_lock(
    chain: &mut MemoryChain,
    keys: &WalletKeys,
    index: u32,
    lock_height: u32,
    value: Amount,
) -> (LockDescriptor, Txid) {
    let receive = keys.receive_address(index).unwrap();
    let funding = chain.fund(&receive, value + Amount::from_sat(1000));
    let lock = LockDescriptor::derive(keys, lock_height).unwrap();
    let txid = chain.apply(lock_transaction(funding, &lock, value));
    (lock, txid)
}

/// OP_RETURN script with an arbitrary payload.
pub fn op_return(data: &[u8]) -> ScriptBuf {
    ScriptBuf::new_op_return(bitcoin::script::PushBytesBuf::try_from(data.to_vec()).unwrap())
}
