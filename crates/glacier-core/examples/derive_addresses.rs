//! Print the first receive addresses and the account xpub for a mnemonic.
//! Run with: cargo run -p glacier-core --example derive_addresses -- "<mnemonic>"

use bitcoin::Network;
use glacier_core::{seed_from_words, KeyPath, WalletKeys};

fn main() {
    let words = std::env::args()
        .nth(1)
        .expect("usage: derive_addresses \"<mnemonic words>\"");
    let seed = seed_from_words(&words, "").expect("invalid mnemonic");
    let keys = WalletKeys::from_seed(&seed, Network::Testnet).expect("derivation failed");

    println!("Account xpub: {}\n", keys.account_xpub());
    for index in 0..5 {
        let address = keys.receive_address(index).expect("derivation failed");
        println!("{}  {}", keys.path_string(KeyPath::receive(index)), address);
    }
}
