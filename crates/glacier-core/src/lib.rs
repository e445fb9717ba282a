//! Glacier Core
//!
//! Seed handling and the HD key tree every Glacier request derives from.
//!
//! # Key Derivation
//!
//! From a single BIP-39 seed, one BIP-84 account node:
//! - mainnet: m/84'/0'/0'
//! - test networks: m/84'/1'/0'
//!
//! Under the account, two disjoint branches:
//! - `0/<index>`: ordinary receive addresses (P2WPKH)
//! - `3/<height>`: time-lock keys, one per lock height

pub mod keys;
pub mod seed;

pub use keys::*;
pub use seed::*;
