//! HD key tree derived from a BIP-39 seed
//!
//! One BIP-84 account per wallet. Receive keys live on branch 0, time-lock
//! keys on branch 3 with the lock height doubling as the child index, so a
//! lock height maps to exactly one key and one lock address.

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, Network, PubkeyHash};
use std::fmt;
use thiserror::Error;

use crate::seed::Seed;

/// Branch for ordinary receive addresses
pub const RECEIVE_BRANCH: u32 = 0;

/// Branch reserved for time-lock keys
pub const LOCK_BRANCH: u32 = 3;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Derivation failed: {0}")]
    DerivationFailed(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// A derivation branch under the account node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Branch {
    Receive,
    Lock,
}

impl Branch {
    pub fn number(self) -> u32 {
        match self {
            Branch::Receive => RECEIVE_BRANCH,
            Branch::Lock => LOCK_BRANCH,
        }
    }
}

/// Position of a key below the account node: `<branch>/<index>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPath {
    pub branch: Branch,
    pub index: u32,
}

impl KeyPath {
    pub fn receive(index: u32) -> Self {
        Self {
            branch: Branch::Receive,
            index,
        }
    }

    /// Key guarding the lock at `lock_height`.
    pub fn lock(lock_height: u32) -> Self {
        Self {
            branch: Branch::Lock,
            index: lock_height,
        }
    }

    /// Relative derivation path from the account node.
    ///
    /// Fails for indices in the hardened range (>= 2^31).
    pub fn to_derivation_path(&self) -> Result<DerivationPath, KeyError> {
        let branch = ChildNumber::from_normal_idx(self.branch.number())
            .map_err(|e| KeyError::InvalidPath(e.to_string()))?;
        let index = ChildNumber::from_normal_idx(self.index)
            .map_err(|e| KeyError::InvalidPath(format!("{}: {}", self, e)))?;
        Ok(DerivationPath::from(vec![branch, index]))
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch.number(), self.index)
    }
}

/// BIP-84 account path for a network: coin type 0 on mainnet, 1 elsewhere.
pub fn account_path(network: Network) -> DerivationPath {
    let coin_type = match network {
        Network::Bitcoin => 0,
        _ => 1,
    };
    DerivationPath::from(vec![
        ChildNumber::Hardened { index: 84 },
        ChildNumber::Hardened { index: coin_type },
        ChildNumber::Hardened { index: 0 },
    ])
}

/// The wallet's account node and everything derived from it.
///
/// Immutable once built; shared read-only across requests.
pub struct WalletKeys {
    account: Xpriv,
    account_path: DerivationPath,
    master_fingerprint: Fingerprint,
    network: Network,
    secp: Secp256k1<All>,
}

impl WalletKeys {
    /// Derive the account node for `network` from a seed.
    pub fn from_seed(seed: &Seed, network: Network) -> Result<Self, KeyError> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed.as_bytes())
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
        let account_path = account_path(network);
        let account = master
            .derive_priv(&secp, &account_path)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;

        Ok(Self {
            master_fingerprint: master.fingerprint(&secp),
            account,
            account_path,
            network,
            secp,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    /// Public account node, safe to display.
    pub fn account_xpub(&self) -> Xpub {
        Xpub::from_priv(&self.secp, &self.account)
    }

    /// Secret key at `path`.
    pub fn secret_key(&self, path: KeyPath) -> Result<SecretKey, KeyError> {
        let child = self
            .account
            .derive_priv(&self.secp, &path.to_derivation_path()?)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
        Ok(child.private_key)
    }

    pub fn public_key(&self, path: KeyPath) -> Result<PublicKey, KeyError> {
        Ok(self.secret_key(path)?.public_key(&self.secp))
    }

    /// HASH160 of the compressed public key at `path`.
    pub fn pubkey_hash(&self, path: KeyPath) -> Result<PubkeyHash, KeyError> {
        Ok(CompressedPublicKey(self.public_key(path)?).pubkey_hash())
    }

    /// Native segwit receive address at `index` on the receive branch.
    pub fn receive_address(&self, index: u32) -> Result<Address, KeyError> {
        let pk = CompressedPublicKey(self.public_key(KeyPath::receive(index))?);
        Ok(Address::p2wpkh(&pk, self.network))
    }

    /// Full path from the master key, displayed as `m/84'/1'/0'/0/5`.
    pub fn full_path(&self, path: KeyPath) -> Result<DerivationPath, KeyError> {
        Ok(self.account_path.extend(path.to_derivation_path()?))
    }

    /// Full path as text, e.g. `m/84'/1'/0'/0/5`.
    pub fn path_string(&self, path: KeyPath) -> String {
        let mut out = String::from("m");
        let children: &[ChildNumber] = self.account_path.as_ref();
        for child in children {
            match *child {
                ChildNumber::Hardened { index } => out.push_str(&format!("/{}'", index)),
                ChildNumber::Normal { index } => out.push_str(&format!("/{}", index)),
            }
        }
        format!("{}/{}", out, path)
    }

    /// BIP-32 origin (master fingerprint, full path) used to annotate draft inputs.
    pub fn key_origin(&self, path: KeyPath) -> Result<(Fingerprint, DerivationPath), KeyError> {
        Ok((self.master_fingerprint, self.full_path(path)?))
    }
}

impl fmt::Debug for WalletKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletKeys")
            .field("network", &self.network)
            .field("account_path", &self.account_path)
            .field("master_fingerprint", &self.master_fingerprint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::seed_from_words;

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn mainnet_keys() -> WalletKeys {
        let seed = seed_from_words(ABANDON, "").unwrap();
        WalletKeys::from_seed(&seed, Network::Bitcoin).unwrap()
    }

    /// BIP-84 reference vectors for m/84'/0'/0'/0/0 and m/84'/0'/0'/0/1.
    #[test]
    fn test_bip84_receive_vectors() {
        let keys = mainnet_keys();
        assert_eq!(
            keys.receive_address(0).unwrap().to_string(),
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );
        assert_eq!(
            keys.receive_address(1).unwrap().to_string(),
            "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g"
        );
    }

    #[test]
    fn test_branches_are_disjoint() {
        let keys = mainnet_keys();
        let receive = keys.public_key(KeyPath::receive(150)).unwrap();
        let lock = keys.public_key(KeyPath::lock(150)).unwrap();
        assert_ne!(receive, lock);
    }

    #[test]
    fn test_lock_key_deterministic() {
        let a = mainnet_keys().pubkey_hash(KeyPath::lock(800_000)).unwrap();
        let b = mainnet_keys().pubkey_hash(KeyPath::lock(800_000)).unwrap();
        assert_eq!(a, b);

        let c = mainnet_keys().pubkey_hash(KeyPath::lock(800_001)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_hardened_index_rejected() {
        let keys = mainnet_keys();
        let result = keys.public_key(KeyPath::lock(0x8000_0000));
        assert!(matches!(result, Err(KeyError::InvalidPath(_))));
    }

    #[test]
    fn test_full_path_display() {
        let seed = seed_from_words(ABANDON, "").unwrap();
        let keys = WalletKeys::from_seed(&seed, Network::Testnet).unwrap();
        let path = keys.full_path(KeyPath::lock(150)).unwrap();
        let shown = path.to_string();
        assert!(shown.contains("84'/1'/0'"));
        assert!(shown.ends_with("/3/150"));
        assert_eq!(KeyPath::receive(7).to_string(), "0/7");
        assert_eq!(keys.path_string(KeyPath::receive(5)), "m/84'/1'/0'/0/5");
        assert_eq!(keys.path_string(KeyPath::lock(150)), "m/84'/1'/0'/3/150");
    }

    #[test]
    fn test_testnet_uses_testnet_addresses() {
        let seed = seed_from_words(ABANDON, "").unwrap();
        let keys = WalletKeys::from_seed(&seed, Network::Testnet).unwrap();
        assert!(keys.receive_address(0).unwrap().to_string().starts_with("tb1q"));
    }
}
