//! Server configuration: parsed from TOML file + environment variable overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use bitcoin::Amount;
use glacier_lock::draft::{MAX_LOCK_OFFSET, MIN_LOCK_OFFSET};
use glacier_lock::{LockParams, DEFAULT_FEE, DEFAULT_LOCK_OFFSET};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP and process settings
    #[serde(default)]
    pub server: ServerSection,

    /// Bitcoin / Electrum settings
    #[serde(default)]
    pub bitcoin: BitcoinSection,

    /// Wallet seed
    pub wallet: WalletSection,

    /// Lock policy
    #[serde(default)]
    pub glacier: GlacierSection,
}

/// HTTP and process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Listen address for the HTTP endpoint
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Receive addresses scanned when a request gives no count
    #[serde(default = "default_scan_count")]
    pub scan_count: u32,

    /// Largest count a request may ask for
    #[serde(default = "default_max_scan_count")]
    pub max_scan_count: u32,

    /// Submit signed transactions to the network
    #[serde(default)]
    pub broadcast: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            log_level: default_log_level(),
            scan_count: default_scan_count(),
            max_scan_count: default_max_scan_count(),
            broadcast: false,
        }
    }
}

/// Bitcoin network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinSection {
    /// Bitcoin network: "bitcoin", "testnet", "testnet4", "signet", "regtest"
    #[serde(default = "default_network")]
    pub network: String,

    /// Electrum server URL; empty selects the network's default server
    #[serde(default)]
    pub electrum_url: String,
}

impl Default for BitcoinSection {
    fn default() -> Self {
        Self {
            network: default_network(),
            electrum_url: String::new(),
        }
    }
}

/// Wallet seed
#[derive(Clone, Serialize, Deserialize)]
pub struct WalletSection {
    /// BIP-39 mnemonic
    pub mnemonic: String,

    /// Optional BIP-39 passphrase
    #[serde(default)]
    pub passphrase: String,
}

impl fmt::Debug for WalletSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletSection")
            .field("mnemonic", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// Lock policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlacierSection {
    /// Flat fee per transaction, in satoshis
    #[serde(default = "default_fee_sats")]
    pub fee_sats: u64,

    /// Blocks between the chain tip and a new lock's height
    #[serde(default = "default_lock_offset")]
    pub lock_offset: u32,
}

impl Default for GlacierSection {
    fn default() -> Self {
        Self {
            fee_sats: default_fee_sats(),
            lock_offset: default_lock_offset(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_scan_count() -> u32 {
    10
}

fn default_max_scan_count() -> u32 {
    100
}

fn default_network() -> String {
    "testnet4".to_string()
}

fn default_fee_sats() -> u64 {
    DEFAULT_FEE.to_sat()
}

fn default_lock_offset() -> u32 {
    DEFAULT_LOCK_OFFSET
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServerConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `GLACIER_BIND`
    /// - `GLACIER_LOG_LEVEL`
    /// - `GLACIER_SCAN_COUNT`
    /// - `GLACIER_MAX_SCAN_COUNT`
    /// - `GLACIER_BROADCAST`
    /// - `GLACIER_NETWORK`
    /// - `GLACIER_ELECTRUM_URL`
    /// - `GLACIER_MNEMONIC`
    /// - `GLACIER_PASSPHRASE`
    /// - `GLACIER_FEE_SATS`
    /// - `GLACIER_LOCK_OFFSET`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GLACIER_BIND") {
            self.server.bind = v;
        }
        if let Ok(v) = std::env::var("GLACIER_LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Ok(v) = std::env::var("GLACIER_SCAN_COUNT") {
            if let Ok(count) = v.parse::<u32>() {
                self.server.scan_count = count;
            }
        }
        if let Ok(v) = std::env::var("GLACIER_MAX_SCAN_COUNT") {
            if let Ok(count) = v.parse::<u32>() {
                self.server.max_scan_count = count;
            }
        }
        if let Ok(v) = std::env::var("GLACIER_BROADCAST") {
            self.server.broadcast = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("GLACIER_NETWORK") {
            self.bitcoin.network = v;
        }
        if let Ok(v) = std::env::var("GLACIER_ELECTRUM_URL") {
            self.bitcoin.electrum_url = v;
        }
        if let Ok(v) = std::env::var("GLACIER_MNEMONIC") {
            self.wallet.mnemonic = v;
        }
        if let Ok(v) = std::env::var("GLACIER_PASSPHRASE") {
            self.wallet.passphrase = v;
        }
        if let Ok(v) = std::env::var("GLACIER_FEE_SATS") {
            if let Ok(fee) = v.parse::<u64>() {
                self.glacier.fee_sats = fee;
            }
        }
        if let Ok(v) = std::env::var("GLACIER_LOCK_OFFSET") {
            if let Ok(offset) = v.parse::<u32>() {
                self.glacier.lock_offset = offset;
            }
        }
    }

    /// Parse the bitcoin network string to a `bitcoin::Network`.
    pub fn network(&self) -> Option<bitcoin::Network> {
        match self.bitcoin.network.as_str() {
            "bitcoin" | "mainnet" => Some(bitcoin::Network::Bitcoin),
            "testnet" | "testnet3" | "testnet4" => Some(bitcoin::Network::Testnet),
            "signet" => Some(bitcoin::Network::Signet),
            "regtest" => Some(bitcoin::Network::Regtest),
            _ => None,
        }
    }

    /// Configured Electrum URL, or the default server for the network.
    pub fn electrum_url(&self, network: bitcoin::Network) -> String {
        if self.bitcoin.electrum_url.is_empty() {
            glacier_chain::default_server(network).to_string()
        } else {
            self.bitcoin.electrum_url.clone()
        }
    }

    pub fn lock_params(&self) -> LockParams {
        LockParams {
            fee: Amount::from_sat(self.glacier.fee_sats),
            lock_offset: self.glacier.lock_offset,
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.network().is_some(),
            "bitcoin.network '{}' is not one of bitcoin, testnet, testnet4, signet, regtest",
            self.bitcoin.network
        );

        anyhow::ensure!(
            !self.wallet.mnemonic.trim().is_empty(),
            "wallet.mnemonic must not be empty"
        );
        glacier_core::parse_mnemonic(&self.wallet.mnemonic)
            .context("wallet.mnemonic is not a valid BIP-39 mnemonic")?;

        anyhow::ensure!(self.glacier.fee_sats > 0, "glacier.fee_sats must be > 0");
        anyhow::ensure!(
            (MIN_LOCK_OFFSET..=MAX_LOCK_OFFSET).contains(&self.glacier.lock_offset),
            "glacier.lock_offset must be between {} and {}",
            MIN_LOCK_OFFSET,
            MAX_LOCK_OFFSET
        );

        anyhow::ensure!(self.server.scan_count > 0, "server.scan_count must be > 0");
        anyhow::ensure!(
            self.server.scan_count <= self.server.max_scan_count,
            "server.scan_count ({}) must not exceed server.max_scan_count ({})",
            self.server.scan_count,
            self.server.max_scan_count
        );
        self.bind_addr()?;

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
