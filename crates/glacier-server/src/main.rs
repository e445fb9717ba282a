//! Glacier Server: HTTP front end for Glacier time-locks
//!
//! Derives the wallet from the configured seed, then answers each request by
//! scanning the chain, drafting the new-lock and unlock transactions, and
//! signing them.
//!
//! # Usage
//!
//! ```bash
//! glacier-server --config /path/to/glacier.toml
//! glacier-server --once      # Run one pipeline, print the JSON report and exit
//! glacier-server --validate  # Validate config and exit
//! ```

mod config;
mod http;

use anyhow::{Context, Result};
use glacier_chain::{ChainSource, ElectrumClient};
use glacier_core::{seed_from_words, WalletKeys};
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> Result<()> {
    // Electrum TLS needs a process-wide rustls provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    // Parse CLI args by hand
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("/config/glacier.toml");
    let mut one_shot = false;
    let mut validate_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = PathBuf::from(&args[i]);
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--once" => {
                one_shot = true;
            }
            "--validate" => {
                validate_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("glacier-server {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    // Load config
    let mut server_config = config::ServerConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply env overrides
    server_config.apply_env_overrides();

    // Validate
    server_config
        .validate()
        .context("Configuration validation failed")?;

    // Init logger; RUST_LOG wins over the configured level
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&server_config.server.log_level),
    )
    .init();

    let network = server_config
        .network()
        .context("Unsupported bitcoin.network")?;
    let electrum_url = server_config.electrum_url(network);

    let seed = seed_from_words(&server_config.wallet.mnemonic, &server_config.wallet.passphrase)
        .context("Failed to derive seed")?;
    let keys = Arc::new(WalletKeys::from_seed(&seed, network).context("Failed to derive keys")?);
    drop(seed);

    if validate_only {
        println!("✅ Configuration is valid.");
        println!("  Network:       {}", network);
        println!("  Electrum:      {}", electrum_url);
        println!("  Account xpub:  {}", keys.account_xpub());
        println!("  Listen:        {}", server_config.server.bind);
        println!(
            "  Scan count:    {} (max {})",
            server_config.server.scan_count, server_config.server.max_scan_count
        );
        println!("  Broadcast:     {}", server_config.server.broadcast);
        println!("  Fee:           {} sat", server_config.glacier.fee_sats);
        println!("  Lock offset:   {} blocks", server_config.glacier.lock_offset);
        return Ok(());
    }

    let connect: http::Connector = Arc::new(move || {
        ElectrumClient::new(&electrum_url, network).map(|c| Box::new(c) as Box<dyn ChainSource>)
    });

    let state = Arc::new(http::AppState {
        keys,
        params: server_config.lock_params(),
        scan_count: server_config.server.scan_count,
        max_scan_count: server_config.server.max_scan_count,
        broadcast: server_config.server.broadcast,
        connect,
    });

    if one_shot {
        log::info!("Running single pipeline…");
        let report = http::run_request(&state, server_config.server.scan_count)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        log::info!("Done.");
        return Ok(());
    }

    let addr = server_config.bind_addr()?;
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    if let Err(e) = rt.block_on(http::serve(state, addr)) {
        log::error!("Server error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"Glacier Server: self-custodial Bitcoin time-locks over HTTP

USAGE:
    glacier-server [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Config file path (default: /config/glacier.toml)
    --once                Run a single pipeline, print the report and exit
    --validate            Validate config file and exit
    -h, --help            Show this help message
    -V, --version         Show version

ENDPOINTS:
    GET /addresses?count=N&format=html|json
    GET /health

ENVIRONMENT VARIABLES (override config file):
    GLACIER_BIND           HTTP listen address
    GLACIER_LOG_LEVEL      Log level (error/warn/info/debug/trace)
    GLACIER_SCAN_COUNT     Default number of receive addresses to scan
    GLACIER_MAX_SCAN_COUNT Largest count a request may ask for
    GLACIER_BROADCAST      Broadcast signed transactions (true/false)
    GLACIER_NETWORK        Bitcoin network (bitcoin/testnet/testnet4/signet/regtest)
    GLACIER_ELECTRUM_URL   Electrum server URL
    GLACIER_MNEMONIC       BIP-39 mnemonic
    GLACIER_PASSPHRASE     BIP-39 passphrase
    GLACIER_FEE_SATS       Flat fee per transaction
    GLACIER_LOCK_OFFSET    Blocks ahead for new locks (2-6)

EXAMPLES:
    # Serve with config file
    glacier-server --config /path/to/glacier.toml

    # One report on stdout (useful for cron jobs)
    glacier-server --config glacier.toml --once

    # Validate configuration
    glacier-server --config glacier.toml --validate
"#
    );
}
