//! Command-line shell for the SPV wallet.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;

use bitcoin::Network;
use spv_wallet::store::MemoryWalletStore;
use spv_wallet::{logging, KeyPurpose, SpvWallet, WalletConfig};

#[derive(Parser)]
#[command(name = "spv-wallet", version = spv_wallet::VERSION, about = "Bitcoin SPV wallet")]
struct Args {
    /// Network to connect to.
    #[arg(short, long, value_parser = ["mainnet", "testnet", "regtest"], default_value = "mainnet")]
    network: String,

    /// Data directory for the header store.
    #[arg(short, long, default_value = "./spv-wallet-data")]
    data_dir: PathBuf,

    /// Connect only to this peer instead of using DNS discovery.
    #[arg(short, long)]
    trusted_peer: Option<std::net::SocketAddr>,

    /// BIP39 mnemonic; generated when absent.
    #[arg(short, long)]
    mnemonic: Option<String>,

    /// Fee oracle URL.
    #[arg(long)]
    fee_oracle: Option<String>,

    /// Log level.
    #[arg(short, long, value_parser = ["error", "warn", "info", "debug", "trace"], default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = logging::parse_level(&args.log_level).unwrap_or(tracing::level_filters::LevelFilter::INFO);
    if let Err(e) = logging::init_console_logging(level) {
        eprintln!("failed to initialize logging: {}", e);
        process::exit(1);
    }

    let network = match args.network.as_str() {
        "mainnet" => Network::Bitcoin,
        "testnet" => Network::Testnet,
        _ => Network::Regtest,
    };

    let mut config = WalletConfig::new(network).with_data_dir(args.data_dir);
    if let Some(peer) = args.trusted_peer {
        config = config.with_trusted_peer(peer);
    }
    if let Some(mnemonic) = args.mnemonic {
        config = config.with_mnemonic(mnemonic);
    }
    if let Some(url) = args.fee_oracle {
        config = config.with_fee_oracle(url);
    }

    let wallet = match SpvWallet::new(config, Arc::new(MemoryWalletStore::new())).await {
        Ok(wallet) => wallet,
        Err(e) => {
            tracing::error!("failed to open wallet: {}", e);
            process::exit(1);
        }
    };

    match wallet.current_address(KeyPurpose::External).await {
        Ok(address) => tracing::info!(%address, "Receive address"),
        Err(e) => tracing::warn!("could not derive receive address: {}", e),
    }

    wallet.start();

    if let Err(e) = signal::ctrl_c().await {
        tracing::error!("signal handler failed: {}", e);
    }
    if let Err(e) = wallet.close() {
        tracing::error!("shutdown error: {}", e);
        process::exit(1);
    }
}
