//! chainledger CLI — run crawl-and-parse pipelines and inspect their state.
//!
//! Usage:
//! ```bash
//! chainledger run       --config ledger.json
//! chainledger status    --config ledger.json
//! chainledger abandoned --config ledger.json
//! chainledger info
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use chainledger_bitcoin::{BitcoinPeer, UtxoDecoder};
use chainledger_core::config::{ChainConfig, ChainFamily, LedgerConfig};
use chainledger_core::decode::Decoder;
use chainledger_core::error::LedgerError;
use chainledger_core::manager::{ChainPipeline, Manager, PipelineFactory};
use chainledger_core::peer::PeerAdapter;
use chainledger_core::queue::callback_lane;
use chainledger_core::store::ChainStore;
use chainledger_evm::{AccountDecoder, EvmPeer};
use chainledger_rpc::{HttpConfig, HttpTransport, RpcTransport};
use chainledger_storage::{SqliteJobQueue, SqliteStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let command = args[1].as_str();
    match command {
        "run" | "status" | "abandoned" => {
            if let Err(e) = dispatch(command, &args[2..]).await {
                eprintln!("error: {e:#}");
                process::exit(1);
            }
        }
        "info" => cmd_info(),
        "version" | "--version" | "-V" => {
            println!("chainledger {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

async fn dispatch(command: &str, rest: &[String]) -> Result<()> {
    let config = config_arg(rest)?;
    match command {
        "run" => cmd_run(config).await,
        "status" => cmd_status(config).await,
        _ => cmd_abandoned(config).await,
    }
}

fn print_usage() {
    println!("chainledger {}", env!("CARGO_PKG_VERSION"));
    println!("Crawl-and-parse ingestion of watched wallet activity\n");
    println!("USAGE:");
    println!("    chainledger <COMMAND> [--config <FILE>]\n");
    println!("COMMANDS:");
    println!("    run        Start one pipeline per enabled chain until Ctrl-C");
    println!("    status     Show chain heads and parse backlog");
    println!("    abandoned  List transactions that exhausted their retries");
    println!("    info       Show defaults and supported chain families");
    println!("    version    Print version");
    println!("    help       Print this help");
}

fn config_arg(rest: &[String]) -> Result<LedgerConfig> {
    let mut path = None;
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => path = iter.next(),
            other => bail!("unexpected argument '{other}'"),
        }
    }
    let path = path.context("--config <FILE> is required")?;
    LedgerConfig::from_file(path).with_context(|| format!("loading {path}"))
}

// ─── Pipeline construction ───────────────────────────────────────────────────

/// Builds peers and decoders over HTTP JSON-RPC, sharing one store and queue.
struct HttpPipelineFactory {
    store: Arc<SqliteStore>,
    queue: Arc<SqliteJobQueue>,
}

impl HttpPipelineFactory {
    fn transport(config: &ChainConfig) -> Result<Arc<dyn RpcTransport>, LedgerError> {
        let auth = match (&config.rpc.user, &config.rpc.pass) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };
        let http = HttpConfig {
            request_timeout: config.rpc_timeout(),
            auth,
            ..HttpConfig::default()
        };
        Ok(Arc::new(HttpTransport::new(config.rpc.url.clone(), http)?))
    }
}

impl PipelineFactory for HttpPipelineFactory {
    fn build(&self, config: &ChainConfig) -> Result<ChainPipeline, LedgerError> {
        let transport = Self::transport(config)?;
        let (peer, decoder): (Arc<dyn PeerAdapter>, Arc<dyn Decoder>) = match config.family {
            ChainFamily::Bitcoin => (
                Arc::new(BitcoinPeer::new(transport, config.rpc_timeout())),
                Arc::new(UtxoDecoder::new(config.native_currency_id.clone())),
            ),
            ChainFamily::Evm => (
                Arc::new(
                    EvmPeer::new(transport, config.rpc_timeout()).with_receipts(config.fetch_receipts),
                ),
                Arc::new(AccountDecoder::new(config.native_currency_id.clone()).with_tokens(&config.tokens)),
            ),
        };
        tracing::info!(chain = %config.id, family = %config.family, url = %config.rpc.url, "Pipeline built");
        Ok(ChainPipeline::new(
            config,
            peer,
            decoder,
            self.store.clone(),
            self.queue.clone(),
        ))
    }
}

async fn open_store(config: &LedgerConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_run(config: LedgerConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let mut queue = SqliteJobQueue::from_pool(store.pool().clone()).await?;
    for chain in config.enabled_chains() {
        queue = queue.with_retention(callback_lane(&chain.id), chain.callback_retention);
    }
    let factory = HttpPipelineFactory {
        store: Arc::new(store),
        queue: Arc::new(queue),
    };

    let manager = Manager::from_config(&config, &factory);
    if manager.pipelines().is_empty() {
        bail!("no enabled chain could be started");
    }
    let started = manager.start_all();
    tracing::info!(started, chains = ?manager.chain_ids(), "Running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");
    manager.stop_all().await;
    Ok(())
}

async fn cmd_status(config: LedgerConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let heads = store.heads().await?;
    println!("{:<12} {:<10} {:>10} {:>10} {:>10}", "CHAIN", "FAMILY", "HEIGHT", "FEE", "UNPARSED");
    for chain in &config.chains {
        let head = heads.iter().find(|h| h.chain_id == chain.id);
        let height = head.map_or("-".to_string(), |h| h.height.to_string());
        let fee = head
            .and_then(|h| h.avg_fee)
            .map_or("-".to_string(), |f| f.to_string());
        let unparsed = store.unparsed_count(&chain.id).await?;
        let mark = if chain.enabled { "" } else { " (disabled)" };
        println!(
            "{:<12} {:<10} {:>10} {:>10} {:>10}{mark}",
            chain.id, chain.family.to_string(), height, fee, unparsed
        );
    }
    Ok(())
}

async fn cmd_abandoned(config: LedgerConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let mut total = 0;
    for chain in &config.chains {
        for row in store.abandoned_unparsed(&chain.id, chain.max_retry).await? {
            total += 1;
            let height = row.block_height.map_or("mempool".to_string(), |h| h.to_string());
            println!("{}  {}  height={}  retries={}", chain.id, row.txid, height, row.retry_count);
        }
    }
    println!("{total} abandoned transaction(s)");
    Ok(())
}

fn cmd_info() {
    println!("ChainLedger v{}", env!("CARGO_PKG_VERSION"));
    println!("  Families: bitcoin (UTXO, JSON-RPC 1.0), evm (account, JSON-RPC 2.0)");
    println!("  Lanes per chain: <chain>ParseJob, <chain>ParseJobCallback");
    println!("  Callback retention: 10000 unconsumed results per chain (callback_retention, 0 = unbounded)");
    println!("  Default sync interval: 450s (bitcoin), 15s (evm)");
    println!("  Default max retry: 3, rollback depth: 100 blocks");
    println!("  Storage: SQLite (store and durable job queue share one database)");
}
