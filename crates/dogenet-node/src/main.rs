//! dogenet — the DogeNet gossip node daemon.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dogenet_api::AppState;
use dogenet_crawler::Crawler;
use dogenet_net::{NetConfig, NetService, DEFAULT_PROTOCOL_SOCKET};
use dogenet_proto::KeyPair;
use dogenet_store::{run_trimmer, SqliteStore, Store};

mod config;

use config::{resolve, SetupError};

const DEFAULT_STORE_FILE: &str = "storage/dogenet.db";

/// How often a roaming crawler contacts a Core node.
const CRAWL_PERIOD: Duration = Duration::from_secs(5 * 60);

/// How often the pinned local Core node is re-contacted.
const LOCAL_NODE_PERIOD: Duration = Duration::from_secs(60);

/// DogeNet gossip node.
#[derive(Parser, Debug)]
#[command(name = "dogenet")]
#[command(about = "Peer-to-peer gossip node for Dogecoin-adjacent services")]
pub struct Args {
    /// Gossip bind address, repeatable (use [<ip>]:<port> for IPv6)
    #[arg(long, value_name = "IP:PORT")]
    bind: Vec<String>,

    /// Admin API bind address, repeatable
    #[arg(long, value_name = "IP:PORT")]
    web: Vec<String>,

    /// Public address advertised in our announcement
    #[arg(long, value_name = "IP:PORT")]
    public: Option<String>,

    /// A local Dogecoin Core node to stay in contact with
    #[arg(long, value_name = "IP:PORT")]
    core: Option<String>,

    /// Known peer to connect to, repeatable
    #[arg(long, value_name = "PUBKEY:IP:PORT")]
    peer: Vec<String>,

    /// Number of Core network crawlers
    #[arg(long, default_value = "0")]
    crawl: usize,

    /// Path to the SQLite database
    #[arg(long, default_value = DEFAULT_STORE_FILE)]
    db: String,

    /// Path of the local handler socket
    #[arg(long, default_value = DEFAULT_PROTOCOL_SOCKET)]
    socket: String,

    /// Allow private 'public' addresses (for testing)
    #[arg(long)]
    local: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a fresh node keypair and print it as hex
    Genkey,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
        Err(e) => {
            // --help / --version
            print!("{e}");
            return ExitCode::SUCCESS;
        }
    };

    if let Some(Command::Genkey) = args.command {
        let keys = KeyPair::generate();
        println!("{}", hex::encode(keys.to_keypair_bytes()));
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let setup = match resolve(&args) {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("{}", e.message());
            if matches!(e, SetupError::Flags(_)) {
                let _ = Args::command().print_help();
            }
            return ExitCode::from(e.exit_code());
        }
    };

    info!("node pubkey: {}", hex::encode(setup.node_key.public()));
    info!("owner identity: {}", hex::encode(setup.identity));

    // open the previously saved state
    if let Some(parent) = Path::new(&setup.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                eprintln!("cannot create database directory {}: {e}", parent.display());
                return ExitCode::from(1);
            }
        }
    }
    let cancel = CancellationToken::new();
    let store: Arc<dyn Store> = match SqliteStore::open(&setup.db_path, cancel.clone()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("error opening database {}: {e}", setup.db_path);
            return ExitCode::from(1);
        }
    };

    let mut tasks = Vec::new();

    // the gossip fabric
    let net = NetService::new(
        NetConfig {
            bind_addrs: setup.binds.clone(),
            public_addr: setup.public,
            socket_path: setup.socket_path.clone(),
            allow_local: setup.allow_local,
            node_key: setup.node_key.clone(),
            identity: setup.identity,
        },
        store.clone(),
        cancel.clone(),
    );
    tasks.push(tokio::spawn(net.clone().run()));

    // seed the attract loop with command-line peers
    for peer in &setup.peers {
        net.add_peer(*peer);
    }

    // stay in contact with the local Core node, if configured
    if let Some(core) = setup.core {
        let crawler = Crawler::new(store.clone(), Some(core), LOCAL_NODE_PERIOD, cancel.clone());
        tasks.push(tokio::spawn(crawler.run()));
    }

    // roam the Core network
    for _ in 0..setup.crawl {
        let crawler = Crawler::new(store.clone(), None, CRAWL_PERIOD, cancel.clone());
        tasks.push(tokio::spawn(crawler.run()));
    }

    // the admin API
    for web in &setup.webs {
        let state = AppState::new(store.clone(), net.clone());
        tasks.push(tokio::spawn(dogenet_api::serve(*web, state, cancel.clone())));
    }

    // the store trimmer
    tasks.push(tokio::spawn(run_trimmer(store.clone(), cancel.clone())));

    // run until interrupted
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "task panicked during shutdown");
        }
    }
    info!("finished");
    ExitCode::SUCCESS
}
