//! Launch configuration: flag parsing helpers and key material.

use std::path::PathBuf;

use dogenet_proto::{Address, KeyPair, PubKey, CORE_NODE_DEFAULT_PORT, DOGENET_DEFAULT_PORT};
use dogenet_store::NodeInfo;

use crate::Args;

/// Default admin API bind.
const WEB_DEFAULT_PORT: u16 = dogenet_api::DEFAULT_API_PORT;

/// Startup failures, split by the exit code they map to.
#[derive(Debug)]
pub enum SetupError {
    /// Invalid flags: exit code 1.
    Flags(String),
    /// Missing or malformed key material: exit code 3.
    Keys(String),
}

impl SetupError {
    pub fn exit_code(&self) -> u8 {
        match self {
            SetupError::Flags(_) => 1,
            SetupError::Keys(_) => 3,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            SetupError::Flags(msg) | SetupError::Keys(msg) => msg,
        }
    }
}

/// Fully resolved launch configuration.
pub struct Setup {
    pub binds: Vec<Address>,
    pub webs: Vec<Address>,
    pub public: Address,
    pub core: Option<Address>,
    pub peers: Vec<NodeInfo>,
    pub crawl: usize,
    pub db_path: String,
    pub socket_path: PathBuf,
    pub allow_local: bool,
    pub node_key: KeyPair,
    pub identity: PubKey,
}

/// Validate flags and read key material from the environment.
pub fn resolve(args: &Args) -> Result<Setup, SetupError> {
    let mut binds = Vec::new();
    for bind in &args.bind {
        binds.push(parse_addr(bind, "bind", DOGENET_DEFAULT_PORT)?);
    }
    if binds.is_empty() {
        binds.push(Address::parse("0.0.0.0", DOGENET_DEFAULT_PORT).expect("static address"));
    }

    let mut webs = Vec::new();
    for web in &args.web {
        webs.push(parse_addr(web, "web", WEB_DEFAULT_PORT)?);
    }
    if webs.is_empty() {
        webs.push(Address::parse("0.0.0.0", WEB_DEFAULT_PORT).expect("static address"));
    }

    let public = match &args.public {
        Some(public) => parse_addr(public, "public", DOGENET_DEFAULT_PORT)?,
        None => {
            return Err(SetupError::Flags(
                "node public address must be specified via --public".into(),
            ))
        }
    };
    if !public.is_valid() {
        return Err(SetupError::Flags("bad --public address".into()));
    }
    if !args.local && public.is_private() {
        return Err(SetupError::Flags(
            "bad --public address: cannot be a private or multicast address".into(),
        ));
    }

    let core = match &args.core {
        Some(core) => Some(parse_addr(core, "core", CORE_NODE_DEFAULT_PORT)?),
        None => None,
    };

    let mut peers = Vec::new();
    for peer in &args.peer {
        peers.push(parse_peer(peer)?);
    }

    let (node_key, identity) = keys_from_env()?;

    Ok(Setup {
        binds,
        webs,
        public,
        core,
        peers,
        crawl: args.crawl,
        db_path: args.db.clone(),
        socket_path: PathBuf::from(&args.socket),
        allow_local: args.local,
        node_key,
        identity,
    })
}

fn parse_addr(arg: &str, name: &str, default_port: u16) -> Result<Address, SetupError> {
    Address::parse(arg, default_port)
        .map_err(|e| SetupError::Flags(format!("bad --{name}: {e}")))
}

/// `--peer` takes `<pubkey>:<ip>:<port>`.
fn parse_peer(arg: &str) -> Result<NodeInfo, SetupError> {
    let (key_hex, addr_part) = arg
        .split_once(':')
        .ok_or_else(|| SetupError::Flags(format!("bad --peer: expecting ':' in argument: {arg}")))?;
    let raw = hex::decode(key_hex)
        .map_err(|_| SetupError::Flags(format!("bad --peer: invalid hex pubkey: {key_hex}")))?;
    let pubkey: PubKey = raw
        .try_into()
        .map_err(|_| SetupError::Flags(format!("bad --peer: pubkey must be 32 bytes: {key_hex}")))?;
    let address = parse_addr(addr_part, "peer", DOGENET_DEFAULT_PORT)?;
    Ok(NodeInfo { pubkey, address })
}

/// Read `KEY` (64-byte hex keypair, scrubbed after reading) and `IDENT`
/// (32-byte hex identity) from the environment.
fn keys_from_env() -> Result<(KeyPair, PubKey), SetupError> {
    let key_hex = std::env::var("KEY").unwrap_or_default();
    // never leave the key in the environment
    unsafe { std::env::remove_var("KEY") };
    if key_hex.is_empty() {
        return Err(SetupError::Keys(
            "missing KEY env-var: node keypair (64 bytes hex; see `dogenet genkey`)".into(),
        ));
    }
    let key_bytes = hex::decode(&key_hex)
        .map_err(|e| SetupError::Keys(format!("invalid KEY hex in env-var: {e}")))?;
    let node_key = KeyPair::from_keypair_bytes(&key_bytes)
        .map_err(|_| SetupError::Keys("invalid KEY in env-var: must be 64 bytes".into()))?;

    let ident_hex = std::env::var("IDENT").unwrap_or_default();
    if ident_hex.is_empty() {
        return Err(SetupError::Keys(
            "missing IDENT env-var: owner identity public key (32 bytes hex)".into(),
        ));
    }
    let ident_bytes = hex::decode(&ident_hex)
        .map_err(|e| SetupError::Keys(format!("invalid IDENT hex in env-var: {e}")))?;
    let identity: PubKey = ident_bytes
        .try_into()
        .map_err(|_| SetupError::Keys("invalid IDENT in env-var: must be 32 bytes".into()))?;

    Ok((node_key, identity))
}
