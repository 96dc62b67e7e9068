//! meshvpn command line
//!
//! Joins a peer-to-peer overlay network described by a shared token and
//! either runs the VPN interface or shares files and TCP services on it.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use meshvpn_ledger::{BlockStore, DiskStore, DiskStoreConfig, MemoryStore};
use meshvpn_node::config::{DEFAULT_OTP_INTERVAL, NodeConfig};
use meshvpn_node::engine::{AddressSource, Device, Engine, TunDevice};
use meshvpn_node::services::{
    connect_service, read_lease, receive_file, register_service, serve_proxy, share_file, AliveService,
    EgressService, LeaseService,
};
use meshvpn_node::trustzone::Ed25519Provider;
use meshvpn_node::{ConnectionData, Node, NodeParts};
use meshvpn_p2p::{AddressBook, Keypair, TcpStreams, WsGossip, WsGossipConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Peer-to-peer mesh VPN
#[derive(Parser, Debug)]
#[command(name = "meshvpn")]
#[command(about = "Decentralized mesh VPN over a shared, gossip-replicated ledger", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MESHVPN_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the network and bring up the VPN interface
    Run(RunArgs),
    /// Print a new network token
    Generate {
        /// Print the token instead of the YAML document
        #[arg(long)]
        base64: bool,
        /// Key rotation interval in seconds
        #[arg(long, default_value_t = DEFAULT_OTP_INTERVAL)]
        interval: u64,
    },
    /// Expose a local TCP service to the network
    ServiceAdd {
        #[command(flatten)]
        network: NetworkArgs,
        name: String,
        /// `host:port` of the service to expose
        address: String,
    },
    /// Bind a local listener to a service shared on the network
    ServiceConnect {
        #[command(flatten)]
        network: NetworkArgs,
        name: String,
        /// Local `host:port` to listen on
        address: String,
    },
    /// Share a file with the network
    FileSend {
        #[command(flatten)]
        network: NetworkArgs,
        name: String,
        path: PathBuf,
    },
    /// Download a file shared on the network
    FileReceive {
        #[command(flatten)]
        network: NetworkArgs,
        name: String,
        path: PathBuf,
    },
    /// Local HTTP proxy that exits through egress nodes
    Proxy {
        #[command(flatten)]
        network: NetworkArgs,
        /// Local `host:port` to listen on
        #[arg(long, env = "MESHVPN_PROXY_LISTEN", default_value = "127.0.0.1:8080")]
        proxy_listen: String,
        /// Seconds after which a silent egress node is skipped
        #[arg(long, env = "MESHVPN_PROXY_DEAD_INTERVAL", default_value = "600")]
        dead_interval: u64,
    },
    /// Print a new ed25519 key pair for the trust zone
    PeergateGenkey,
}

/// Options every network command shares
#[derive(Args, Debug)]
struct NetworkArgs {
    /// Network token
    #[arg(long, env = "MESHVPN_TOKEN")]
    token: Option<String>,

    /// Network YAML file, takes precedence over the token
    #[arg(long, env = "MESHVPN_CONFIG")]
    config: Option<PathBuf>,

    /// Gossip listen address
    #[arg(long, env = "MESHVPN_LISTEN", default_value = "0.0.0.0:4001")]
    listen: String,

    /// Peer stream listen address, gossip port + 1 when unset
    #[arg(long, env = "MESHVPN_STREAM_LISTEN")]
    stream_listen: Option<String>,

    /// Host announced to peers as our dial address
    #[arg(long, env = "MESHVPN_ADVERTISE")]
    advertise: Option<String>,

    /// Gossip endpoints to dial at startup
    #[arg(long, env = "MESHVPN_BOOTSTRAP", value_delimiter = ',')]
    bootstrap: Vec<String>,

    /// Peer ids, addresses or CIDRs to refuse
    #[arg(long, env = "MESHVPN_BLACKLIST", value_delimiter = ',')]
    blacklist: Vec<String>,

    /// Do not seal room payloads
    #[arg(long, env = "MESHVPN_INSECURE")]
    insecure: bool,

    /// Identity key file, created when missing
    #[arg(long, env = "MESHVPN_IDENTITY")]
    identity: Option<PathBuf>,

    /// Ledger state directory, in memory when unset
    #[arg(long, env = "MESHVPN_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Seconds between ledger announcements
    #[arg(long, env = "MESHVPN_LEDGER_ANNOUNCE_INTERVAL", default_value = "10")]
    ledger_announce_interval: u64,

    /// Seconds between ledger head rebroadcasts
    #[arg(long, env = "MESHVPN_LEDGER_SYNC_INTERVAL", default_value = "10")]
    ledger_sync_interval: u64,

    /// Seconds between heartbeats
    #[arg(long, env = "MESHVPN_ALIVE_INTERVAL", default_value = "120")]
    alive_interval: u64,

    /// Seconds between healthcheck scrubs
    #[arg(long, env = "MESHVPN_ALIVE_SCRUB_INTERVAL", default_value = "600")]
    alive_scrub_interval: u64,

    /// Heartbeat age, in seconds, after which a node counts as offline
    #[arg(long, env = "MESHVPN_ALIVE_MAX", default_value = "900")]
    alive_max: u64,

    /// Run the peer guardian
    #[arg(long, env = "MESHVPN_PEERGUARD")]
    peerguard: bool,

    /// Drop ledger messages from peers outside the trust zone
    #[arg(long, env = "MESHVPN_PEERGATE")]
    peergate: bool,

    /// Let every peer through while the trust zone is empty
    #[arg(long, env = "MESHVPN_PEERGATE_RELAXED")]
    peergate_relaxed: bool,

    /// Remove trust zone members that left the network
    #[arg(long, env = "MESHVPN_PEERGATE_AUTOCLEAN")]
    peergate_autoclean: bool,

    /// Seconds between trust zone refreshes
    #[arg(long, env = "MESHVPN_PEERGATE_INTERVAL", default_value = "120")]
    peergate_interval: u64,

    /// Auth providers as a YAML map of provider name to options
    #[arg(long, env = "MESHVPN_PEERGATE_AUTH")]
    peergate_auth: Option<String>,

    /// `name=public_key` entries to publish in the trust zone auth bucket
    #[arg(long, env = "MESHVPN_PEERGATE_AUTHORIZE", value_delimiter = ',', value_parser = parse_key_value)]
    authorize: Vec<(String, String)>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    network: NetworkArgs,

    /// Interface name
    #[arg(long, env = "MESHVPN_INTERFACE", default_value = "meshvpn0")]
    interface: String,

    /// Interface address in CIDR notation
    #[arg(long, env = "MESHVPN_ADDRESS", default_value = "10.1.0.1/24")]
    address: String,

    /// Send every frame we originate to this address
    #[arg(long, env = "MESHVPN_ROUTER")]
    router: Option<String>,

    /// Interface MTU
    #[arg(long, env = "MESHVPN_MTU", default_value = "1200")]
    mtu: usize,

    /// Lease an address from the network instead of using --address
    #[arg(long, env = "MESHVPN_DHCP")]
    dhcp: bool,

    /// Where leases are remembered
    #[arg(long, env = "MESHVPN_LEASE_DIR", default_value = ".leases")]
    lease_dir: PathBuf,

    /// Forwarding workers, one per core when unset
    #[arg(long, env = "MESHVPN_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Open a stream per frame instead of pooling
    #[arg(long, env = "MESHVPN_LOW_PROFILE")]
    low_profile: bool,

    /// Streams kept in the pool
    #[arg(long, env = "MESHVPN_MAX_STREAMS", default_value = "100")]
    max_streams: usize,

    /// Let network users reach the outside world through this node
    #[arg(long, env = "MESHVPN_EGRESS")]
    egress: bool,

    /// Seconds between egress announcements
    #[arg(long, env = "MESHVPN_EGRESS_ANNOUNCE_INTERVAL", default_value = "120")]
    egress_interval: u64,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got {}", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Run(args) => run_vpn(args).await,
        Command::Generate { base64, interval } => {
            let data = ConnectionData::generate(interval);
            if base64 {
                println!("{}", data.to_token()?);
            } else {
                print!("{}", data.to_yaml()?);
            }
            Ok(())
        }
        Command::ServiceAdd { network, name, address } => {
            let running = start(network_config(&network)?, |_| Ok(())).await?;
            let ctx = running.node.context(running.cancel.clone());
            let _service = register_service(&ctx, &name, &address);
            tracing::info!("Sharing service {} at {}", name, address);
            running.wait().await
        }
        Command::ServiceConnect { network, name, address } => {
            let running = start(network_config(&network)?, |_| Ok(())).await?;
            let ctx = running.node.context(running.cancel.clone());
            let cancel = running.cancel.clone();
            let proxy = tokio::spawn(async move {
                if let Err(e) = connect_service(&ctx, &name, &address).await {
                    tracing::error!("Service connection failed: {}", e);
                    cancel.cancel();
                }
            });
            let result = running.wait().await;
            let _ = proxy.await;
            result
        }
        Command::FileSend { network, name, path } => {
            let running = start(network_config(&network)?, |_| Ok(())).await?;
            let ctx = running.node.context(running.cancel.clone());
            let _share = share_file(&ctx, &name, path.clone())?;
            tracing::info!("Sharing {} as {}", path.display(), name);
            running.wait().await
        }
        Command::FileReceive { network, name, path } => {
            let running = start(network_config(&network)?, |_| Ok(())).await?;
            let ctx = running.node.context(running.cancel.clone());
            let result = tokio::select! {
                received = receive_file(&ctx, &name, path.clone(), Duration::from_secs(5)) => {
                    received.map(|size| tracing::info!("Received {} ({} bytes)", path.display(), size))
                        .map_err(anyhow::Error::from)
                }
                _ = tokio::signal::ctrl_c() => Ok(()),
            };
            running.stop().await;
            result
        }
        Command::Proxy {
            network,
            proxy_listen,
            dead_interval,
        } => {
            let running = start(network_config(&network)?, |_| Ok(())).await?;
            let ctx = running.node.context(running.cancel.clone());
            let cancel = running.cancel.clone();
            let proxy = tokio::spawn(async move {
                if let Err(e) = serve_proxy(&ctx, &proxy_listen, Duration::from_secs(dead_interval)).await {
                    tracing::error!("Proxy failed: {}", e);
                    cancel.cancel();
                }
            });
            let result = running.wait().await;
            let _ = proxy.await;
            result
        }
        Command::PeergateGenkey => {
            let (private, public) = Ed25519Provider::generate_keys();
            println!("private_key: {}", private);
            println!("public_key: {}", public);
            Ok(())
        }
    }
}

async fn run_vpn(args: RunArgs) -> Result<()> {
    let mut config = network_config(&args.network)?;
    config.interface.name = args.interface.clone();
    config.interface.address = args.address.clone();
    config.interface.router = args.router.clone();
    config.interface.mtu = args.mtu;
    config.engine.low_profile = args.low_profile;
    config.engine.max_streams = args.max_streams;
    if let Some(concurrency) = args.concurrency {
        config.engine.concurrency = concurrency;
    }
    config.dhcp.enable = args.dhcp;
    config.dhcp.lease_dir = args.lease_dir.clone();

    // A remembered lease becomes the interface address right away, which
    // also keeps the transports off the overlay subnet
    let mut leased = false;
    if config.dhcp.enable {
        if let Some(lease) = read_lease(&config.dhcp.lease_dir, &config.connection.otp.crypto.key) {
            tracing::info!("Using leased address {}", lease);
            config.interface.address = format!("{}/24", lease);
            leased = true;
        }
    }

    let egress = args.egress.then(|| EgressService::new(Duration::from_secs(args.egress_interval)));
    let running = start(config, |node| {
        let config = node.config().clone();
        if let Some(egress) = egress {
            node.add_service(Arc::new(egress));
        }
        let address = if config.dhcp.enable && !leased {
            let (service, lease) = LeaseService::new(&config)?;
            node.add_service(Arc::new(service));
            AddressSource::Lease(lease)
        } else {
            AddressSource::Static(config.interface_ip()?)
        };

        let interface = config.interface.clone();
        let prefix = config.interface_prefix()?;
        let factory = Box::new(move |ip| {
            TunDevice::create(&interface, ip, prefix).map(|device| Arc::new(device) as Arc<dyn Device>)
        });
        node.add_service(Arc::new(Engine::new(
            config.interface.clone(),
            config.engine.clone(),
            address,
            factory,
        )));
        Ok(())
    })
    .await?;

    running.wait().await
}

fn network_config(args: &NetworkArgs) -> Result<NodeConfig> {
    let connection = ConnectionData::load(args.token.as_deref(), args.config.as_deref())
        .context("a network token or config file is required")?;

    let mut config = NodeConfig::new(connection);
    config.blacklist = args.blacklist.clone();

    config.transport.listen = args.listen.clone();
    config.transport.stream_listen = args.stream_listen.clone();
    config.transport.advertise_host = args.advertise.clone();
    config.transport.bootstrap = args.bootstrap.clone();
    config.transport.insecure = args.insecure;
    config.transport.identity = args.identity.clone();

    config.ledger.state_dir = args.state_dir.clone();
    config.ledger.announce_interval = Duration::from_secs(args.ledger_announce_interval);
    config.ledger.sync_interval = Duration::from_secs(args.ledger_sync_interval);

    config.alive.announce = Duration::from_secs(args.alive_interval);
    config.alive.scrub = Duration::from_secs(args.alive_scrub_interval);
    config.alive.max = Duration::from_secs(args.alive_max);

    let trust = &mut config.trust_zone;
    trust.enable = args.peerguard;
    trust.gate = args.peergate;
    trust.relaxed = args.peergate_relaxed;
    trust.autoclean = args.peergate_autoclean;
    trust.sync_interval = Duration::from_secs(args.peergate_interval);
    if let Some(auth) = &args.peergate_auth {
        trust.auth_providers = serde_yaml::from_str::<BTreeMap<String, BTreeMap<String, String>>>(auth)
            .context("invalid auth provider map")?;
    }
    trust.authorized_keys = args.authorize.iter().cloned().collect();

    Ok(config)
}

/// A started node and everything needed to stop it
struct Running {
    node: Node,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    store: Option<Arc<DiskStore>>,
}

impl Running {
    /// Run until interrupted or cancelled
    async fn wait(self) -> Result<()> {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => signal?,
            _ = self.cancel.cancelled() => {}
        }
        tracing::info!("Shutting down");
        self.stop().await;
        Ok(())
    }

    async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("A task did not stop in time");
            }
        }
        if let Some(store) = self.store {
            if let Err(e) = store.flush() {
                tracing::error!("Failed to flush ledger state: {}", e);
            }
        }
        tracing::info!("Node {} stopped", self.node.peer_id());
    }
}

/// Build the transports and the node, let `setup` register services, then
/// join the network with an alive service running
async fn start<F>(config: NodeConfig, setup: F) -> Result<Running>
where
    F: FnOnce(&Node) -> Result<()>,
{
    config.validate()?;
    let cancel = CancellationToken::new();

    let keypair = match &config.transport.identity {
        Some(path) => Keypair::load_or_generate(path)
            .with_context(|| format!("failed to load identity from {}", path.display()))?,
        None => Keypair::generate(),
    };
    tracing::info!("Peer id {}", keypair.peer_id());

    let blacklist = config.blacklist()?;
    let address_book = AddressBook::new();

    let gossip = WsGossip::start(
        keypair.clone(),
        WsGossipConfig {
            listen: Some(config.transport.listen.clone()),
            advertise: config.advertise()?,
            bootstrap: config.transport.bootstrap.clone(),
            ..WsGossipConfig::default()
        },
        address_book.clone(),
        blacklist.clone(),
        cancel.clone(),
    )
    .await?;
    let streams = TcpStreams::start(
        keypair.clone(),
        &config.stream_listen()?,
        address_book,
        blacklist,
        cancel.clone(),
    )
    .await?;

    let (store, disk): (Arc<dyn BlockStore>, Option<Arc<DiskStore>>) = match &config.ledger.state_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let disk = Arc::new(DiskStore::open(
                dir.join("ledger"),
                &DiskStoreConfig {
                    cache_capacity: config.ledger.cache_capacity_bytes,
                    block_cache: config.ledger.block_cache,
                },
            )?);
            tracing::info!("Ledger state in {}", dir.display());
            (disk.clone() as Arc<dyn BlockStore>, Some(disk))
        }
        None => (Arc::new(MemoryStore::new()) as Arc<dyn BlockStore>, None),
    };

    let alive = AliveService::new(config.alive.clone());
    let node = Node::new(
        config,
        NodeParts {
            keypair,
            gossip: Arc::new(gossip),
            streams: Arc::new(streams),
            store,
        },
    )?;
    node.add_service(Arc::new(alive));
    setup(&node)?;

    let tasks = node.start(cancel.clone()).await?;
    Ok(Running {
        node,
        cancel,
        tasks,
        store: disk,
    })
}
