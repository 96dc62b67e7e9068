//! Node wiring
//!
//! A node owns the ledger, the message hub and the admission filter, and
//! pumps messages between them:
//! - local ledger writes go out on the ledger room
//! - ledger room messages pass the blacklist and the gate before ingestion
//! - generic room messages are offered to every registered handler
//!
//! Network services (liveness, leasing, the frame engine, sharing) run on
//! top of a [`NodeContext`] once the node is started.

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::protocol::TRUSTZONE_AUTH;
use crate::trustzone::{build_providers, GateMode, PeerGater, PeerGuardian};
use async_trait::async_trait;
use meshvpn_ledger::{Announcement, BlockStore, Broadcaster, IngestOutcome, Ledger};
use meshvpn_p2p::{
    Blacklist, GossipTransport, HubMessage, HubReceivers, Keypair, MessageHub, PeerId, PlainSealer, Sealer,
    StreamTransport, XChaChaSealer,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outbound announcements waiting for the hub
const OUTBOUND_BUFFER: usize = 1024;

/// What services get to work with
#[derive(Clone)]
pub struct NodeContext {
    pub peer_id: PeerId,
    pub ledger: Arc<Ledger>,
    pub hub: Arc<MessageHub>,
    pub streams: Arc<dyn StreamTransport>,
    pub cancel: CancellationToken,
    pub config: Arc<NodeConfig>,
}

/// A long running piece of node functionality
#[async_trait]
pub trait NetworkService: Send + Sync {
    fn name(&self) -> &str;

    /// Runs until the work is set up or, for blocking services, until
    /// `ctx.cancel` fires
    async fn run(&self, ctx: NodeContext) -> Result<(), NodeError>;
}

/// Callback for messages on the generic room
pub type MessageHandler = Arc<dyn Fn(&NodeContext, &HubMessage) + Send + Sync>;

/// Transports and storage a node is built on
pub struct NodeParts {
    pub keypair: Keypair,
    pub gossip: Arc<dyn GossipTransport>,
    pub streams: Arc<dyn StreamTransport>,
    pub store: Arc<dyn BlockStore>,
}

/// Queues announcements for the hub without blocking the ledger writer
struct HubBroadcaster {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Broadcaster for HubBroadcaster {
    fn broadcast(&self, announcement: &Announcement) {
        if let Err(e) = self.tx.try_send(announcement.to_bytes()) {
            tracing::warn!("Dropped ledger {}: {}", announcement.kind(), e);
        }
    }
}

pub struct Node {
    config: Arc<NodeConfig>,
    peer_id: PeerId,
    ledger: Arc<Ledger>,
    hub: Arc<MessageHub>,
    streams: Arc<dyn StreamTransport>,
    gater: Arc<PeerGater>,
    guardian: Option<Arc<PeerGuardian>>,
    blacklist: Blacklist,
    handlers: Mutex<Vec<MessageHandler>>,
    services: Mutex<Vec<Arc<dyn NetworkService>>>,
    receivers: Mutex<Option<(HubReceivers, mpsc::Receiver<Vec<u8>>)>>,
}

impl Node {
    pub fn new(config: NodeConfig, parts: NodeParts) -> Result<Self, NodeError> {
        config.validate()?;
        let config = Arc::new(config);
        let peer_id = parts.keypair.peer_id();

        let sealer: Arc<dyn Sealer> = if config.transport.insecure {
            tracing::warn!("Running without payload sealing");
            Arc::new(PlainSealer)
        } else {
            Arc::new(XChaChaSealer)
        };
        let (hub, hub_receivers) = MessageHub::new(parts.gossip, sealer, config.hub_config());

        let (tx, outbound) = mpsc::channel(OUTBOUND_BUFFER);
        let ledger = Arc::new(Ledger::new(parts.store, Arc::new(HubBroadcaster { tx }))?);

        let trust = &config.trust_zone;
        let mode = match (trust.gate, trust.relaxed) {
            (false, _) => GateMode::Disabled,
            (true, true) => GateMode::Relaxed,
            (true, false) => GateMode::Strict,
        };
        let gater = Arc::new(PeerGater::new(mode));

        let guardian = if trust.enable {
            let providers = build_providers(&trust.auth_providers)?;
            Some(Arc::new(PeerGuardian::new(providers, trust.autoclean, trust.sync_interval)))
        } else {
            None
        };

        let blacklist = config.blacklist()?;

        Ok(Self {
            config,
            peer_id,
            ledger,
            hub,
            streams: parts.streams,
            gater,
            guardian,
            blacklist,
            handlers: Mutex::new(Vec::new()),
            services: Mutex::new(Vec::new()),
            receivers: Mutex::new(Some((hub_receivers, outbound))),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn hub(&self) -> &Arc<MessageHub> {
        &self.hub
    }

    pub fn gater(&self) -> &Arc<PeerGater> {
        &self.gater
    }

    pub fn config(&self) -> &Arc<NodeConfig> {
        &self.config
    }

    /// Register a service, run when the node starts
    pub fn add_service(&self, service: Arc<dyn NetworkService>) {
        self.services.lock().push(service);
    }

    /// Register a handler for generic room messages
    pub fn add_handler(&self, handler: MessageHandler) {
        self.handlers.lock().push(handler);
    }

    pub fn context(&self, cancel: CancellationToken) -> NodeContext {
        NodeContext {
            peer_id: self.peer_id,
            ledger: self.ledger.clone(),
            hub: self.hub.clone(),
            streams: self.streams.clone(),
            cancel,
            config: self.config.clone(),
        }
    }

    /// Join the network and spawn every loop and service
    pub async fn start(&self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>, NodeError> {
        let (receivers, outbound) = self.receivers.lock().take().ok_or(NodeError::AlreadyStarted)?;
        let ctx = self.context(cancel.clone());
        let mut tasks = Vec::new();

        tasks.push(self.hub.start(cancel.clone()).await?);
        tasks.push(tokio::spawn(publish_loop(self.hub.clone(), outbound, cancel.clone())));
        tasks.push(tokio::spawn(ledger_loop(
            self.ledger.clone(),
            self.gater.clone(),
            self.blacklist.clone(),
            receivers.ledger,
            cancel.clone(),
        )));

        let mut handlers = self.handlers.lock().clone();
        if let Some(guardian) = &self.guardian {
            let guardian_ref = guardian.clone();
            handlers.push(Arc::new(move |ctx: &NodeContext, message: &HubMessage| {
                guardian_ref.receive(ctx, message)
            }));
            tasks.push(guardian.challenger(ctx.clone()));
        }
        tasks.push(tokio::spawn(generic_loop(
            ctx.clone(),
            handlers,
            self.blacklist.clone(),
            receivers.generic,
        )));

        tasks.push(self.ledger.synchronizer(cancel.clone(), self.config.ledger.sync_interval));
        if self.gater.mode() != GateMode::Disabled {
            tasks.push(
                self.gater
                    .updater(cancel.clone(), self.config.trust_zone.sync_interval, self.ledger.clone()),
            );
        }
        if !self.config.trust_zone.authorized_keys.is_empty() {
            tasks.push(self.announce_authorized_keys(cancel.clone()));
        }

        let services = self.services.lock().clone();
        for service in services {
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                tracing::debug!("Starting service {}", service.name());
                if let Err(e) = service.run(ctx).await {
                    tracing::error!("Service {} failed: {}", service.name(), e);
                }
            }));
        }

        tracing::info!("Node {} started", self.peer_id);
        Ok(tasks)
    }

    /// Keep the configured auth keys in the ledger
    fn announce_authorized_keys(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        let keys = self.config.trust_zone.authorized_keys.clone();
        self.ledger
            .announce(cancel, self.config.ledger.announce_interval, move || {
                for (provider, key) in &keys {
                    let current = ledger.get_value::<String>(TRUSTZONE_AUTH, provider);
                    if current.as_ref() != Some(key) {
                        if let Err(e) = ledger.add_value(TRUSTZONE_AUTH, provider, key) {
                            tracing::warn!("Failed to announce auth key {}: {}", provider, e);
                        }
                    }
                }
                async {}
            })
    }
}

async fn publish_loop(hub: Arc<MessageHub>, mut outbound: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            payload = outbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        if let Err(e) = hub.publish_ledger(payload).await {
            tracing::warn!("Ledger publish failed: {}", e);
        }
    }
}

async fn ledger_loop(
    ledger: Arc<Ledger>,
    gater: Arc<PeerGater>,
    blacklist: Blacklist,
    mut inbound: mpsc::Receiver<HubMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if blacklist.blocks_peer(&message.sender) {
            tracing::debug!("Dropped ledger message from blacklisted {}", message.sender.short());
            continue;
        }
        if gater.gate(&message.sender) {
            tracing::debug!("Gated ledger message from {}", message.sender.short());
            continue;
        }

        let announcement = match Announcement::from_bytes(&message.payload) {
            Ok(announcement) => announcement,
            Err(e) => {
                tracing::debug!("Undecodable announcement from {}: {}", message.sender.short(), e);
                continue;
            }
        };

        let kind = announcement.kind();
        match ledger.ingest(announcement) {
            Ok(IngestOutcome::Discarded(reason)) => {
                tracing::trace!("Ledger {} from {} discarded: {}", kind, message.sender.short(), reason)
            }
            Ok(IngestOutcome::Unchanged) => {}
            Ok(outcome) => tracing::debug!("Ledger {} from {}: {:?}", kind, message.sender.short(), outcome),
            Err(e) => tracing::warn!("Ingest failed: {}", e),
        }
    }
}

async fn generic_loop(
    ctx: NodeContext,
    handlers: Vec<MessageHandler>,
    blacklist: Blacklist,
    mut inbound: mpsc::Receiver<HubMessage>,
) {
    loop {
        let message = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if blacklist.blocks_peer(&message.sender) {
            continue;
        }
        for handler in &handlers {
            handler(&ctx, &message);
        }
    }
}
