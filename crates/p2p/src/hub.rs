//! Message hub: rotating, sealed gossip rooms
//!
//! The hub keeps this peer on two rooms: the ledger room carrying block
//! announcements, and (optionally) the generic room for everything else.
//! Room topics are derived from the shared room secret and the current time
//! window, so the topic name changes every window. On rotation the hub joins
//! the new topic first and keeps reading the previous one for a grace
//! period. Payloads are sealed with a key derived from the exchange secret;
//! receivers also try the previous window's key to bridge the boundary.

use crate::error::P2pError;
use crate::gossip::{GossipTransport, Topic};
use crate::identity::PeerId;
use crate::message::{Envelope, GossipMessage, HubMessage};
use crate::otp::OtpKey;
use crate::sealer::Sealer;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Inbound hub messages buffered per channel
pub const HUB_BUFFER: usize = 128;

/// Hub settings
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Secret the room topic names derive from
    pub room: OtpKey,
    /// Secret the sealing keys derive from
    pub exchange: OtpKey,
    pub max_message_size: usize,
    /// Join the generic room as well
    pub generic: bool,
    /// How often the topic window is re-evaluated
    pub rotation_check: Duration,
    /// How long the previous room is still read after a rotation
    pub rotation_grace: Duration,
}

/// The two rooms a hub serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Ledger,
    Generic,
}

impl Channel {
    fn topic_salts(self) -> &'static [&'static str] {
        match self {
            Channel::Ledger => &[],
            Channel::Generic => &["public"],
        }
    }

    fn seal_salts(self) -> &'static [&'static str] {
        match self {
            Channel::Ledger => &[],
            Channel::Generic => &["generic"],
        }
    }
}

struct Room {
    window: u64,
    topic: Arc<dyn Topic>,
    reader: CancellationToken,
}

/// Receiving ends handed out once when the hub is built
pub struct HubReceivers {
    pub ledger: mpsc::Receiver<HubMessage>,
    pub generic: mpsc::Receiver<HubMessage>,
}

pub struct MessageHub {
    transport: Arc<dyn GossipTransport>,
    sealer: Arc<dyn Sealer>,
    config: HubConfig,
    ledger_room: RwLock<Option<Room>>,
    generic_room: RwLock<Option<Room>>,
    ledger_tx: mpsc::Sender<HubMessage>,
    generic_tx: mpsc::Sender<HubMessage>,
}

impl MessageHub {
    pub fn new(
        transport: Arc<dyn GossipTransport>,
        sealer: Arc<dyn Sealer>,
        config: HubConfig,
    ) -> (Arc<Self>, HubReceivers) {
        let (ledger_tx, ledger) = mpsc::channel(HUB_BUFFER);
        let (generic_tx, generic) = mpsc::channel(HUB_BUFFER);
        let hub = Arc::new(Self {
            transport,
            sealer,
            config,
            ledger_room: RwLock::new(None),
            generic_room: RwLock::new(None),
            ledger_tx,
            generic_tx,
        });
        (hub, HubReceivers { ledger, generic })
    }

    pub fn local_id(&self) -> PeerId {
        self.transport.local_id()
    }

    pub fn max_message_size(&self) -> usize {
        self.config.max_message_size
    }

    /// Join the current rooms and keep them rotating until `cancel` fires
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>, P2pError> {
        self.rotate(&cancel).await?;

        let hub = self.clone();
        let every = self.config.rotation_check.max(Duration::from_millis(10));
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = hub.rotate(&cancel).await {
                            tracing::warn!("Room rotation failed: {}", e);
                        }
                    }
                }
            }
            for channel in [Channel::Ledger, Channel::Generic] {
                if let Some(room) = hub.room(channel).write().take() {
                    room.reader.cancel();
                }
            }
        }))
    }

    /// Publish a block announcement on the ledger room
    pub async fn publish_ledger(&self, payload: Vec<u8>) -> Result<(), P2pError> {
        self.publish(Channel::Ledger, Envelope::new(payload)).await
    }

    /// Publish on the generic room
    pub async fn publish_generic(&self, envelope: Envelope) -> Result<(), P2pError> {
        self.publish(Channel::Generic, envelope).await
    }

    /// Peers currently seen on a room
    pub fn peers(&self, channel: Channel) -> Vec<PeerId> {
        self.room(channel)
            .read()
            .as_ref()
            .map(|room| room.topic.peers())
            .unwrap_or_default()
    }

    async fn publish(&self, channel: Channel, envelope: Envelope) -> Result<(), P2pError> {
        let topic = self
            .room(channel)
            .read()
            .as_ref()
            .map(|room| room.topic.clone())
            .ok_or_else(|| P2pError::TopicClosed(format!("{:?}", channel)))?;

        let plain = envelope.to_bytes();
        if plain.len() > self.config.max_message_size {
            return Err(P2pError::MessageTooLarge {
                size: plain.len(),
                limit: self.config.max_message_size,
            });
        }

        let exchange = &self.config.exchange;
        let key = exchange.seal_key_for_window(exchange.current_window(), channel.seal_salts());
        let sealed = self.sealer.seal(&plain, &key)?;
        topic.publish(sealed).await
    }

    fn room(&self, channel: Channel) -> &RwLock<Option<Room>> {
        match channel {
            Channel::Ledger => &self.ledger_room,
            Channel::Generic => &self.generic_room,
        }
    }

    fn channels(&self) -> Vec<Channel> {
        if self.config.generic {
            vec![Channel::Ledger, Channel::Generic]
        } else {
            vec![Channel::Ledger]
        }
    }

    async fn rotate(&self, cancel: &CancellationToken) -> Result<(), P2pError> {
        let window = self.config.room.current_window();

        for channel in self.channels() {
            let current = self.room(channel).read().as_ref().map(|r| r.window);
            if current == Some(window) {
                continue;
            }

            let name = self.config.room.topic_for_window(window, channel.topic_salts());
            let topic = self.transport.join(&name).await?;
            let reader = cancel.child_token();
            tokio::spawn(read_room(
                topic.subscribe(),
                reader.clone(),
                self.local_id(),
                self.sealer.clone(),
                self.config.exchange.clone(),
                self.config.max_message_size,
                channel,
                match channel {
                    Channel::Ledger => self.ledger_tx.clone(),
                    Channel::Generic => self.generic_tx.clone(),
                },
            ));

            let previous = self.room(channel).write().replace(Room { window, topic, reader });
            tracing::debug!("Joined {:?} room for window {}", channel, window);

            if let Some(previous) = previous {
                let grace = self.config.rotation_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    previous.reader.cancel();
                    drop(previous.topic);
                });
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_room(
    mut rx: broadcast::Receiver<GossipMessage>,
    cancel: CancellationToken,
    local: PeerId,
    sealer: Arc<dyn Sealer>,
    exchange: OtpKey,
    max_message_size: usize,
    channel: Channel,
    out: mpsc::Sender<HubMessage>,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("{:?} room lagged {} messages", channel, n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if message.from == local {
            continue;
        }
        if message.data.len() > max_message_size {
            tracing::debug!("Dropped oversized message from {}", message.from.short());
            continue;
        }

        let Some(envelope) = open(&*sealer, &exchange, channel, &message.data) else {
            tracing::debug!("Could not open {:?} message from {}", channel, message.from.short());
            continue;
        };

        let delivered = HubMessage {
            sender: message.from,
            payload: envelope.payload,
            annotations: envelope.annotations,
        };
        if out.send(delivered).await.is_err() {
            break;
        }
    }
}

/// Try the current and the previous window's key
fn open(sealer: &dyn Sealer, exchange: &OtpKey, channel: Channel, sealed: &[u8]) -> Option<Envelope> {
    let window = exchange.current_window();
    for w in [window, window.saturating_sub(1)] {
        let key = exchange.seal_key_for_window(w, channel.seal_salts());
        if let Ok(plain) = sealer.open(sealed, &key) {
            if let Ok(envelope) = Envelope::from_bytes(&plain) {
                return Some(envelope);
            }
        }
    }
    None
}
