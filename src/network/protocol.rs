//! Protocol orchestrator
//!
//! Reads the inbound packet stream, turns hello responses into registered
//! devices and routes every other packet to the device it came from.
//! A device moves from unseen to provisional when its hello response is
//! processed, to classified once the classifier has identified it, and is
//! expired by [`Protocol::discover`] after going silent.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::{Connection, PacketSink};
use super::outbound::Outbound;
use crate::core::{DeviceId, Error, ProtocolConfig, Result, Token};
use crate::device::{BaseDevice, Classifier, Device, ProductClassifier};
use crate::event::{Event, EventTarget, Publisher, Subscription};
use crate::protocol::{Crypto, Packet, TokenStore};

/// Builds the provisional record for a newly discovered device
pub trait DeviceFactory: Send + Sync {
    fn construct(
        &self,
        id: DeviceId,
        outbound: Arc<Outbound>,
        seen: Instant,
        token: Option<Token>,
    ) -> Arc<BaseDevice>;
}

impl<F> DeviceFactory for F
where
    F: Fn(DeviceId, Arc<Outbound>, Instant, Option<Token>) -> Arc<BaseDevice> + Send + Sync,
{
    fn construct(
        &self,
        id: DeviceId,
        outbound: Arc<Outbound>,
        seen: Instant,
        token: Option<Token>,
    ) -> Arc<BaseDevice> {
        self(id, outbound, seen, token)
    }
}

fn base_device(
    id: DeviceId,
    outbound: Arc<Outbound>,
    seen: Instant,
    token: Option<Token>,
) -> Arc<BaseDevice> {
    Arc::new(BaseDevice::new(id, outbound, seen, token))
}

struct Inner {
    config: ProtocolConfig,
    socket: Arc<dyn PacketSink>,
    broadcast: BaseDevice,
    tokens: RwLock<TokenStore>,
    persist: tokio::sync::Mutex<()>,
    devices: RwLock<HashMap<DeviceId, Arc<dyn Device>>>,
    ignored: RwLock<HashSet<DeviceId>>,
    last_discovery: Mutex<Option<Instant>>,
    expire_after: Mutex<Option<Duration>>,
    factory: Arc<dyn DeviceFactory>,
    classifier: Arc<dyn Classifier>,
    events: EventTarget,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to the protocol engine; clones share the same state
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("broadcast_addr", &self.inner.config.broadcast_addr)
            .field("devices", &self.inner.devices.read().len())
            .field("ignored", &self.inner.ignored.read().len())
            .finish()
    }
}

impl Protocol {
    /// Binds the UDP socket and starts the dispatch loop
    pub fn bind(config: ProtocolConfig, tokens: TokenStore) -> Result<Self> {
        let connection = Connection::bind(&config)?;
        info!("Listening on {}", connection.local_addr()?);

        let classifier = Arc::new(ProductClassifier::new(config.refresh_interval));
        let protocol = Protocol::with_parts(
            config,
            tokens,
            connection.sink(),
            Arc::new(base_device),
            classifier,
        );
        protocol.start(connection.inbound());
        Ok(protocol)
    }

    /// Assembles a protocol from its collaborators without starting dispatch
    pub fn with_parts(
        config: ProtocolConfig,
        tokens: TokenStore,
        socket: Arc<dyn PacketSink>,
        factory: Arc<dyn DeviceFactory>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let broadcast = BaseDevice::new(
            DeviceId(0),
            Arc::new(Outbound::new(None, config.broadcast_addr, socket.clone(), &config)),
            Instant::now(),
            None,
        );

        Protocol {
            inner: Arc::new(Inner {
                expire_after: Mutex::new(config.expire_after),
                config,
                socket,
                broadcast,
                tokens: RwLock::new(tokens),
                persist: tokio::sync::Mutex::new(()),
                devices: RwLock::new(HashMap::new()),
                ignored: RwLock::new(HashSet::new()),
                last_discovery: Mutex::new(None),
                factory,
                classifier,
                events: EventTarget::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Spawns the dispatch loop over `inbound`.
    ///
    /// Each packet is processed on its own task. Stream errors are logged
    /// and skipped. The loop ends when the stream ends, on
    /// [`Protocol::shutdown`], or once every handle is dropped.
    pub fn start<S>(&self, inbound: S) -> JoinHandle<()>
    where
        S: Stream<Item = Result<Packet>> + Send + Unpin + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(dispatch(weak, shutdown, inbound))
    }

    /// Processes one inbound packet
    pub async fn process(&self, packet: Packet) -> Result<()> {
        let id = packet.header.device_id;
        if self.is_ignored(id) {
            return Ok(());
        }

        match self.device(id) {
            Some(device) => device.handle(&packet).await,
            None if packet.is_discovery() => self.on_hello(packet).await,
            None => Err(Error::UnknownDevice(id)),
        }
    }

    async fn on_hello(&self, packet: Packet) -> Result<()> {
        let id = packet.header.device_id;
        debug!("Device {} responded to hello", id);

        let token = if packet.has_zero_checksum() {
            let stored = self.inner.tokens.read().get(id);
            match stored {
                Some(token) => {
                    debug!("Loaded token for device {} from store", id);
                    token
                }
                None => {
                    self.ignore(id);
                    return Ok(());
                }
            }
        } else {
            let token = Token(packet.header.checksum);
            self.remember_token(id, token).await;
            token
        };

        let addr = packet.meta.addr.ok_or_else(|| {
            Error::format(format!("Hello response from device {} has no source address", id))
        })?;
        let crypto = Crypto::new(id, token, packet.header.stamp, packet.meta.decoded_at);
        let outbound = Arc::new(Outbound::new(
            Some(crypto),
            addr,
            self.inner.socket.clone(),
            &self.inner.config,
        ));
        let provisional =
            self.inner
                .factory
                .construct(id, outbound, packet.meta.decoded_at, Some(token));

        // Register right away so packets arriving during classification
        // reach the device.
        {
            let mut devices = self.inner.devices.write();
            if devices.contains_key(&id) {
                debug!("Device {} was registered concurrently", id);
                return Ok(());
            }
            devices.insert(id, provisional.clone());
        }

        info!("Classifying device {} at {}", id, addr);
        let device = match self.inner.classifier.classify(provisional.clone()).await {
            Ok(device) => device,
            Err(e) => {
                self.inner.devices.write().remove(&id);
                provisional.close();
                return Err(e);
            }
        };

        self.inner.devices.write().insert(id, device.clone());
        device.base().set_provisional(false);
        info!("Discovered device {} ({:?})", id, device.product());
        if let Err(e) = self.inner.events.publish(Event::NewDevice(device)) {
            warn!("Failed to publish new device {}: {}", id, e);
        }
        Ok(())
    }

    /// Permanently ignores a device that withholds its token
    fn ignore(&self, id: DeviceId) {
        if !self.inner.ignored.write().insert(id) {
            return;
        }
        warn!(
            "Device {} is not revealing its token. Collect it manually and add it to the token store.",
            id
        );
        if let Err(e) = self.inner.events.publish(Event::NewMaskedDevice(id)) {
            warn!("Failed to publish masked device {}: {}", id, e);
        }
    }

    /// Stores a revealed token and persists the store if configured
    async fn remember_token(&self, id: DeviceId, token: Token) {
        {
            let mut tokens = self.inner.tokens.write();
            if tokens.get(id) == Some(token) {
                return;
            }
            tokens.insert(id, token);
        }

        let Some(path) = self.inner.config.token_file.clone() else {
            return;
        };
        // Writers take turns, and each snapshot is taken inside the turn so
        // the last write holds every token inserted before it.
        let _turn = self.inner.persist.lock().await;
        let snapshot = self.inner.tokens.read().clone();
        match tokio::task::spawn_blocking(move || snapshot.write_file(path)).await {
            Ok(Ok(())) => debug!("Persisted token of device {}", id),
            Ok(Err(e)) => warn!("Failed to persist token of device {}: {}", id, e),
            Err(e) => error!("Token writer panicked: {}", e),
        }
    }

    /// Expires silent devices, then broadcasts a hello packet.
    ///
    /// The first call only records the baseline; devices become eligible
    /// for expiry from the second call onward.
    pub async fn discover(&self) -> Result<()> {
        debug!("Running discovery...");
        let now = Instant::now();

        let previous = *self.inner.last_discovery.lock();
        let expire_after = *self.inner.expire_after.lock();
        if let (Some(_), Some(expire_after)) = (previous, expire_after) {
            self.expire(now, expire_after);
        }

        self.inner.broadcast.discover().await?;
        *self.inner.last_discovery.lock() = Some(now);
        Ok(())
    }

    fn expire(&self, now: Instant, expire_after: Duration) {
        let stale: Vec<Arc<dyn Device>> = self
            .inner
            .devices
            .read()
            .values()
            .filter(|device| {
                !device.is_provisional()
                    && now.saturating_duration_since(device.seen()) > expire_after
            })
            .cloned()
            .collect();

        for device in stale {
            let id = device.id();
            debug!(
                "Device {} is stale, last seen {:?} ago",
                id,
                now.saturating_duration_since(device.seen())
            );

            let removed = {
                let mut devices = self.inner.devices.write();
                match devices.get(&id) {
                    Some(current) if Arc::ptr_eq(current, &device) => devices.remove(&id),
                    _ => None,
                }
            };
            if removed.is_none() {
                continue;
            }

            device.close();
            info!("Expired device {}", id);
            if let Err(e) = self.inner.events.publish(Event::ExpiredDevice(device)) {
                warn!("Failed to publish expired device {}: {}", id, e);
            }
        }
    }

    /// Sets how long a device may stay silent before it is expired
    pub fn set_expiry_time(&self, expire_after: Duration) {
        *self.inner.expire_after.lock() = Some(expire_after);
    }

    pub fn subscribe(&self) -> Result<Subscription> {
        self.inner.events.subscribe()
    }

    pub fn device(&self, id: DeviceId) -> Option<Arc<dyn Device>> {
        self.inner.devices.read().get(&id).cloned()
    }

    /// Registered devices ordered by id
    pub fn devices(&self) -> Vec<Arc<dyn Device>> {
        let mut devices: Vec<_> = self.inner.devices.read().values().cloned().collect();
        devices.sort_by_key(|device| device.id());
        devices
    }

    pub fn is_ignored(&self, id: DeviceId) -> bool {
        self.inner.ignored.read().contains(&id)
    }

    /// Copy of the current token store
    pub fn tokens(&self) -> TokenStore {
        self.inner.tokens.read().clone()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    /// Stops dispatch, closes every device and ends all subscriptions
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let devices: Vec<_> = self.inner.devices.write().drain().map(|(_, d)| d).collect();
        for device in devices {
            device.close();
        }
        self.inner.events.close();
    }
}

async fn dispatch<S>(inner: Weak<Inner>, shutdown: CancellationToken, mut inbound: S)
where
    S: Stream<Item = Result<Packet>> + Send + Unpin + 'static,
{
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = inbound.next() => item,
        };

        let packet = match item {
            Some(Ok(packet)) => packet,
            Some(Err(e)) => {
                warn!("Dropping inbound datagram: {}", e);
                continue;
            }
            None => {
                debug!("Inbound stream ended");
                break;
            }
        };

        let Some(strong) = inner.upgrade() else { break };
        let protocol = Protocol { inner: strong };
        if protocol.is_ignored(packet.header.device_id) {
            continue;
        }

        tokio::spawn(async move {
            let id = packet.header.device_id;
            let from = packet.meta.addr;
            if let Err(e) = protocol.process(packet).await {
                match e {
                    Error::UnknownDevice(_) => debug!("Dropping packet from {:?}: {}", from, e),
                    e => warn!("Unable to process packet for device {}: {}", id, e),
                }
            }
        });
    }
    debug!("Dispatch loop stopped");
}
