//! Devices known to the protocol
//!
//! Every discovered device starts as a provisional [`BaseDevice`] and is
//! replaced by a [`ClassifiedDevice`] once its product is known.

pub mod capability;
pub mod classify;
pub mod refresh;

pub use self::capability::{Capability, Light, LightState, Power, PowerState, Rgb};
pub use self::classify::{ClassifiedDevice, Classifier, Product, ProductClassifier};
pub use self::refresh::Refresher;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::core::{DeviceId, DeviceInfo, Result, Token};
use crate::event::{EventTarget, Subscription};
use crate::network::Outbound;
use crate::protocol::Packet;

/// A device registered with the protocol
#[async_trait]
pub trait Device: Send + Sync + std::fmt::Debug {
    /// Underlying device record
    fn base(&self) -> &BaseDevice;

    fn id(&self) -> DeviceId {
        self.base().id()
    }

    fn token(&self) -> Option<Token> {
        self.base().token()
    }

    /// Time the device last sent anything
    fn seen(&self) -> Instant {
        self.base().seen()
    }

    fn is_provisional(&self) -> bool {
        self.base().is_provisional()
    }

    fn product(&self) -> Product {
        Product::Unknown(String::new())
    }

    fn light(&self) -> Option<&Light> {
        None
    }

    fn power(&self) -> Option<&Power> {
        None
    }

    /// Subscribes to the events this device publishes
    fn subscribe(&self) -> Result<Subscription> {
        self.base().events().subscribe()
    }

    /// Handles a packet this device sent
    async fn handle(&self, packet: &Packet) -> Result<()> {
        self.base().handle(packet).await
    }

    /// Ends subscriptions and background work
    fn close(&self) {
        self.base().close()
    }
}

/// Identity, transport and liveness of one device
#[derive(Debug)]
pub struct BaseDevice {
    id: DeviceId,
    token: Option<Token>,
    outbound: Arc<Outbound>,
    seen: RwLock<Instant>,
    provisional: AtomicBool,
    events: EventTarget,
}

impl BaseDevice {
    pub fn new(id: DeviceId, outbound: Arc<Outbound>, seen: Instant, token: Option<Token>) -> Self {
        BaseDevice {
            id,
            token,
            outbound,
            seen: RwLock::new(seen),
            provisional: AtomicBool::new(true),
            events: EventTarget::new(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn outbound(&self) -> &Arc<Outbound> {
        &self.outbound
    }

    pub fn events(&self) -> &EventTarget {
        &self.events
    }

    pub fn seen(&self) -> Instant {
        *self.seen.read()
    }

    /// Records activity at `at`; never moves backwards
    pub fn mark_seen(&self, at: Instant) {
        let mut seen = self.seen.write();
        if at > *seen {
            *seen = at;
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.provisional.load(Ordering::Acquire)
    }

    pub fn set_provisional(&self, provisional: bool) {
        self.provisional.store(provisional, Ordering::Release);
    }

    /// Queries `miIO.info`
    pub async fn info(&self) -> Result<DeviceInfo> {
        self.outbound.call_and_deserialize("miIO.info", Vec::new()).await
    }

    /// Sends a hello packet to this device's address
    pub async fn discover(&self) -> Result<()> {
        self.outbound.send(&Packet::hello()).await
    }

    pub async fn handle(&self, packet: &Packet) -> Result<()> {
        self.mark_seen(packet.meta.decoded_at);
        self.outbound.handle(packet).await
    }

    pub fn close(&self) {
        self.events.close();
    }
}

impl Device for BaseDevice {
    fn base(&self) -> &BaseDevice {
        self
    }
}
