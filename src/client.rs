use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::{DeviceId, Error, ProtocolConfig, Result};
use crate::device::Device;
use crate::event::{Event, Subscription};
use crate::network::Protocol;
use crate::protocol::TokenStore;

/// Top-level handle owning a protocol and its periodic discovery
#[derive(Debug)]
pub struct Client {
    protocol: Protocol,
    discovery: Mutex<Option<CancellationToken>>,
}

impl Client {
    pub fn new(protocol: Protocol) -> Self {
        Client {
            protocol,
            discovery: Mutex::new(None),
        }
    }

    /// Binds a protocol with `config` and wraps it
    pub fn bind(config: ProtocolConfig, tokens: TokenStore) -> Result<Self> {
        Ok(Client::new(Protocol::bind(config, tokens)?))
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Runs discovery now and then every `period`, replacing any previous
    /// schedule
    pub fn set_discovery_interval(&self, period: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.discovery.lock().replace(token.clone()) {
            previous.cancel();
        }

        let protocol = self.protocol.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = protocol.discover().await {
                            warn!("Discovery failed: {}", e);
                        }
                    }
                }
            }
            debug!("Periodic discovery stopped");
        });
    }

    pub fn stop_discovery(&self) {
        if let Some(token) = self.discovery.lock().take() {
            token.cancel();
        }
    }

    pub async fn discover(&self) -> Result<()> {
        self.protocol.discover().await
    }

    pub fn subscribe(&self) -> Result<Subscription> {
        self.protocol.subscribe()
    }

    pub fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.protocol.devices()
    }

    pub fn device(&self, id: DeviceId) -> Option<Arc<dyn Device>> {
        self.protocol.device(id)
    }

    /// Waits until device `id` is registered and classified
    pub async fn find_device(&self, id: DeviceId, wait: Duration) -> Result<Arc<dyn Device>> {
        let mut events = self.subscribe()?;
        if let Some(device) = self.device(id).filter(|d| !d.is_provisional()) {
            return Ok(device);
        }

        let found = timeout(wait, async {
            while let Some(event) = events.recv().await {
                if let Event::NewDevice(device) = event {
                    if device.id() == id {
                        return Some(device);
                    }
                }
            }
            None
        })
        .await;

        match found {
            Ok(Some(device)) => Ok(device),
            Ok(None) => Err(Error::closed("Client shut down while waiting for device")),
            Err(_) => Err(Error::UnknownDevice(id)),
        }
    }

    /// Stops discovery and the protocol
    pub fn shutdown(&self) {
        self.stop_discovery();
        self.protocol.shutdown();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop_discovery();
    }
}
