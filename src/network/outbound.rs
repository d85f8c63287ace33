use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error};

use super::connection::PacketSink;
use crate::core::{Error, ProtocolConfig, Result};
use crate::protocol::message::{Request, Response, ResponseId};
use crate::protocol::{Crypto, Packet};

/// Pending calls keyed by request id
struct Continuations {
    next_id: u32,
    pending: HashMap<u32, mpsc::Sender<Bytes>>,
}

/// Request/response transport to one device, or to the broadcast address.
///
/// Calls are multiplexed over the shared socket; responses are routed back
/// by request id through [`Outbound::handle`].
pub struct Outbound {
    dest: SocketAddr,
    crypto: Option<Crypto>,
    socket: Arc<dyn PacketSink>,
    max_retries: usize,
    timeout: Duration,
    continuations: RwLock<Continuations>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("dest", &self.dest)
            .field("crypto", &self.crypto)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Removes its continuation when the call finishes, however it finishes
struct ContinuationGuard<'a> {
    outbound: &'a Outbound,
    id: u32,
}

impl Drop for ContinuationGuard<'_> {
    fn drop(&mut self) {
        self.outbound.continuations.write().pending.remove(&self.id);
    }
}

impl Outbound {
    /// Creates a transport using the retry policy from `config`
    pub fn new(
        crypto: Option<Crypto>,
        dest: SocketAddr,
        socket: Arc<dyn PacketSink>,
        config: &ProtocolConfig,
    ) -> Self {
        Self::with_policy(crypto, dest, socket, config.max_retries, config.call_timeout)
    }

    /// Creates a transport with an explicit retry policy
    pub fn with_policy(
        crypto: Option<Crypto>,
        dest: SocketAddr,
        socket: Arc<dyn PacketSink>,
        max_retries: usize,
        timeout: Duration,
    ) -> Self {
        Outbound {
            dest,
            crypto,
            socket,
            max_retries,
            timeout,
            continuations: RwLock::new(Continuations {
                next_id: 1,
                pending: HashMap::new(),
            }),
        }
    }

    /// Address packets are sent to
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Cipher of the device, absent for the broadcast transport
    pub fn crypto(&self) -> Option<&Crypto> {
        self.crypto.as_ref()
    }

    /// Number of calls currently waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.continuations.read().pending.len()
    }

    fn encryption(&self) -> Result<&Crypto> {
        self.crypto
            .as_ref()
            .ok_or_else(|| Error::crypto(format!("No device token for {}", self.dest)))
    }

    fn register(&self) -> (u32, mpsc::Receiver<Bytes>) {
        let mut table = self.continuations.write();

        // Ids wrap; 0 is never used and in-flight ids are never reused.
        let mut id = table.next_id;
        while id == 0 || table.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        table.next_id = id.wrapping_add(1);

        let (tx, rx) = mpsc::channel(1);
        table.pending.insert(id, tx);
        (id, rx)
    }

    /// Makes a call and waits for the raw response bytes.
    ///
    /// Each attempt sends a freshly stamped packet and waits up to the
    /// per-attempt timeout. Fails with [`Error::Timeout`] once `max_retries`
    /// retries have gone unanswered.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Bytes> {
        let crypto = self.encryption()?;
        let (id, mut rx) = self.register();
        let _guard = ContinuationGuard { outbound: self, id };

        let body = serde_json::to_vec(&Request {
            id,
            method: method.to_string(),
            params,
        })?;

        let attempts = self.max_retries + 1;
        for attempt in 1..=attempts {
            let packet = crypto.new_packet(&body)?;
            self.send(&packet).await?;

            match timeout(self.timeout, rx.recv()).await {
                Ok(Some(data)) => return Ok(data),
                Ok(None) => return Err(Error::closed(format!("Call {} was dropped", id))),
                Err(_) => debug!(
                    "Timed out waiting for response {} from {} (attempt {}/{})",
                    id, self.dest, attempt, attempts
                ),
            }
        }

        error!("Max retries exceeded whilst sending request {} to {}", method, self.dest);
        Err(Error::Timeout {
            dest: self.dest,
            attempts,
        })
    }

    /// Makes a call and decodes the `result` of the response envelope
    pub async fn call_and_deserialize<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T> {
        let data = self.call(method, params).await?;
        let response: Response<T> = serde_json::from_slice(&data)?;
        response.into_result()
    }

    /// Sends a raw packet without waiting for a response
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        debug!(
            "Sending packet to {} with checksum {}",
            self.dest,
            hex::encode(packet.header.checksum)
        );
        self.socket.send_datagram(&packet.serialize(), self.dest).await?;
        Ok(())
    }

    /// Routes an inbound packet to the call waiting for it.
    ///
    /// Discovery packets are ignored. A response nobody is waiting for (the
    /// call already timed out or was answered) is dropped.
    pub async fn handle(&self, packet: &Packet) -> Result<()> {
        if packet.is_discovery() {
            return Ok(());
        }

        let crypto = self.encryption()?;
        crypto.verify_packet(packet)?;
        let data = crypto.decrypt(&packet.payload)?;
        let ResponseId { id } = serde_json::from_slice(&data)?;

        let waiter = self.continuations.read().pending.get(&id).cloned();
        match waiter {
            Some(tx) => {
                debug!("Response {} from {} was reconciled", id, self.dest);
                if tx.send(Bytes::from(data)).await.is_err() {
                    debug!("Call {} finished before its response was delivered", id);
                }
            }
            None => debug!("Unable to reconcile response {} from {}", id, self.dest),
        }

        Ok(())
    }
}
