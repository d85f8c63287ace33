//! Helpers shared by unit tests: an in-process device answering calls

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::{DeviceId, Token};
use crate::network::{Outbound, PacketSink};
use crate::protocol::{Crypto, Packet, Request};

pub(crate) const DEVICE: DeviceId = DeviceId(0x0403_2211);
pub(crate) const TOKEN: Token = Token([0x3c; 16]);

struct QueueSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl PacketSink for QueueSink {
    async fn send_datagram(&self, buf: &[u8], _dest: SocketAddr) -> io::Result<usize> {
        let _ = self.tx.send(Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }
}

/// Requests received by a [`fake_device`], in arrival order
pub(crate) type RequestLog = Arc<Mutex<Vec<Request>>>;

/// Outbound transport wired to a simulated device that answers every
/// request with `respond(request)` as the result.
pub(crate) fn fake_device<F>(respond: F) -> (Arc<Outbound>, RequestLog)
where
    F: Fn(&Request) -> Value + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let crypto = Crypto::new(DEVICE, TOKEN, 1, Instant::now());
    let outbound = Arc::new(Outbound::with_policy(
        Some(crypto),
        "127.0.0.1:54321".parse().unwrap(),
        Arc::new(QueueSink { tx }),
        0,
        Duration::from_secs(1),
    ));

    let log: RequestLog = Arc::default();
    let weak: Weak<Outbound> = Arc::downgrade(&outbound);
    let device = Crypto::new(DEVICE, TOKEN, 1, Instant::now());
    let requests = log.clone();

    tokio::spawn(async move {
        while let Some(datagram) = rx.recv().await {
            let Some(outbound) = weak.upgrade() else { break };
            let packet = Packet::deserialize(&datagram).unwrap();
            if packet.is_discovery() {
                continue;
            }
            device.verify_packet(&packet).unwrap();
            let request: Request =
                serde_json::from_slice(&device.decrypt(&packet.payload).unwrap()).unwrap();

            let body = json!({ "id": request.id, "result": respond(&request) });
            requests.lock().push(request);

            let reply = device.new_packet(body.to_string().as_bytes()).unwrap();
            outbound.handle(&reply).await.unwrap();
        }
    });

    (outbound, log)
}
