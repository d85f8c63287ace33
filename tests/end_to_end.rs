//! End-to-end tests against a simulated device on loopback UDP
//!
//! The simulator answers hello packets (revealing its token or not), and
//! serves `miIO.info`, `get_prop` and `set_power` like a smart plug.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use miio::protocol::{Crypto, Packet, Request};
use miio::{Client, DeviceId, Event, PowerState, Product, ProtocolConfig, Token, TokenStore};

const DEVICE: DeviceId = DeviceId(0x00c0_ffee);
const TOKEN: Token = Token([
    0x1f, 0x2e, 0x3d, 0x4c, 0x5b, 0x6a, 0x79, 0x88, 0x97, 0xa6, 0xb5, 0xc4, 0xd3, 0xe2, 0xf1, 0x00,
]);

struct SimulatedPlug {
    addr: SocketAddr,
    power: Arc<AtomicBool>,
}

async fn simulated_plug(reveal_token: bool) -> SimulatedPlug {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let power = Arc::new(AtomicBool::new(true));
    let state = power.clone();

    tokio::spawn(async move {
        let crypto = Crypto::new(DEVICE, TOKEN, 1, Instant::now());
        let mut buf = vec![0u8; 2048];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(_) => break,
            };
            let Ok(packet) = Packet::deserialize(&buf[..len]) else { continue };

            let reply = if packet.is_discovery() {
                let checksum = if reveal_token { TOKEN.0 } else { [0; 16] };
                Packet::new(DEVICE, checksum, 1, Bytes::new()).unwrap()
            } else {
                crypto.verify_packet(&packet).unwrap();
                let request: Request =
                    serde_json::from_slice(&crypto.decrypt(&packet.payload).unwrap()).unwrap();
                let result = handle(&request, &state);
                let body = json!({ "id": request.id, "result": result });
                crypto.new_packet(body.to_string().as_bytes()).unwrap()
            };
            let _ = socket.send_to(&reply.serialize(), from).await;
        }
    });

    SimulatedPlug { addr, power }
}

fn handle(request: &Request, power: &AtomicBool) -> Value {
    match request.method.as_str() {
        "miIO.info" => json!({
            "model": "chuangmi.plug.m1",
            "fw_ver": "SIM_0",
            "hw_ver": "SIM_0",
            "mac": "00:00:00:00:00:00",
        }),
        "get_prop" => {
            let on = power.load(Ordering::SeqCst);
            json!([if on { "on" } else { "off" }])
        }
        "set_power" => {
            power.store(request.params.first() == Some(&json!("on")), Ordering::SeqCst);
            json!(["ok"])
        }
        _ => Value::Null,
    }
}

fn config(sim: &SimulatedPlug) -> ProtocolConfig {
    ProtocolConfig {
        broadcast_addr: sim.addr,
        call_timeout: Duration::from_millis(500),
        max_retries: 3,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_discover_and_control_plug() {
    let sim = simulated_plug(true).await;
    let client = Client::bind(config(&sim), TokenStore::new()).unwrap();
    client.set_discovery_interval(Duration::from_millis(200));

    let device = client.find_device(DEVICE, Duration::from_secs(5)).await.unwrap();
    assert_eq!(device.product(), Product::PowerPlug);
    assert_eq!(device.token(), Some(TOKEN));
    assert_eq!(client.protocol().tokens().get(DEVICE), Some(TOKEN));

    let power = device.power().unwrap();
    power.set_power(PowerState::Off).await.unwrap();
    assert!(!sim.power.load(Ordering::SeqCst));

    // Subscribing starts the refresh, which picks up the change made
    // behind the client's back.
    sim.power.store(true, Ordering::SeqCst);
    let mut events = device.subscribe().unwrap();
    let update = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
    assert!(matches!(update, Some(Event::UpdatePower(PowerState::On))));

    client.shutdown();
    assert!(client.devices().is_empty());
}

#[tokio::test]
async fn test_masked_plug_is_reported_once() {
    let sim = simulated_plug(false).await;
    let client = Client::bind(config(&sim), TokenStore::new()).unwrap();
    let mut events = client.subscribe().unwrap();
    client.set_discovery_interval(Duration::from_millis(100));

    let first = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
    assert!(matches!(first, Some(Event::NewMaskedDevice(id)) if id == DEVICE));
    assert!(client.protocol().is_ignored(DEVICE));

    // Later hello responses are ignored without further events.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(events.try_recv().is_none());
    assert!(client.device(DEVICE).is_none());

    client.shutdown();
}

#[tokio::test]
async fn test_stored_token_unmasks_plug() {
    let sim = simulated_plug(false).await;
    let mut tokens = TokenStore::new();
    tokens.insert(DEVICE, TOKEN);
    let client = Client::bind(config(&sim), tokens).unwrap();
    client.set_discovery_interval(Duration::from_millis(200));

    let device = client.find_device(DEVICE, Duration::from_secs(5)).await.unwrap();
    assert_eq!(device.token(), Some(TOKEN));
    assert!(!client.protocol().is_ignored(DEVICE));

    client.shutdown();
}
