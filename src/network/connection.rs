use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::udp::UdpFramed;
use tracing::debug;

use crate::core::{Error, ProtocolConfig, Result};
use crate::protocol::{Packet, PacketCodec};

/// Raw datagram send primitive shared by every outbound transport
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Sends one datagram to `dest`
    async fn send_datagram(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl PacketSink for UdpSocket {
    async fn send_datagram(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.send_to(buf, dest).await
    }
}

/// Binds the shared UDP socket with broadcast enabled
pub fn bind_socket(config: &ProtocolConfig) -> Result<UdpSocket> {
    let (domain, ip) = match config.broadcast_addr {
        SocketAddr::V4(_) => (Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        SocketAddr::V6(_) => (Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
    };
    let addr = SocketAddr::new(ip, config.listen_port);
    let bind_err =
        |e: io::Error| Error::config(format!("Failed to bind socket on {}: {}", addr, e));

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    if domain == Domain::IPV4 {
        socket.set_broadcast(true).map_err(bind_err)?;
    }
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let socket = UdpSocket::from_std(socket.into()).map_err(bind_err)?;
    debug!("Bound MiIO socket on {:?}", socket.local_addr());
    Ok(socket)
}

/// Owns the UDP socket: sending is shared, receiving is framed into packets
pub struct Connection {
    socket: Arc<UdpSocket>,
}

impl Connection {
    /// Binds a new socket according to `config`
    pub fn bind(config: &ProtocolConfig) -> Result<Self> {
        Ok(Connection {
            socket: Arc::new(bind_socket(config)?),
        })
    }

    /// Wraps an already bound socket
    pub fn from_socket(socket: UdpSocket) -> Self {
        Connection {
            socket: Arc::new(socket),
        }
    }

    /// Send half, safe for concurrent use by every transport
    pub fn sink(&self) -> Arc<dyn PacketSink> {
        self.socket.clone()
    }

    /// Returns the local socket address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::config(format!("Failed to get local address: {}", e)))
    }

    /// Stream of decoded inbound packets tagged with their source address.
    ///
    /// Malformed datagrams and receive errors surface as `Err` items; the
    /// stream keeps going after them.
    pub fn inbound(&self) -> impl Stream<Item = Result<Packet>> + Send + Unpin + 'static {
        UdpFramed::new(self.socket.clone(), PacketCodec::new()).map(|item| {
            item.map(|(mut packet, addr)| {
                packet.meta.addr = Some(addr);
                packet
            })
        })
    }
}
