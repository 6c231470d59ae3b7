//! Multicast bus and unicast mesh sockets.
//!
//! Every device opens two UDP sockets: the shared multicast bus where
//! discovery and map-control traffic lives, and a unicast "mesh" socket
//! with an ephemeral port for peer-to-peer metadata and data. Both are
//! non-blocking; the device's `poll` drains them.

pub mod messages;
pub mod ordinal;

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use rosc::{OscBundle, OscMessage, OscPacket};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::time::Timetag;

/// Default multicast group of the bus.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 3);

/// Default bus port.
pub const MULTICAST_PORT: u16 = 7570;

/// Seconds between `/sync` heartbeats.
pub const SYNC_INTERVAL_SEC: f64 = 2.0;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("failed to open bus socket: {0}")]
    BusSocket(io::Error),
    #[error("failed to open mesh socket: {0}")]
    MeshSocket(io::Error),
    #[error("send failed: {0}")]
    Send(io::Error),
    #[error("wire encoding failed: {0}")]
    Encode(String),
}

/// Network parameters of a device.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    /// Interface to bind multicast to; `None` binds the default route.
    pub iface: Option<Ipv4Addr>,
    pub multicast_ttl: u32,
    /// Seconds without `/sync` before a peer expires.
    pub timeout_sec: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            group: MULTICAST_GROUP,
            port: MULTICAST_PORT,
            iface: None,
            multicast_ttl: 4,
            timeout_sec: crate::graph::DEFAULT_TIMEOUT_SEC,
        }
    }
}

impl NetworkConfig {
    /// Loopback-only configuration, used by tests to keep traffic off
    /// the LAN and to isolate test runs by port.
    pub fn loopback(port: u16) -> Self {
        NetworkConfig {
            port,
            iface: Some(Ipv4Addr::LOCALHOST),
            ..NetworkConfig::default()
        }
    }
}

/// The pair of sockets a device communicates through.
#[derive(Debug)]
pub struct NetworkBus {
    bus: UdpSocket,
    mesh: UdpSocket,
    group_addr: SocketAddr,
    mesh_port: u16,
    host: String,
}

impl NetworkBus {
    pub fn open(cfg: &NetworkConfig) -> Result<Self, NetError> {
        let iface = cfg.iface.unwrap_or(Ipv4Addr::UNSPECIFIED);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(NetError::BusSocket)?;
        // several devices per host share the bus port
        if let Err(e) = socket.set_reuse_address(true) {
            log::warn!("failed to set SO_REUSEADDR: {}", e);
        }
        #[cfg(unix)]
        if let Err(e) = socket.set_reuse_port(true) {
            log::warn!("failed to set SO_REUSEPORT: {}", e);
        }
        socket
            .set_multicast_ttl_v4(cfg.multicast_ttl)
            .map_err(NetError::BusSocket)?;
        // devices on the same host must hear each other
        socket
            .set_multicast_loop_v4(true)
            .map_err(NetError::BusSocket)?;
        socket
            .set_nonblocking(true)
            .map_err(NetError::BusSocket)?;
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), cfg.port);
        socket
            .bind(&bind_addr.into())
            .map_err(NetError::BusSocket)?;
        socket
            .join_multicast_v4(&cfg.group, &iface)
            .map_err(NetError::BusSocket)?;
        if cfg.iface.is_some() {
            socket
                .set_multicast_if_v4(&iface)
                .map_err(NetError::BusSocket)?;
        }
        let bus: UdpSocket = socket.into();

        let mesh_ip = cfg.iface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let mesh = UdpSocket::bind(SocketAddr::new(IpAddr::V4(mesh_ip), 0))
            .map_err(NetError::MeshSocket)?;
        mesh.set_nonblocking(true).map_err(NetError::MeshSocket)?;
        let mesh_port = mesh.local_addr().map_err(NetError::MeshSocket)?.port();

        let host = advertised_host(cfg);
        log::debug!(
            "bus on {}:{} via {}, mesh on {}:{}",
            cfg.group,
            cfg.port,
            iface,
            host,
            mesh_port
        );

        Ok(NetworkBus {
            bus,
            mesh,
            group_addr: SocketAddr::new(IpAddr::V4(cfg.group), cfg.port),
            mesh_port,
            host,
        })
    }

    /// The unicast port peers should send to.
    pub fn mesh_port(&self) -> u16 {
        self.mesh_port
    }

    /// The host string advertised in registration messages.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn send_bus(&self, msg: OscMessage) -> Result<(), NetError> {
        let buf = rosc::encoder::encode(&OscPacket::Message(msg))
            .map_err(|e| NetError::Encode(e.to_string()))?;
        self.bus
            .send_to(&buf, self.group_addr)
            .map_err(NetError::Send)?;
        Ok(())
    }

    /// Sends a timetagged bundle to a peer's mesh address.
    pub fn send_bundle(
        &self,
        addr: SocketAddr,
        time: Timetag,
        content: Vec<OscMessage>,
    ) -> Result<(), NetError> {
        let bundle = OscPacket::Bundle(OscBundle {
            timetag: time.into(),
            content: content.into_iter().map(OscPacket::Message).collect(),
        });
        let buf =
            rosc::encoder::encode(&bundle).map_err(|e| NetError::Encode(e.to_string()))?;
        self.mesh.send_to(&buf, addr).map_err(NetError::Send)?;
        Ok(())
    }

    pub fn send_to(&self, addr: SocketAddr, msg: OscMessage) -> Result<(), NetError> {
        let buf = rosc::encoder::encode(&OscPacket::Message(msg))
            .map_err(|e| NetError::Encode(e.to_string()))?;
        self.mesh.send_to(&buf, addr).map_err(NetError::Send)?;
        Ok(())
    }

    /// Non-blocking receive from the bus socket.
    pub fn recv_bus(&self, buf: &mut [u8]) -> Option<(OscPacket, SocketAddr)> {
        recv_packet(&self.bus, buf)
    }

    /// Non-blocking receive from the mesh socket.
    pub fn recv_mesh(&self, buf: &mut [u8]) -> Option<(OscPacket, SocketAddr)> {
        recv_packet(&self.mesh, buf)
    }
}

fn recv_packet(socket: &UdpSocket, buf: &mut [u8]) -> Option<(OscPacket, SocketAddr)> {
    loop {
        match socket.recv_from(buf) {
            Ok((n, src)) => match rosc::decoder::decode_udp(&buf[..n]) {
                Ok((_, packet)) => return Some((packet, src)),
                Err(e) => {
                    log::trace!("dropping undecodable packet from {}: {}", src, e);
                    continue;
                }
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(e) => {
                log::trace!("socket recv error: {}", e);
                return None;
            }
        }
    }
}

/// Picks the host address peers should be told about.
fn advertised_host(cfg: &NetworkConfig) -> String {
    if let Some(iface) = cfg.iface {
        return iface.to_string();
    }
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(ip)) => ip.to_string(),
        Ok(IpAddr::V6(ip)) => ip.to_string(),
        Err(e) => {
            log::warn!("could not determine local address: {}", e);
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_default();
            if host.is_empty() {
                Ipv4Addr::LOCALHOST.to_string()
            } else {
                host
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosc::OscType;

    fn unique_port(salt: u16) -> u16 {
        // spread tests across ports to avoid cross-talk
        20000 + (std::process::id() as u16 % 2000) + salt
    }

    #[test]
    fn loopback_bus_delivers_to_both_sockets() {
        let cfg = NetworkConfig::loopback(unique_port(0));
        let a = NetworkBus::open(&cfg).unwrap();
        let b = NetworkBus::open(&cfg).unwrap();

        a.send_bus(OscMessage {
            addr: "/sync".to_string(),
            args: vec![OscType::String("t.1".to_string()), OscType::Int(0)],
        })
        .unwrap();

        let mut buf = [0u8; 2048];
        let mut hits = 0;
        for _ in 0..100 {
            if b.recv_bus(&mut buf).is_some() {
                hits += 1;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(hits, 1, "multicast loopback packet never arrived");
    }

    #[test]
    fn mesh_sockets_get_distinct_ports() {
        let cfg = NetworkConfig::loopback(unique_port(1));
        let a = NetworkBus::open(&cfg).unwrap();
        let b = NetworkBus::open(&cfg).unwrap();
        assert_ne!(a.mesh_port(), 0);
        assert_ne!(a.mesh_port(), b.mesh_port());
    }

    #[test]
    fn bundles_arrive_over_the_mesh() {
        let cfg = NetworkConfig::loopback(unique_port(2));
        let a = NetworkBus::open(&cfg).unwrap();
        let b = NetworkBus::open(&cfg).unwrap();
        let to = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), b.mesh_port());

        a.send_bundle(
            to,
            Timetag::new(100, 0),
            vec![OscMessage {
                addr: "/d.1/in".to_string(),
                args: vec![OscType::Float(0.5)],
            }],
        )
        .unwrap();

        let mut buf = [0u8; 2048];
        for _ in 0..100 {
            if let Some((OscPacket::Bundle(bundle), _)) = b.recv_mesh(&mut buf) {
                assert_eq!(Timetag::from(bundle.timetag), Timetag::new(100, 0));
                assert_eq!(bundle.content.len(), 1);
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("bundle never arrived");
    }
}
