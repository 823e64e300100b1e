//! Raw UDP sockets owned by plugins
//!
//! Sockets are non-blocking and polled by the plugin. Incoming datagrams
//! are drained into a bounded per-socket queue so `pending` can report a
//! count. Every operation checks that the caller owns the socket.
//! Multicast TTL and loopback set before the OS socket exists are kept and
//! applied when it is opened.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::net::UdpSocket;
use tracing::debug;

pub const MAX_QUEUED_DATAGRAMS: usize = 1000;
const MAX_DATAGRAM_BYTES: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    V4,
    V6,
}

impl SocketFamily {
    pub fn from_abi(kind: i32) -> Self {
        if kind == 1 { Self::V6 } else { Self::V4 }
    }

    fn unspecified(self, port: u16) -> SocketAddr {
        match self {
            Self::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            Self::V6 => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

#[derive(Debug, Default, Clone, Copy)]
struct MulticastOptions {
    ttl: Option<u32>,
    looped: Option<bool>,
}

struct ManagedSocket {
    plugin_id: String,
    family: SocketFamily,
    socket: Option<UdpSocket>,
    queue: VecDeque<Datagram>,
    multicast: MulticastOptions,
}

impl ManagedSocket {
    fn open(&mut self, port: u16) -> io::Result<&UdpSocket> {
        let socket = bind_socket(self.family.unspecified(port))?;
        apply_multicast(&socket, self.family, self.multicast)?;
        let socket = self.socket.insert(socket);
        Ok(&*socket)
    }

    fn bound(&self) -> io::Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket not bound"))
    }

    fn drain(&mut self) {
        let Some(socket) = &self.socket else { return };
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        while let Ok((n, from)) = socket.try_recv_from(&mut buf) {
            if self.queue.len() >= MAX_QUEUED_DATAGRAMS {
                self.queue.pop_front();
            }
            self.queue.push_back(Datagram {
                data: buf[..n].to_vec(),
                from,
            });
        }
    }
}

#[derive(Default)]
struct SocketTable {
    next_id: i32,
    sockets: HashMap<i32, ManagedSocket>,
}

#[derive(Default)]
pub struct SocketManager {
    table: Mutex<SocketTable>,
}

fn bind_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(io::Error::other("no async runtime for socket"));
    }
    let std_socket = std::net::UdpSocket::bind(addr)?;
    std_socket.set_nonblocking(true)?;
    UdpSocket::from_std(std_socket)
}

fn apply_multicast(socket: &UdpSocket, family: SocketFamily, options: MulticastOptions) -> io::Result<()> {
    match family {
        SocketFamily::V4 => {
            if let Some(ttl) = options.ttl {
                socket.set_multicast_ttl_v4(ttl)?;
            }
            if let Some(looped) = options.looped {
                socket.set_multicast_loop_v4(looped)?;
            }
        }
        SocketFamily::V6 => {
            if options.ttl.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "multicast TTL is only supported on IPv4 sockets",
                ));
            }
            if let Some(looped) = options.looped {
                socket.set_multicast_loop_v6(looped)?;
            }
        }
    }
    Ok(())
}

impl SocketManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, SocketTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_socket<R>(
        &self,
        plugin_id: &str,
        socket_id: i32,
        f: impl FnOnce(&mut ManagedSocket) -> io::Result<R>,
    ) -> io::Result<R> {
        let mut table = self.table();
        match table.sockets.get_mut(&socket_id) {
            Some(managed) if managed.plugin_id == plugin_id => f(managed),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("socket {socket_id} not owned by {plugin_id}"),
            )),
        }
    }

    /// Reserve a socket id; the OS socket is opened on bind or first send
    pub fn create(&self, plugin_id: &str, family: SocketFamily) -> i32 {
        let mut table = self.table();
        table.next_id += 1;
        let id = table.next_id;
        table.sockets.insert(
            id,
            ManagedSocket {
                plugin_id: plugin_id.to_string(),
                family,
                socket: None,
                queue: VecDeque::new(),
                multicast: MulticastOptions::default(),
            },
        );
        debug!(plugin_id, socket_id = id, ?family, "created socket");
        id
    }

    pub fn bind(&self, plugin_id: &str, socket_id: i32, port: u16) -> io::Result<SocketAddr> {
        self.with_socket(plugin_id, socket_id, |managed| {
            if managed.socket.is_some() {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "socket already bound"));
            }
            managed.open(port)?.local_addr()
        })
    }

    pub fn join_multicast(
        &self,
        plugin_id: &str,
        socket_id: i32,
        group: IpAddr,
        interface: Option<Ipv4Addr>,
    ) -> io::Result<()> {
        self.with_socket(plugin_id, socket_id, |managed| {
            let socket = managed.bound()?;
            match group {
                IpAddr::V4(group) => {
                    socket.join_multicast_v4(group, interface.unwrap_or(Ipv4Addr::UNSPECIFIED))
                }
                IpAddr::V6(group) => socket.join_multicast_v6(&group, 0),
            }
        })
    }

    pub fn leave_multicast(
        &self,
        plugin_id: &str,
        socket_id: i32,
        group: IpAddr,
        interface: Option<Ipv4Addr>,
    ) -> io::Result<()> {
        self.with_socket(plugin_id, socket_id, |managed| {
            let socket = managed.bound()?;
            match group {
                IpAddr::V4(group) => {
                    socket.leave_multicast_v4(group, interface.unwrap_or(Ipv4Addr::UNSPECIFIED))
                }
                IpAddr::V6(group) => socket.leave_multicast_v6(&group, 0),
            }
        })
    }

    /// Hop limit for outgoing multicast; deferred until the socket opens
    pub fn set_multicast_ttl(&self, plugin_id: &str, socket_id: i32, ttl: u32) -> io::Result<()> {
        self.with_socket(plugin_id, socket_id, |managed| {
            let options = MulticastOptions {
                ttl: Some(ttl),
                ..managed.multicast
            };
            if let Some(socket) = &managed.socket {
                apply_multicast(socket, managed.family, options)?;
            } else if managed.family == SocketFamily::V6 {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "multicast TTL is only supported on IPv4 sockets",
                ));
            }
            managed.multicast = options;
            Ok(())
        })
    }

    /// Whether this host receives its own multicast sends; deferred until
    /// the socket opens
    pub fn set_multicast_loopback(&self, plugin_id: &str, socket_id: i32, enabled: bool) -> io::Result<()> {
        self.with_socket(plugin_id, socket_id, |managed| {
            let options = MulticastOptions {
                looped: Some(enabled),
                ..managed.multicast
            };
            if let Some(socket) = &managed.socket {
                apply_multicast(socket, managed.family, options)?;
            }
            managed.multicast = options;
            Ok(())
        })
    }

    pub fn set_broadcast(&self, plugin_id: &str, socket_id: i32, enabled: bool) -> io::Result<()> {
        self.with_socket(plugin_id, socket_id, |managed| managed.bound()?.set_broadcast(enabled))
    }

    pub fn send(&self, plugin_id: &str, socket_id: i32, to: SocketAddr, data: &[u8]) -> io::Result<usize> {
        self.with_socket(plugin_id, socket_id, |managed| {
            if managed.socket.is_none() {
                managed.open(0)?;
            }
            managed.bound()?.try_send_to(data, to)
        })
    }

    /// Pop the next queued datagram, if any
    pub fn recv(&self, plugin_id: &str, socket_id: i32) -> io::Result<Option<Datagram>> {
        self.with_socket(plugin_id, socket_id, |managed| {
            managed.drain();
            Ok(managed.queue.pop_front())
        })
    }

    pub fn pending(&self, plugin_id: &str, socket_id: i32) -> io::Result<usize> {
        self.with_socket(plugin_id, socket_id, |managed| {
            managed.drain();
            Ok(managed.queue.len())
        })
    }

    pub fn close(&self, plugin_id: &str, socket_id: i32) -> bool {
        let mut table = self.table();
        let owned = table
            .sockets
            .get(&socket_id)
            .is_some_and(|m| m.plugin_id == plugin_id);
        if owned {
            table.sockets.remove(&socket_id);
            debug!(plugin_id, socket_id, "closed socket");
        }
        owned
    }

    pub fn close_all_for_plugin(&self, plugin_id: &str) -> usize {
        let mut table = self.table();
        let before = table.sockets.len();
        table.sockets.retain(|_, m| m.plugin_id != plugin_id);
        let closed = before - table.sockets.len();
        if closed > 0 {
            debug!(plugin_id, closed, "closed plugin sockets");
        }
        closed
    }

    pub fn open_count(&self, plugin_id: &str) -> usize {
        self.table()
            .sockets
            .values()
            .filter(|m| m.plugin_id == plugin_id)
            .count()
    }

    pub fn clear(&self) {
        self.table().sockets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_loopback_send_and_receive() {
        let manager = SocketManager::new();
        let rx = manager.create("radar", SocketFamily::V4);
        let local = manager.bind("radar", rx, 0).expect("bind");

        let tx = manager.create("radar", SocketFamily::V4);
        let to = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port());
        assert_eq!(manager.send("radar", tx, to, b"$GPRMC").expect("send"), 6);

        let mut received = None;
        for _ in 0..50 {
            if let Some(d) = manager.recv("radar", rx).expect("recv") {
                received = Some(d);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let datagram = received.expect("datagram arrived");
        assert_eq!(datagram.data, b"$GPRMC");
        assert_eq!(manager.pending("radar", rx).expect("pending"), 0);
    }

    #[tokio::test]
    async fn test_sockets_are_private_to_their_plugin() {
        let manager = SocketManager::new();
        let id = manager.create("owner", SocketFamily::V4);
        assert!(manager.bind("intruder", id, 0).is_err());
        assert!(!manager.close("intruder", id));
        assert_eq!(manager.open_count("owner"), 1);
    }

    #[tokio::test]
    async fn test_close_all_for_plugin() {
        let manager = SocketManager::new();
        manager.create("a", SocketFamily::V4);
        manager.create("a", SocketFamily::V6);
        manager.create("b", SocketFamily::V4);
        assert_eq!(manager.close_all_for_plugin("a"), 2);
        assert_eq!(manager.open_count("a"), 0);
        assert_eq!(manager.open_count("b"), 1);
    }

    #[tokio::test]
    async fn test_multicast_options_apply_on_bind() {
        let manager = SocketManager::new();
        let id = manager.create("nmea", SocketFamily::V4);
        manager.set_multicast_ttl("nmea", id, 4).expect("deferred ttl");
        manager.set_multicast_loopback("nmea", id, false).expect("deferred loopback");
        manager.bind("nmea", id, 0).expect("bind");

        let table = manager.table();
        let socket = table.sockets[&id].bound().expect("bound");
        assert_eq!(socket.multicast_ttl_v4().expect("ttl"), 4);
        assert!(!socket.multicast_loop_v4().expect("loop"));
    }

    #[tokio::test]
    async fn test_multicast_options_on_bound_socket() {
        let manager = SocketManager::new();
        let id = manager.create("nmea", SocketFamily::V4);
        manager.bind("nmea", id, 0).expect("bind");
        manager.set_multicast_ttl("nmea", id, 8).expect("ttl");
        manager.set_multicast_loopback("nmea", id, true).expect("loopback");

        let table = manager.table();
        let socket = table.sockets[&id].bound().expect("bound");
        assert_eq!(socket.multicast_ttl_v4().expect("ttl"), 8);
        assert!(socket.multicast_loop_v4().expect("loop"));
    }

    #[test]
    fn test_multicast_ttl_rejected_for_v6_and_strangers() {
        let manager = SocketManager::new();
        let v6 = manager.create("nmea", SocketFamily::V6);
        assert!(manager.set_multicast_ttl("nmea", v6, 2).is_err());
        assert!(manager.set_multicast_loopback("nmea", v6, true).is_ok());
        let v4 = manager.create("nmea", SocketFamily::V4);
        assert!(manager.set_multicast_ttl("other", v4, 2).is_err());
    }

    #[test]
    fn test_recv_on_unbound_socket_is_empty() {
        let manager = SocketManager::new();
        let id = manager.create("a", SocketFamily::V4);
        assert_eq!(manager.recv("a", id).expect("recv"), None);
        assert!(manager.set_broadcast("a", id, true).is_err());
    }
}
