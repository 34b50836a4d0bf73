//! The network boundary of the engine.
//!
//! [`Transceiver`] is what [`Mdns`](crate::Mdns) sends through.
//! [`MdnsTransceiver`] is the socket implementation: one multicast UDP
//! socket per interface address, all registered in a `mio` registry that the
//! owner polls.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    config::MdnsConfig,
    dns_parser::{DnsMessage, MAX_MSG_ABSOLUTE},
    error::{e_fmt, Error, Result},
    reply_address::{
        HostAddress, IpVersions, Media, ReplyAddress, GROUP_ADDR_V4, GROUP_ADDR_V6, MDNS_PORT,
    },
};
use if_addrs::{IfAddr, Interface};
use mio::{net::UdpSocket as MioUdpSocket, Interest, Registry, Token};
use socket2::Socket;
use std::{
    cell::RefCell,
    collections::HashSet,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket},
    rc::Rc,
    time::Duration,
};

/// Big enough for a jumbo frame.
const RECV_BUF_LEN: usize = 9000;

/// TTL of the address records built from local interfaces.
const HOST_ADDRESS_TTL: Duration = Duration::from_secs(120);

/// Interface name prefixes of wireless links.
const WIRELESS_PREFIXES: [&str; 5] = ["wl", "wlan", "wlp", "ath", "ra"];

/// Sends DNS messages on behalf of the engine.
///
/// The inbound direction is not part of this trait: whoever drives the
/// transceiver hands received messages to
/// [`Mdns::receive_message`](crate::Mdns::receive_message) and reports
/// interface changes with [`Mdns::link_change`](crate::Mdns::link_change).
pub trait Transceiver {
    /// Opens the interfaces.
    fn start(&mut self) -> Result<()>;

    /// Closes all interfaces. Nothing is sent afterwards.
    fn stop(&mut self);

    /// Returns true if at least one interface is usable.
    fn has_interfaces(&self) -> bool;

    /// Sends `message` to `reply_address`. A multicast placeholder goes to
    /// every interface passing its media and IP version filters.
    fn send_message(&mut self, message: &DnsMessage, reply_address: &ReplyAddress);

    /// The addresses of the local host on all open interfaces.
    fn local_host_addresses(&self) -> Vec<HostAddress>;
}

/// Lets the engine and the reactor that reads the sockets share one
/// transceiver.
impl<T: Transceiver> Transceiver for Rc<RefCell<T>> {
    fn start(&mut self) -> Result<()> {
        self.borrow_mut().start()
    }

    fn stop(&mut self) {
        self.borrow_mut().stop()
    }

    fn has_interfaces(&self) -> bool {
        self.borrow().has_interfaces()
    }

    fn send_message(&mut self, message: &DnsMessage, reply_address: &ReplyAddress) {
        self.borrow_mut().send_message(message, reply_address)
    }

    fn local_host_addresses(&self) -> Vec<HostAddress> {
        self.borrow().local_host_addresses()
    }
}

/// An open interface address.
struct IntfSock {
    intf: Interface,
    media: Media,
    sock: MioUdpSocket,
    token: Token,
}

/// A socket transceiver over all selected interfaces.
pub struct MdnsTransceiver {
    config: MdnsConfig,
    registry: Registry,
    intf_socks: Vec<IntfSock>,

    /// The next poll token to hand out. Tokens are never reused.
    next_token: usize,
}

impl MdnsTransceiver {
    /// Creates a transceiver that registers its sockets with `registry`.
    /// Sockets are opened by [`Transceiver::start`].
    pub fn new(config: MdnsConfig, registry: Registry) -> Self {
        Self {
            config,
            registry,
            intf_socks: Vec::new(),
            next_token: 0,
        }
    }

    /// Reads all pending datagrams of the socket registered with `token`.
    ///
    /// Each datagram comes with the reply address of its sender. Datagrams
    /// that fail to decode are logged and dropped.
    pub fn read_messages(&mut self, token: Token) -> Vec<(DnsMessage, ReplyAddress)> {
        let mut messages = Vec::new();
        let Some(pos) = self.intf_socks.iter().position(|s| s.token == token) else {
            debug!("no interface for poll token {}", token.0);
            return messages;
        };

        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            let intf_sock = &self.intf_socks[pos];
            let (sz, src) = match intf_sock.sock.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        debug!("listening socket read failed: {}", e);
                    }
                    break;
                }
            };

            trace!("received {} bytes from {} at {}", sz, src, intf_sock.intf.ip());

            // Every IPv4 socket is bound to the same wildcard address and
            // sees the traffic of all interfaces.
            if let (IfAddr::V4(v4), IpAddr::V4(src_ip)) = (&intf_sock.intf.addr, src.ip()) {
                if !valid_ipv4_on_intf(&src_ip, &v4.ip, &v4.netmask) {
                    continue;
                }
            }

            match DnsMessage::from_bytes(&buf[..sz]) {
                Ok(msg) => {
                    let reply_address = ReplyAddress::new(
                        src,
                        intf_sock.intf.ip(),
                        intf_sock.media,
                        IpVersions::of(&src.ip()),
                    );
                    messages.push((msg, reply_address));
                }
                Err(e) => debug!("Invalid incoming DNS message from {}: {}", src, e),
            }
        }

        // We continue to monitor this socket.
        let intf_sock = &mut self.intf_socks[pos];
        if let Err(e) = self.registry.reregister(&mut intf_sock.sock, token, Interest::READABLE) {
            debug!("modify poller for interface {:?}: {}", intf_sock.intf.name, e);
        }

        messages
    }

    /// Opens newly appeared interfaces and closes vanished ones.
    ///
    /// Returns true if the set of interfaces changed.
    pub fn check_ip_changes(&mut self) -> bool {
        let my_intfs: Vec<Interface> = my_ip_interfaces()
            .into_iter()
            .filter(|intf| self.config.is_selected(intf))
            .collect();

        let before = self.intf_socks.len();
        let registry = &self.registry;
        self.intf_socks.retain_mut(|s| {
            if my_intfs.contains(&s.intf) {
                return true;
            }
            debug!("interface {} {} is gone", s.intf.name, s.intf.ip());
            if let Err(e) = registry.deregister(&mut s.sock) {
                debug!("check_ip_changes: poller.delete {:?}: {}", s.intf.name, e);
            }
            false
        });
        let mut changed = before != self.intf_socks.len();

        for intf in my_intfs {
            if !self.intf_socks.iter().any(|s| s.intf == intf) {
                changed |= self.add_interface(intf);
            }
        }
        changed
    }

    /// Binds and registers a socket for `intf`. Returns false on failure.
    fn add_interface(&mut self, intf: Interface) -> bool {
        let should_loop = if intf.ip().is_ipv4() {
            self.config.multicast_loop_v4
        } else {
            self.config.multicast_loop_v6
        };
        let mut sock = match new_socket_bind(&intf, should_loop) {
            Ok(s) => s,
            Err(e) => {
                debug!("bind a socket to {}: {}. Skipped.", intf.ip(), e);
                return false;
            }
        };

        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(e) = self.registry.register(&mut sock, token, Interest::READABLE) {
            debug!("poller add ip {}: {}", intf.ip(), e);
            return false;
        }

        let media = media_of(&intf.name);
        debug!("add interface {}: {} ({:?})", intf.name, intf.ip(), media);
        self.intf_socks.push(IntfSock {
            intf,
            media,
            sock,
            token,
        });
        true
    }

    fn multicast(&self, packets: &[Vec<u8>], reply_address: &ReplyAddress) {
        let mut sent = HashSet::new();
        for intf_sock in self.intf_socks.iter() {
            let ip = intf_sock.intf.ip();
            if !reply_address.media().permits(intf_sock.media) {
                continue;
            }
            if !reply_address.ip_versions().permits_addr(&ip) {
                continue;
            }

            // One send per interface and IP version.
            let tracker = (intf_sock.intf.index.unwrap_or(0), IpVersions::of(&ip));
            if !sent.insert(tracker) {
                continue;
            }

            for packet in packets {
                multicast_on_intf(packet, &intf_sock.intf, &intf_sock.sock);
            }
        }
    }

    fn unicast(&self, packets: &[Vec<u8>], reply_address: &ReplyAddress) {
        let dest = reply_address.socket_address();
        let same_family = |s: &&IntfSock| s.intf.ip().is_ipv4() == dest.is_ipv4();
        let intf_sock = self
            .intf_socks
            .iter()
            .find(|s| s.intf.ip() == reply_address.interface_address())
            .filter(same_family)
            .or_else(|| self.intf_socks.iter().find(same_family));

        let Some(intf_sock) = intf_sock else {
            debug!("no interface to reach {}", dest);
            return;
        };
        for packet in packets {
            send_packet(packet, dest, &intf_sock.intf, &intf_sock.sock);
        }
    }
}

impl Transceiver for MdnsTransceiver {
    fn start(&mut self) -> Result<()> {
        self.check_ip_changes();
        if self.intf_socks.is_empty() {
            debug!("no interface available yet");
        }
        Ok(())
    }

    fn stop(&mut self) {
        for mut intf_sock in self.intf_socks.drain(..) {
            if let Err(e) = self.registry.deregister(&mut intf_sock.sock) {
                debug!("stop: poller.delete {:?}: {}", intf_sock.intf.name, e);
            }
        }
    }

    fn has_interfaces(&self) -> bool {
        !self.intf_socks.is_empty()
    }

    fn send_message(&mut self, message: &DnsMessage, reply_address: &ReplyAddress) {
        let packets = message.to_data_on_wire();
        trace!(
            "send {} packet(s) to {}: {} questions {} answers {} authorities {} additionals",
            packets.len(),
            reply_address,
            message.questions.len(),
            message.answers.len(),
            message.authorities.len(),
            message.additionals.len()
        );
        if reply_address.is_multicast_placeholder() {
            self.multicast(&packets, reply_address);
        } else {
            self.unicast(&packets, reply_address);
        }
    }

    fn local_host_addresses(&self) -> Vec<HostAddress> {
        self.intf_socks
            .iter()
            .map(|s| HostAddress::new(s.intf.ip(), s.intf.index.unwrap_or(0), HOST_ADDRESS_TTL))
            .collect()
    }
}

/// Guesses the media of an interface from its name.
fn media_of(if_name: &str) -> Media {
    if WIRELESS_PREFIXES.iter().any(|p| if_name.starts_with(p)) {
        Media::Wireless
    } else {
        Media::Wired
    }
}

/// Returns true if `addr` is in the subnet of the interface address `intf_ip`.
fn valid_ipv4_on_intf(addr: &Ipv4Addr, intf_ip: &Ipv4Addr, netmask: &Ipv4Addr) -> bool {
    let netmask = u32::from(*netmask);
    let intf_net = u32::from(*intf_ip) & netmask;
    let addr_net = u32::from(*addr) & netmask;
    addr_net == intf_net
}

/// Returns valid network interfaces in the host system.
/// Loopback interfaces are excluded.
fn my_ip_interfaces() -> Vec<Interface> {
    if_addrs::get_if_addrs()
        .unwrap_or_default()
        .into_iter()
        .filter(|i| !i.is_loopback())
        .collect()
}

/// Creates a socket that receives and sends multicast on `intf`.
fn new_socket_bind(intf: &Interface, should_loop: bool) -> Result<MioUdpSocket> {
    // The same socket receives and sends, so it binds to the wildcard address.
    match intf.ip() {
        IpAddr::V4(ip) => {
            let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT);
            let sock = new_socket(addr.into(), true)?;

            sock.join_multicast_v4(&GROUP_ADDR_V4, &ip)
                .map_err(|e| e_fmt!("join multicast group on addr {}: {}", ip, e))?;

            sock.set_multicast_if_v4(&ip)
                .map_err(|e| e_fmt!("set multicast_if on addr {}: {}", ip, e))?;

            if !should_loop {
                sock.set_multicast_loop_v4(false)
                    .map_err(|e| e_fmt!("failed to set multicast loop v4 for {ip}: {e}"))?;
            }

            // Test if we can send packets successfully.
            let multicast_addr = SocketAddrV4::new(GROUP_ADDR_V4, MDNS_PORT).into();
            for packet in DnsMessage::query().to_data_on_wire() {
                sock.send_to(&packet, &multicast_addr)
                    .map_err(|e| e_fmt!("send multicast packet on addr {}: {}", ip, e))?;
            }
            Ok(MioUdpSocket::from_std(UdpSocket::from(sock)))
        }
        IpAddr::V6(ip) => {
            let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, MDNS_PORT, 0, 0);
            let sock = new_socket(addr.into(), true)?;
            let index = intf.index.unwrap_or(0);

            sock.join_multicast_v6(&GROUP_ADDR_V6, index)
                .map_err(|e| e_fmt!("join multicast group on addr {}: {}", ip, e))?;

            sock.set_multicast_if_v6(index)
                .map_err(|e| e_fmt!("set multicast_if on addr {}: {}", ip, e))?;

            if !should_loop {
                sock.set_multicast_loop_v6(false)
                    .map_err(|e| e_fmt!("failed to set multicast loop v6 for {ip}: {e}"))?;
            }

            // No test send here: hosts with many IPv6 interfaces may fail
            // with "No buffer space available".
            Ok(MioUdpSocket::from_std(UdpSocket::from(sock)))
        }
    }
}

/// Creates a new UDP socket to bind to `addr` with REUSEPORT option.
/// `non_block` indicates whether to set O_NONBLOCK for the socket.
fn new_socket(addr: SocketAddr, non_block: bool) -> Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };

    let fd = Socket::new(domain, socket2::Type::DGRAM, None)
        .map_err(|e| e_fmt!("create socket failed: {}", e))?;

    fd.set_reuse_address(true)
        .map_err(|e| e_fmt!("set ReuseAddr failed: {}", e))?;
    #[cfg(unix)] // this is currently restricted to Unix's in socket2
    fd.set_reuse_port(true)
        .map_err(|e| e_fmt!("set ReusePort failed: {}", e))?;

    if non_block {
        fd.set_nonblocking(true)
            .map_err(|e| e_fmt!("set O_NONBLOCK: {}", e))?;
    }

    fd.bind(&addr.into())
        .map_err(|e| e_fmt!("socket bind to {} failed: {}", &addr, e))?;

    trace!("new socket bind to {}", &addr);
    Ok(fd)
}

/// Sends a packet to the mDNS group of `intf`.
fn multicast_on_intf(packet: &[u8], intf: &Interface, socket: &MioUdpSocket) {
    if packet.len() > MAX_MSG_ABSOLUTE {
        debug!("Drop over-sized packet ({})", packet.len());
        return;
    }

    let addr: SocketAddr = match intf.addr {
        IfAddr::V4(_) => SocketAddrV4::new(GROUP_ADDR_V4, MDNS_PORT).into(),
        IfAddr::V6(_) => {
            let mut sock = SocketAddrV6::new(GROUP_ADDR_V6, MDNS_PORT, 0, 0);
            sock.set_scope_id(intf.index.unwrap_or(0)); // Choose iface for multicast
            sock.into()
        }
    };

    send_packet(packet, addr, intf, socket);
}

/// Sends out `packet` to `addr` on `sock`.
fn send_packet(packet: &[u8], addr: SocketAddr, intf: &Interface, sock: &MioUdpSocket) {
    match sock.send_to(packet, addr) {
        Ok(sz) => trace!("sent out {} bytes on interface {}", sz, intf.name),
        Err(e) => debug!("Failed to send to {} via {}: {}", addr, intf.name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_media_of() {
        assert_eq!(media_of("wlan0"), Media::Wireless);
        assert_eq!(media_of("wlp3s0"), Media::Wireless);
        assert_eq!(media_of("ath0"), Media::Wireless);
        assert_eq!(media_of("eth0"), Media::Wired);
        assert_eq!(media_of("en0"), Media::Wired);
    }

    #[test]
    fn test_valid_ipv4_on_intf() {
        let ip = Ipv4Addr::new(192, 168, 1, 2);
        let netmask = Ipv4Addr::new(255, 255, 255, 0);
        assert!(valid_ipv4_on_intf(&Ipv4Addr::new(192, 168, 1, 77), &ip, &netmask));
        assert!(!valid_ipv4_on_intf(&Ipv4Addr::new(192, 168, 2, 77), &ip, &netmask));
    }
}
