//! Where a message came from, or where it should go.

use crate::error::{Error, Result};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

/// The well-known mDNS port.
pub const MDNS_PORT: u16 = 5353;

/// The IPv4 multicast group for mDNS.
pub const GROUP_ADDR_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// The IPv6 multicast group for mDNS.
pub const GROUP_ADDR_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// The kind of link an interface sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Media {
    Wired,
    Wireless,
    Both,
}

impl Media {
    /// Converts a bitmask (`1` wired, `2` wireless) into `Media`.
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            1 => Ok(Media::Wired),
            2 => Ok(Media::Wireless),
            3 => Ok(Media::Both),
            _ => Err(Error::UnsupportedMedia(bits)),
        }
    }

    /// Returns true if a filter of `self` lets traffic on `other` through.
    pub fn permits(self, other: Media) -> bool {
        self == Media::Both || self == other
    }
}

/// The IP versions a publication or subscription applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersions {
    V4,
    V6,
    Both,
}

impl IpVersions {
    /// Converts a bitmask (`1` IPv4, `2` IPv6) into `IpVersions`.
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            1 => Ok(IpVersions::V4),
            2 => Ok(IpVersions::V6),
            3 => Ok(IpVersions::Both),
            _ => Err(Error::UnsupportedMedia(bits)),
        }
    }

    /// Returns true if a filter of `self` lets traffic of `other` through.
    pub fn permits(self, other: IpVersions) -> bool {
        self == IpVersions::Both || self == other
    }

    /// Returns true if a filter of `self` lets `addr` through.
    pub fn permits_addr(self, addr: &IpAddr) -> bool {
        self.permits(IpVersions::of(addr))
    }

    /// The IP version of a single address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersions::V4,
            IpAddr::V6(_) => IpVersions::V6,
        }
    }
}

/// The source of an inbound message, or the destination of an outbound one.
///
/// A reply address whose socket address is the IPv4 mDNS group is a
/// placeholder: the transceiver expands it to the multicast group of every
/// interface that passes the `media` and `ip_versions` filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyAddress {
    socket_address: SocketAddr,
    interface_address: IpAddr,
    media: Media,
    ip_versions: IpVersions,
}

impl ReplyAddress {
    pub fn new(
        socket_address: SocketAddr,
        interface_address: IpAddr,
        media: Media,
        ip_versions: IpVersions,
    ) -> Self {
        Self {
            socket_address,
            interface_address,
            media,
            ip_versions,
        }
    }

    /// The multicast placeholder for the given filters.
    pub fn multicast(media: Media, ip_versions: IpVersions) -> Self {
        Self {
            socket_address: SocketAddr::new(IpAddr::V4(GROUP_ADDR_V4), MDNS_PORT),
            interface_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            media,
            ip_versions,
        }
    }

    pub fn socket_address(&self) -> SocketAddr {
        self.socket_address
    }

    /// The local interface address. Unspecified for multicast placeholders.
    pub fn interface_address(&self) -> IpAddr {
        self.interface_address
    }

    pub fn media(&self) -> Media {
        self.media
    }

    pub fn ip_versions(&self) -> IpVersions {
        self.ip_versions
    }

    pub fn is_multicast_placeholder(&self) -> bool {
        self.socket_address == SocketAddr::new(IpAddr::V4(GROUP_ADDR_V4), MDNS_PORT)
    }

    /// Returns true if `media` is `Both` or equals this address's media.
    pub fn matches_media(&self, media: Media) -> bool {
        media.permits(self.media)
    }

    /// Returns true if `ip_versions` is `Both` or equals this address's IP versions.
    pub fn matches_ip_versions(&self, ip_versions: IpVersions) -> bool {
        ip_versions.permits(self.ip_versions)
    }

    /// Returns true if this address passes both filters.
    pub fn matches(&self, media: Media, ip_versions: IpVersions) -> bool {
        self.matches_media(media) && self.matches_ip_versions(ip_versions)
    }
}

impl fmt::Display for ReplyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_multicast_placeholder() {
            write!(f, "multicast({:?}, {:?})", self.media, self.ip_versions)
        } else {
            write!(
                f,
                "{} via {} ({:?})",
                self.socket_address, self.interface_address, self.media
            )
        }
    }
}

/// One of the local host's own addresses, used for self-referential address records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub address: IpAddr,
    pub interface_id: u32,
    pub ttl: Duration,
}

impl HostAddress {
    pub fn new(address: IpAddr, interface_id: u32, ttl: Duration) -> Self {
        Self {
            address,
            interface_id,
            ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_multicast_placeholder() {
        let placeholder = ReplyAddress::multicast(Media::Wired, IpVersions::Both);
        assert!(placeholder.is_multicast_placeholder());
        assert!(placeholder.interface_address().is_unspecified());
        assert_eq!(placeholder.socket_address().port(), MDNS_PORT);

        let sender = ReplyAddress::new(
            "192.168.1.7:5353".parse().unwrap(),
            "192.168.1.2".parse().unwrap(),
            Media::Wired,
            IpVersions::V4,
        );
        assert!(!sender.is_multicast_placeholder());

        // Placeholders with different filters are different destinations.
        assert_ne!(
            placeholder,
            ReplyAddress::multicast(Media::Wireless, IpVersions::Both)
        );
    }

    #[test]
    fn test_media_filters() {
        let wireless = ReplyAddress::new(
            "10.0.0.9:5353".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            Media::Wireless,
            IpVersions::V4,
        );
        assert!(wireless.matches_media(Media::Both));
        assert!(wireless.matches_media(Media::Wireless));
        assert!(!wireless.matches_media(Media::Wired));

        assert!(wireless.matches_ip_versions(IpVersions::V4));
        assert!(!wireless.matches_ip_versions(IpVersions::V6));
        assert!(wireless.matches(Media::Both, IpVersions::Both));
        assert!(!wireless.matches(Media::Wired, IpVersions::Both));
    }

    #[test]
    fn test_from_bits() {
        assert_eq!(Media::from_bits(1), Ok(Media::Wired));
        assert_eq!(Media::from_bits(3), Ok(Media::Both));
        assert_eq!(Media::from_bits(0), Err(Error::UnsupportedMedia(0)));
        assert_eq!(IpVersions::from_bits(2), Ok(IpVersions::V6));
        assert_eq!(IpVersions::from_bits(4), Err(Error::UnsupportedMedia(4)));
    }
}
