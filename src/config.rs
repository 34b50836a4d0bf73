//! Configuration of a [`ServiceDaemon`](crate::ServiceDaemon).
//!
//! ```rust
//! use mdns_core::{IfKind, MdnsConfig};
//! use std::time::Duration;
//!
//! let config = MdnsConfig::new("office")
//!     .with_address_probe(false)
//!     .with_alt_services(vec!["_sleep-proxy._udp.".to_string()])
//!     .disable_interface(IfKind::IPv6)
//!     .with_ip_check_interval(Duration::from_secs(10));
//! assert_eq!(config.host_name, "office");
//! ```

use if_addrs::Interface;
use std::{net::IpAddr, time::Duration};

/// How often the daemon looks for IP address changes by default.
pub(crate) const DEFAULT_IP_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Represents a network interface or a group of interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfKind {
    /// All interfaces.
    All,

    /// All IPv4 interfaces.
    IPv4,

    /// All IPv6 interfaces.
    IPv6,

    /// By the interface name, for example "en0"
    Name(String),

    /// By an IPv4 or IPv6 address.
    Addr(IpAddr),
}

impl IfKind {
    /// Checks if the interface `name` with address `ip` matches with this
    /// interface kind.
    pub(crate) fn matches(&self, name: &str, ip: &IpAddr) -> bool {
        match self {
            Self::All => true,
            Self::IPv4 => ip.is_ipv4(),
            Self::IPv6 => ip.is_ipv6(),
            Self::Name(ifname) => ifname == name,
            Self::Addr(addr) => addr == ip,
        }
    }
}

impl From<&str> for IfKind {
    fn from(val: &str) -> Self {
        Self::Name(val.to_string())
    }
}

impl From<&String> for IfKind {
    fn from(val: &String) -> Self {
        Self::Name(val.to_string())
    }
}

impl From<IpAddr> for IfKind {
    fn from(val: IpAddr) -> Self {
        Self::Addr(val)
    }
}

/// One enable or disable step. Later selections override earlier ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IfSelection {
    pub(crate) if_kind: IfKind,
    pub(crate) selected: bool,
}

/// Settings for the mDNS engine and its socket transceiver.
#[derive(Debug, Clone)]
pub struct MdnsConfig {
    /// The local host name without the domain, e.g. `office`.
    pub host_name: String,

    /// Probe the host name's address records before becoming ready.
    ///
    /// Default: true
    pub perform_address_probe: bool,

    /// Services published under the alternate host name instead of the
    /// primary one.
    pub alt_services: Vec<String>,

    /// Whether multicast IPv4 packets loop back to local sockets.
    ///
    /// Default: true
    pub multicast_loop_v4: bool,

    /// Whether multicast IPv6 packets loop back to local sockets.
    ///
    /// Default: true
    pub multicast_loop_v6: bool,

    /// How often to look for IP address changes.
    ///
    /// Default: 30 seconds
    pub ip_check_interval: Duration,

    pub(crate) if_selections: Vec<IfSelection>,
}

impl MdnsConfig {
    /// A configuration with default values for `host_name`.
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            perform_address_probe: true,
            alt_services: Vec::new(),
            multicast_loop_v4: true,
            multicast_loop_v6: true,
            ip_check_interval: DEFAULT_IP_CHECK_INTERVAL,
            if_selections: Vec::new(),
        }
    }

    pub fn with_address_probe(mut self, perform_address_probe: bool) -> Self {
        self.perform_address_probe = perform_address_probe;
        self
    }

    pub fn with_alt_services(mut self, alt_services: Vec<String>) -> Self {
        self.alt_services = alt_services;
        self
    }

    pub fn with_multicast_loop_v4(mut self, on: bool) -> Self {
        self.multicast_loop_v4 = on;
        self
    }

    pub fn with_multicast_loop_v6(mut self, on: bool) -> Self {
        self.multicast_loop_v6 = on;
        self
    }

    pub fn with_ip_check_interval(mut self, interval: Duration) -> Self {
        self.ip_check_interval = interval;
        self
    }

    /// Enables interfaces matching `if_kind`. All interfaces are enabled
    /// unless disabled.
    pub fn enable_interface(mut self, if_kind: impl Into<IfKind>) -> Self {
        self.if_selections.push(IfSelection {
            if_kind: if_kind.into(),
            selected: true,
        });
        self
    }

    /// Disables interfaces matching `if_kind`.
    pub fn disable_interface(mut self, if_kind: impl Into<IfKind>) -> Self {
        self.if_selections.push(IfSelection {
            if_kind: if_kind.into(),
            selected: false,
        });
        self
    }

    /// Returns true if `intf` survives all selections.
    pub(crate) fn is_selected(&self, intf: &Interface) -> bool {
        self.is_selected_addr(&intf.name, &intf.ip())
    }

    fn is_selected_addr(&self, name: &str, ip: &IpAddr) -> bool {
        let mut selected = true;
        for selection in self.if_selections.iter() {
            if selection.if_kind.matches(name, ip) {
                selected = selection.selected;
            }
        }
        selected
    }
}
