//! Values exchanged with publishers and subscribers.

use crate::dns_parser::{RRType, MAX_TXT_STRING_LEN};
use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

/// TTL for PTR and TXT records, RFC 6762 section 10.
pub const DEFAULT_PTR_TTL: Duration = Duration::from_secs(4500);
pub const DEFAULT_TXT_TTL: Duration = Duration::from_secs(4500);

/// TTL for records containing a host name, RFC 6762 section 10.
pub const DEFAULT_SRV_TTL: Duration = Duration::from_secs(120);

/// Publishers must not ask for TTLs shorter than this.
pub const MIN_PUBLICATION_TTL: Duration = Duration::from_secs(1);

/// Why the engine asks a publisher for its publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublicationCause {
    Announcement,
    QueryMulticastResponse,
    QueryUnicastResponse,
}

/// What a publisher wants to say about its service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub port: u16,
    pub text: Vec<String>,
    pub srv_priority: u16,
    pub srv_weight: u16,
    pub ptr_ttl: Duration,
    pub srv_ttl: Duration,
    pub txt_ttl: Duration,
}

impl Publication {
    /// A publication with default priority, weight and TTLs.
    pub fn new(port: u16, text: Vec<String>) -> Self {
        Self {
            port,
            text,
            srv_priority: 0,
            srv_weight: 0,
            ptr_ttl: DEFAULT_PTR_TTL,
            srv_ttl: DEFAULT_SRV_TTL,
            txt_ttl: DEFAULT_TXT_TTL,
        }
    }

    /// Builds the text from `key=value` pairs.
    pub fn with_properties<K: AsRef<str>, V: AsRef<str>>(port: u16, properties: &[(K, V)]) -> Self {
        let text = properties
            .iter()
            .map(|(k, v)| format!("{}={}", k.as_ref(), v.as_ref()))
            .collect();
        Self::new(port, text)
    }

    /// Returns false if any TTL is below [`MIN_PUBLICATION_TTL`].
    pub fn has_valid_ttls(&self) -> bool {
        [self.ptr_ttl, self.srv_ttl, self.txt_ttl]
            .iter()
            .all(|ttl| *ttl >= MIN_PUBLICATION_TTL)
    }

    /// Returns false if a text entry is longer than a TXT string can be.
    pub fn has_valid_text(&self) -> bool {
        self.text.iter().all(|s| s.len() <= MAX_TXT_STRING_LEN)
    }

    /// TXT rdata strings. An empty text still carries one empty string,
    /// RFC 6763 section 6.1.
    pub(crate) fn txt_strings(&self) -> Vec<Vec<u8>> {
        if self.text.is_empty() {
            return vec![Vec::new()];
        }
        self.text.iter().map(|s| s.as_bytes().to_vec()).collect()
    }
}

/// A discovered service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    /// The service name as subscribed, e.g. `_printer._tcp.`
    pub service_name: String,
    pub instance_name: String,

    /// The host full name from the SRV record. Empty until known.
    pub target: String,

    /// Addresses with the SRV port, IPv4 first.
    pub addresses: Vec<SocketAddr>,
    pub text: Vec<String>,
    pub srv_priority: u16,
    pub srv_weight: u16,
}

impl ServiceInstance {
    /// Returns the value of a `key=value` text string.
    ///
    /// A key without `=` has an empty value. Keys are case-insensitive,
    /// RFC 6763 section 6.4.
    pub fn get_property_val_str(&self, key: &str) -> Option<&str> {
        self.text.iter().find_map(|s| {
            let (k, v) = s.split_once('=').unwrap_or((s.as_str(), ""));
            if k.eq_ignore_ascii_case(key) {
                Some(v)
            } else {
                None
            }
        })
    }
}

/// A notification for a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    InstanceDiscovered(ServiceInstance),
    InstanceChanged(ServiceInstance),
    InstanceLost {
        service_name: String,
        instance_name: String,
    },

    /// Another host queried for the subscribed service.
    Query(RRType),
}

/// The outcome of a host name resolution. Both addresses are `None` when
/// nothing was found before the deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResolution {
    pub host_name: String,
    pub v4_address: Option<Ipv4Addr>,
    pub v6_address: Option<Ipv6Addr>,
}

impl HostResolution {
    pub fn is_resolved(&self) -> bool {
        self.v4_address.is_some() || self.v6_address.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_publication_ttls() {
        let mut publication = Publication::new(631, vec![]);
        assert!(publication.has_valid_ttls());
        assert_eq!(publication.txt_strings(), vec![Vec::<u8>::new()]);

        publication.srv_ttl = Duration::from_millis(500);
        assert!(!publication.has_valid_ttls());
    }

    #[test]
    fn test_publication_text_length() {
        let mut publication = Publication::new(631, vec!["a".repeat(MAX_TXT_STRING_LEN)]);
        assert!(publication.has_valid_text());

        publication.text.push("b".repeat(MAX_TXT_STRING_LEN + 1));
        assert!(!publication.has_valid_text());
    }

    #[test]
    fn test_properties() {
        let publication = Publication::with_properties(80, &[("path", "/"), ("ver", "2")]);
        assert_eq!(publication.text, vec!["path=/", "ver=2"]);

        let instance = ServiceInstance {
            service_name: "_http._tcp.".to_string(),
            instance_name: "web".to_string(),
            target: "web.local.".to_string(),
            addresses: vec![],
            text: vec!["Path=/index".to_string(), "flag".to_string()],
            srv_priority: 0,
            srv_weight: 0,
        };
        assert_eq!(instance.get_property_val_str("path"), Some("/index"));
        assert_eq!(instance.get_property_val_str("flag"), Some(""));
        assert_eq!(instance.get_property_val_str("missing"), None);
    }
}
