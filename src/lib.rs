//! The core of a Multicast DNS responder and resolver with DNS-SD support.
//!
//! The heart of this library is [`Mdns`], a single-threaded engine that owns
//! the local host's mDNS identity. It probes and announces service instances
//! on behalf of [`Publisher`]s, answers queries for them, discovers service
//! instances on behalf of [`Subscriber`]s and resolves host names. The engine
//! never touches sockets directly: it talks to the network through the
//! [`Transceiver`] trait, and whoever drives the transceiver feeds inbound
//! messages back through [`Mdns::receive_message`].
//!
//! For applications that want a ready-made network stack, [`ServiceDaemon`]
//! runs the engine on its own thread with a [`MdnsTransceiver`] and exposes
//! it through [`flume`](https://crates.io/crates/flume) channels:
//!```text
//!  Client       <channel>       mDNS daemon thread
//!    |                             | probes its host name
//!    |      --- Subscribe -->      |
//!    |                             | queries for the service
//!    |  <-- InstanceDiscovered --  |
//!    |          --- ack -->        |
//!    |           ...               |
//!    |       --- Publish -->       |
//!    |   <-- GetPublication --     |
//!    |     --- Publication -->     | probes, announces, responds
//!```
//! All commands in the daemon API are sent using the unblocking `try_send()`
//! so that the caller can use it with both sync and async code, with no
//! dependency on any particular async runtime.
//!
//! ## Example: subscribing to a service type.
//!
//! ```rust
//! use mdns_core::{MdnsConfig, ServiceDaemon, SubscriptionOptions};
//!
//! let daemon = ServiceDaemon::new(MdnsConfig::new("my-host")).expect("Failed to create daemon");
//! let subscription = daemon
//!     .subscribe_to_service("_my-service._udp.", SubscriptionOptions::default())
//!     .expect("Failed to subscribe");
//!
//! std::thread::spawn(move || {
//!     while let Ok(event) = subscription.receiver.recv() {
//!         println!("{:?}", event.event());
//!         // Dropping `event` acknowledges it and lets the next one through.
//!     }
//! });
//! ```
//!
//! This implementation is based on the following RFCs:
//! - mDNS:   [RFC 6762](https://tools.ietf.org/html/rfc6762)
//! - DNS-SD: [RFC 6763](https://tools.ietf.org/html/rfc6763)
//! - DNS:    [RFC 1035](https://tools.ietf.org/html/rfc1035)

#![forbid(unsafe_code)]

// Some naming conventions in this source code:
//
// Names passed in by users never carry the domain. A service name is two
// labels ending with a dot, e.g. `_printer._tcp.`, and a host or instance
// name is a single label, e.g. `office`.
//
// `*_full_name` is the fully qualified name in the `local.` domain:
//     service:  `_printer._tcp.local.`
//     instance: `office._printer._tcp.local.`
//     host:     `office.local.`
//     subtype:  `_color._sub._printer._tcp.local.`

// log for logging (optional).
#[cfg(feature = "logging")]
pub(crate) mod log {
    pub(crate) use ::log::{debug, error, trace, warn};
}

#[cfg(not(feature = "logging"))]
#[macro_use]
mod log {
    macro_rules! trace {
        ($($arg:expr),*) => {
            {
                let _ = ($(&$arg),*); // avoid warnings about unused variables.
            }
        };
    }

    macro_rules! debug {
        ($($arg:expr),*) => {
            {
                let _ = ($(&$arg),*);
            }
        };
    }

    macro_rules! warn {
        ($($arg:expr),*) => {
            {
                let _ = ($(&$arg),*);
            }
        };
    }

    macro_rules! error {
        ($($arg:expr),*) => {
            {
                let _ = ($(&$arg),*);
            }
        };
    }
}

mod config;
mod dns_cache;
mod dns_parser;
mod error;
mod host_resolver;
mod host_responder;
mod instance_requestor;
mod instance_responder;
mod mdns;
mod mdns_names;
mod prober;
mod publication;
mod reply_address;
mod service_daemon;
mod service_impl;
mod transceiver;

pub use config::{IfKind, MdnsConfig};
pub use dns_parser::{
    DnsHeader, DnsMessage, DnsQuestion, DnsRData, DnsResource, DnsSrv, RRType, CLASS_CACHE_FLUSH,
    CLASS_IN, FLAGS_AA, FLAGS_QR_QUERY, FLAGS_QR_RESPONSE, FLAGS_TC, MAX_MSG_ABSOLUTE,
};
pub use error::{Error, Result};
pub use mdns::{
    HostPublisher, Mdns, MdnsState, Metrics, PublicationResponder, Publisher, Subscriber,
    SubscriberId,
};
pub use mdns_names::{
    is_valid_host_name, is_valid_instance_name, is_valid_service_name, is_valid_subtype_name,
    local_host_full_name, local_instance_full_name, local_service_full_name,
    local_subtype_full_name,
};
pub use publication::{
    HostResolution, Publication, PublicationCause, ServiceInstance, SubscriberEvent,
};
pub use reply_address::{
    HostAddress, IpVersions, Media, ReplyAddress, GROUP_ADDR_V4, GROUP_ADDR_V6, MDNS_PORT,
};
pub use service_daemon::{
    DaemonStatus, HostPublisherEvent, HostPublishOptions, PublicationOptions, PublicationReplier,
    PublicationRequest, PublisherEvent, ServiceDaemon, ServicePublication, ServiceSubscription,
    SubscriptionEvent, SubscriptionOptions,
};
pub use transceiver::{MdnsTransceiver, Transceiver};

/// Re-export from `flume`.
pub use flume::Receiver;

/// Returns UNIX time in millis
pub fn current_time_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
