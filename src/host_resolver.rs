//! One-shot resolution of host names to addresses.

#[cfg(feature = "logging")]
use crate::log::debug;
use crate::{
    dns_parser::{DnsMessage, RRType},
    mdns::{Action, Callout, Counter, MdnsCore},
    mdns_names::{check_host_name, local_host_full_name},
    publication::HostResolution,
    reply_address::{IpVersions, Media, ReplyAddress},
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The first interval between queries. It doubles after each query.
const MIN_RESOLVE_INTERVAL_MILLIS: u64 = 1000;

pub(crate) struct HostResolver {
    host_name: String,
    host_full_name: String,
    interval: u64,
    deadline: u64,
    callback: Box<dyn FnOnce(HostResolution)>,
}

/// The first IPv4 and the first IPv6 address of `addresses`.
fn first_of_each(addresses: &[IpAddr]) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
    let v4 = addresses.iter().find_map(|ip| match ip {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    });
    let v6 = addresses.iter().find_map(|ip| match ip {
        IpAddr::V6(v6) => Some(*v6),
        IpAddr::V4(_) => None,
    });
    (v4, v6)
}

impl MdnsCore {
    pub(crate) fn resolve_host_name(
        &mut self,
        host_name: &str,
        deadline: u64,
        callback: Box<dyn FnOnce(HostResolution)>,
    ) {
        let host_full_name = local_host_full_name(host_name);
        let mut resolution = HostResolution {
            host_name: host_name.to_string(),
            v4_address: None,
            v6_address: None,
        };

        if let Err(e) = check_host_name(host_name) {
            debug!("resolve_host_name: {}", e);
            self.callouts
                .push_back(Callout::HostResolved(callback, resolution));
            return;
        }

        // Names we answer for ourselves need no query.
        let local = if self.is_own_host_full_name(&host_full_name) {
            Some(self.local_addresses(IpVersions::Both))
        } else {
            self.proxy_host_addresses(&host_full_name)
        };
        if let Some(addresses) = local {
            (resolution.v4_address, resolution.v6_address) = first_of_each(&addresses);
            self.callouts
                .push_back(Callout::HostResolved(callback, resolution));
            return;
        }

        let now = self.now();
        if deadline <= now {
            self.callouts
                .push_back(Callout::HostResolved(callback, resolution));
            return;
        }

        let id = self.next_id();
        self.resolvers.insert(
            id,
            HostResolver {
                host_name: host_name.to_string(),
                host_full_name,
                interval: MIN_RESOLVE_INTERVAL_MILLIS,
                deadline,
                callback,
            },
        );
        self.schedule(deadline, Action::HostNameDeadline(id));
        if self.is_ready() {
            self.start_resolver(id, now);
        }
    }

    pub(crate) fn start_resolver(&mut self, id: u64, now: u64) {
        if self.is_scheduled(Action::ResolveHostName(id)) {
            return;
        }
        self.run_resolve_host_name(id, now);
    }

    /// Sends the address query and schedules the next one.
    pub(crate) fn run_resolve_host_name(&mut self, id: u64, now: u64) {
        let Some(resolver) = self.resolvers.get_mut(&id) else {
            return;
        };

        let mut query = DnsMessage::query();
        query.add_question(&resolver.host_full_name, RRType::A);
        query.add_question(&resolver.host_full_name, RRType::AAAA);

        let next_time = now + resolver.interval;
        resolver.interval *= 2;
        let before_deadline = next_time < resolver.deadline;

        self.send(
            &query,
            &ReplyAddress::multicast(Media::Both, IpVersions::Both),
            Counter::ResolveHostname,
        );
        if before_deadline {
            self.schedule(next_time, Action::ResolveHostName(id));
        }
    }

    /// Finishes resolvers whose host shows up in `response`.
    pub(crate) fn feed_resolvers(&mut self, response: &DnsMessage) {
        let mut found = Vec::new();
        for (id, resolver) in self.resolvers.iter() {
            let addresses: Vec<IpAddr> = response
                .all_records()
                .filter(|r| !r.is_goodbye() && r.name_matches(&resolver.host_full_name))
                .filter_map(|r| r.ip_address())
                .collect();
            if !addresses.is_empty() {
                found.push((*id, first_of_each(&addresses)));
            }
        }
        for (id, (v4, v6)) in found {
            self.finish_resolver(id, v4, v6);
        }
    }

    /// Ends a resolution and queues its callback. A deadline passes `None`
    /// for both addresses.
    pub(crate) fn finish_resolver(&mut self, id: u64, v4: Option<Ipv4Addr>, v6: Option<Ipv6Addr>) {
        self.cancel_actions(id);
        let Some(resolver) = self.resolvers.remove(&id) else {
            return;
        };
        debug!(
            "resolved {}: {:?} {:?}",
            &resolver.host_full_name, v4, v6
        );
        let resolution = HostResolution {
            host_name: resolver.host_name,
            v4_address: v4,
            v6_address: v6,
        };
        self.callouts
            .push_back(Callout::HostResolved(resolver.callback, resolution));
    }
}
