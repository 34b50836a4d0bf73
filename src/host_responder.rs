//! Address records published on behalf of other hosts.

#[cfg(feature = "logging")]
use crate::log::debug;
use crate::{
    dns_parser::{DnsMessage, DnsQuestion, DnsResource, RRType},
    mdns::{
        address_response, Action, Callout, Counter, MdnsCore, ReplyContext, SharedHostPublisher,
        HOST_RECORD_TTL,
    },
    mdns_names::{check_host_name, local_host_full_name},
    prober::{Probe, ProbeStep, PROBE_INTERVAL_MILLIS, TIEBREAK_LOST_DELAY_MILLIS},
    reply_address::{IpVersions, Media, ReplyAddress},
    HostPublisher,
};
use std::{cell::RefCell, net::IpAddr, rc::Rc, sync::Arc};

#[derive(Debug)]
pub(crate) enum HostState {
    /// Registered before the engine became ready.
    Pending,
    Probing(Probe),
    Responding,
}

pub(crate) struct HostPublication {
    pub(crate) host_full_name: String,

    /// Only the permitted IP versions.
    pub(crate) addresses: Vec<IpAddr>,
    media: Media,
    ip_versions: IpVersions,
    perform_probe: bool,
    publisher: SharedHostPublisher,
    state: HostState,
}

impl HostPublication {
    fn address_records(&self) -> Vec<Arc<DnsResource>> {
        self.addresses
            .iter()
            .map(|ip| Arc::new(DnsResource::address(&self.host_full_name, HOST_RECORD_TTL, *ip)))
            .collect()
    }
}

impl MdnsCore {
    fn find_host(&self, host_full_name: &str) -> Option<u64> {
        self.hosts
            .iter()
            .find(|(_, h)| h.host_full_name.eq_ignore_ascii_case(host_full_name))
            .map(|(id, _)| *id)
    }

    /// The addresses of a proxy host, if we publish it.
    pub(crate) fn proxy_host_addresses(&self, host_full_name: &str) -> Option<Vec<IpAddr>> {
        let id = self.find_host(host_full_name)?;
        self.hosts.get(&id).map(|h| h.addresses.clone())
    }

    pub(crate) fn publish_host(
        &mut self,
        host_name: &str,
        addresses: Vec<IpAddr>,
        media: Media,
        ip_versions: IpVersions,
        perform_probe: bool,
        publisher: Box<dyn HostPublisher>,
    ) -> bool {
        if let Err(e) = check_host_name(host_name) {
            debug!("publish_host: {}", e);
            return false;
        }
        let host_full_name = local_host_full_name(host_name);
        if self.is_own_host_full_name(&host_full_name) || self.find_host(&host_full_name).is_some()
        {
            debug!("publish_host: {} is already published", &host_full_name);
            return false;
        }

        let id = self.next_id();
        let addresses = addresses
            .into_iter()
            .filter(|ip| ip_versions.permits_addr(ip))
            .collect();
        self.hosts.insert(
            id,
            HostPublication {
                host_full_name,
                addresses,
                media,
                ip_versions,
                perform_probe,
                publisher: Rc::new(RefCell::new(publisher)),
                state: HostState::Pending,
            },
        );

        if self.is_ready() {
            let now = self.now();
            self.start_host_publication(id, now);
        }
        true
    }

    pub(crate) fn start_host_publication(&mut self, id: u64, now: u64) {
        let Some(host) = self.hosts.get_mut(&id) else {
            return;
        };
        if !matches!(host.state, HostState::Pending) {
            return;
        }
        if host.perform_probe {
            let probe = Probe::new(&host.host_full_name, host.address_records());
            host.state = HostState::Probing(probe);
            self.schedule(now + Probe::initial_delay(), Action::HostProbe(id));
        } else {
            self.host_succeeded(id);
        }
    }

    fn host_succeeded(&mut self, id: u64) {
        let Some(host) = self.hosts.get_mut(&id) else {
            return;
        };
        debug!("host {} is ours", &host.host_full_name);
        host.state = HostState::Responding;
        let publisher = host.publisher.clone();
        self.callouts
            .push_back(Callout::HostReportSuccess(publisher, true));
    }

    pub(crate) fn run_host_probe(&mut self, id: u64, now: u64) {
        let Some(host) = self.hosts.get_mut(&id) else {
            return;
        };
        let HostState::Probing(probe) = &mut host.state else {
            return;
        };
        match probe.next_step() {
            ProbeStep::Send(query) => {
                let to = ReplyAddress::multicast(host.media, host.ip_versions);
                self.send(&query, &to, Counter::Probe);
                self.schedule(now + PROBE_INTERVAL_MILLIS, Action::HostProbe(id));
            }
            ProbeStep::Done => self.host_succeeded(id),
        }
    }

    pub(crate) fn unpublish_host(&mut self, host_name: &str) -> bool {
        match self.find_host(&local_host_full_name(host_name)) {
            Some(id) => {
                self.withdraw_host(id);
                true
            }
            None => false,
        }
    }

    /// Removes a host publication, sending a goodbye if it was answering.
    pub(crate) fn withdraw_host(&mut self, id: u64) {
        self.cancel_actions(id);
        let Some(host) = self.hosts.remove(&id) else {
            return;
        };
        debug!("unpublish host {}", &host.host_full_name);
        if matches!(host.state, HostState::Responding) {
            let mut goodbye = DnsMessage::response();
            for record in host.address_records() {
                goodbye.add_answer(Arc::new(record.as_ref().clone().with_ttl(0)));
            }
            let to = ReplyAddress::multicast(host.media, host.ip_versions);
            self.send(&goodbye, &to, Counter::Goodbye);
        }
    }

    pub(crate) fn check_host_conflicts(&mut self, response: &DnsMessage) {
        let conflicts: Vec<u64> = self
            .hosts
            .iter()
            .filter(|(_, h)| match &h.state {
                HostState::Probing(probe) => probe.conflicts_with(response),
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect();

        for id in conflicts {
            self.cancel_actions(id);
            if let Some(host) = self.hosts.remove(&id) {
                debug!("probe conflict for host {}", &host.host_full_name);
                self.callouts
                    .push_back(Callout::HostReportSuccess(host.publisher, false));
            }
        }
    }

    pub(crate) fn check_host_tiebreaks(&mut self, query: &DnsMessage, now: u64) {
        let mut lost = Vec::new();
        for (id, host) in self.hosts.iter_mut() {
            if let HostState::Probing(probe) = &mut host.state {
                if probe.loses_tiebreak(query) {
                    probe.restart();
                    lost.push(*id);
                }
            }
        }
        for id in lost {
            self.cancel_actions(id);
            self.schedule(now + TIEBREAK_LOST_DELAY_MILLIS, Action::HostProbe(id));
        }
    }

    /// Answers an address question for a proxy host. Senders outside the
    /// host's media and IP version filters get nothing.
    pub(crate) fn answer_host_question(&mut self, question: &DnsQuestion, reply: &ReplyContext) {
        if !matches!(question.qtype, RRType::A | RRType::AAAA | RRType::ANY) {
            return;
        }
        let Some(id) = self.find_host(&question.name) else {
            return;
        };
        let Some(host) = self.hosts.get(&id) else {
            return;
        };
        if !matches!(host.state, HostState::Responding)
            || !reply.from.matches(host.media, host.ip_versions)
        {
            return;
        }

        let response = address_response(&host.host_full_name, question.qtype, &host.addresses);
        let (media, ip_versions) = (host.media, host.ip_versions);
        self.send_response(response, reply, media, ip_versions);
    }
}
