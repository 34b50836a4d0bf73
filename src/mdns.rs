//! The resolver engine.
//!
//! [`Mdns`] owns the local host's mDNS identity and all publications and
//! subscriptions. It is single-threaded: every entry point takes `&self`,
//! borrows the shared state, queues the calls it owes to publishers and
//! subscribers, releases the borrow and only then makes those calls. A
//! publisher can therefore answer [`Publisher::get_publication`] right away
//! from inside the call, or keep the [`PublicationResponder`] and answer
//! later.
//!
//! Time is UNIX millis. The owner drives timers by calling
//! [`Mdns::handle_timeout`] at or after [`Mdns::next_timeout`].

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    current_time_millis,
    dns_parser::{DnsMessage, DnsQuestion, DnsResource, RRType},
    error::Result,
    host_resolver::HostResolver,
    host_responder::HostPublication,
    instance_requestor::{InstanceRequestor, SubscriberEntry},
    instance_responder::{InstancePublication, ResponderRequest},
    mdns_names::{alt_host_name, host_name_change, local_host_full_name},
    prober::{Probe, ProbeStep, PROBE_INTERVAL_MILLIS, TIEBREAK_LOST_DELAY_MILLIS},
    publication::{
        HostResolution, Publication, PublicationCause, ServiceInstance, SubscriberEvent,
    },
    reply_address::{IpVersions, Media, ReplyAddress, MDNS_PORT},
    transceiver::Transceiver,
};
use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    fmt,
    net::{IpAddr, SocketAddr},
    rc::{Rc, Weak},
    sync::Arc,
};

/// Identifies a subscription made with [`Mdns::subscribe_to_service`].
pub type SubscriberId = u64;

/// The metrics is a HashMap of (name_key, i64_value).
/// The main purpose is to help monitoring the mDNS packet traffic.
pub type Metrics = HashMap<String, i64>;

/// TTL of the host's own address records.
pub(crate) const HOST_RECORD_TTL: u32 = 120;

/// Legacy unicast responses carry TTLs of at most 10 seconds,
/// RFC 6762 section 6.7.
const LEGACY_MAX_TTL: u32 = 10;

/// Startup progress of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdnsState {
    Created,

    /// Started, waiting for an interface.
    Starting,

    /// Probing the host name's address records.
    Probing,

    Ready,

    /// Stopped for good.
    Stopped,
}

/// Receives the results of a subscription.
pub trait Subscriber {
    fn instance_discovered(&mut self, instance: &ServiceInstance);

    fn instance_changed(&mut self, instance: &ServiceInstance);

    fn instance_lost(&mut self, service_name: &str, instance_name: &str);

    /// Another host asked for the subscribed service.
    fn query(&mut self, _qtype: RRType) {}
}

/// Supplies the records of a published service instance.
pub trait Publisher {
    /// Reports the outcome of probing. `false` means the instance name is
    /// taken and the publication is gone.
    fn report_success(&mut self, success: bool);

    /// Asks for the current publication. The answer goes through
    /// `responder`, now or later. `subtype` is non-empty when a query asked
    /// for one subtype of the service.
    fn get_publication(
        &mut self,
        cause: PublicationCause,
        subtype: &str,
        source_addresses: &[SocketAddr],
        responder: PublicationResponder,
    );
}

/// Receives the outcome of a host publication.
pub trait HostPublisher {
    fn report_success(&mut self, success: bool);
}

pub(crate) type SharedPublisher = Rc<RefCell<Box<dyn Publisher>>>;
pub(crate) type SharedSubscriber = Rc<RefCell<Box<dyn Subscriber>>>;
pub(crate) type SharedHostPublisher = Rc<RefCell<Box<dyn HostPublisher>>>;

/// The answer channel for one [`Publisher::get_publication`] call.
///
/// Answering after the publication was withdrawn is a no-op.
pub struct PublicationResponder {
    core: Weak<RefCell<MdnsCore>>,
    publication_id: u64,
    request: ResponderRequest,
}

impl PublicationResponder {
    /// Sends the records built from `publication`. `None` means there is
    /// nothing to publish for this request.
    pub fn respond(self, publication: Option<Publication>) {
        let Some(core) = self.core.upgrade() else {
            trace!("engine is gone, dropping publication reply");
            return;
        };
        core.borrow_mut()
            .handle_publication_reply(self.publication_id, self.request, publication);
        dispatch(&core);
    }

    /// A responder not tied to any engine. Answers go nowhere.
    #[cfg(test)]
    pub(crate) fn detached(publication_id: u64) -> Self {
        Self {
            core: Weak::new(),
            publication_id,
            request: ResponderRequest::Announce,
        }
    }
}

impl fmt::Debug for PublicationResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicationResponder")
            .field("publication_id", &self.publication_id)
            .field("request", &self.request)
            .finish()
    }
}

/// Different counters included in the metrics.
/// All counters are for outgoing packets.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub(crate) enum Counter {
    Probe,
    Announce,
    Goodbye,
    Respond,
    Browse,
    ResolveInstance,
    ResolveHostname,
    CacheRefresh,
    KnownAnswerSuppression,
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Probe => write!(f, "probe"),
            Self::Announce => write!(f, "announce"),
            Self::Goodbye => write!(f, "goodbye"),
            Self::Respond => write!(f, "respond"),
            Self::Browse => write!(f, "browse"),
            Self::ResolveInstance => write!(f, "resolve-instance"),
            Self::ResolveHostname => write!(f, "resolve-hostname"),
            Self::CacheRefresh => write!(f, "cache-refresh"),
            Self::KnownAnswerSuppression => write!(f, "known-answer-suppression"),
        }
    }
}

/// Scheduled work. The `u64` is the id of the owning publication,
/// requestor or resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    AddressProbe,
    InstanceProbe(u64),
    Announce(u64),
    HostProbe(u64),
    Browse(u64),
    ResolveInstances(u64),
    CacheMaintenance(u64),
    ResolveHostName(u64),
    HostNameDeadline(u64),
}

impl Action {
    fn owner(&self) -> Option<u64> {
        match self {
            Self::AddressProbe => None,
            Self::InstanceProbe(id)
            | Self::Announce(id)
            | Self::HostProbe(id)
            | Self::Browse(id)
            | Self::ResolveInstances(id)
            | Self::CacheMaintenance(id)
            | Self::ResolveHostName(id)
            | Self::HostNameDeadline(id) => Some(*id),
        }
    }
}

/// Specify a UNIX timestamp in millis to run `action` for the next time.
struct ReRun {
    /// UNIX timestamp in millis.
    next_time: u64,
    action: Action,
}

/// A call into user code, made once the engine state is released.
pub(crate) enum Callout {
    Ready(Box<dyn FnOnce()>),
    ReportSuccess(SharedPublisher, bool),
    HostReportSuccess(SharedHostPublisher, bool),
    GetPublication {
        publication_id: u64,
        publisher: SharedPublisher,
        cause: PublicationCause,
        subtype: String,
        source_addresses: Vec<SocketAddr>,
        responder: PublicationResponder,
    },
    Subscriber {
        id: SubscriberId,
        subscriber: SharedSubscriber,
        event: SubscriberEvent,
    },
    HostResolved(Box<dyn FnOnce(HostResolution)>, HostResolution),
}

/// How to answer one inbound query.
#[derive(Debug, Clone)]
pub(crate) struct ReplyContext {
    pub(crate) from: ReplyAddress,

    /// The querier asked for a unicast response with the QU bit.
    unicast: bool,

    /// Id and questions of a legacy query, i.e. one not sent from port 5353.
    legacy: Option<(u16, Vec<DnsQuestion>)>,
}

impl ReplyContext {
    fn new(query: &DnsMessage, from: &ReplyAddress) -> Self {
        let legacy = if from.socket_address().port() != MDNS_PORT {
            Some((query.header.id, query.questions.clone()))
        } else {
            None
        };
        Self {
            from: *from,
            unicast: query.questions.iter().any(|q| q.unicast_response),
            legacy,
        }
    }

    pub(crate) fn is_unicast(&self) -> bool {
        self.unicast || self.legacy.is_some()
    }

    pub(crate) fn cause(&self) -> PublicationCause {
        if self.is_unicast() {
            PublicationCause::QueryUnicastResponse
        } else {
            PublicationCause::QueryMulticastResponse
        }
    }

    /// The sender for unicast replies, otherwise the multicast placeholder
    /// of the answering record set.
    pub(crate) fn destination(&self, media: Media, ip_versions: IpVersions) -> ReplyAddress {
        if self.is_unicast() {
            self.from
        } else {
            ReplyAddress::multicast(media, ip_versions)
        }
    }

    /// Applies the legacy unicast rules: echo the id and questions, cap
    /// TTLs and clear the cache-flush bits.
    fn finish(&self, mut response: DnsMessage) -> DnsMessage {
        let Some((id, questions)) = &self.legacy else {
            return response;
        };
        response.header.id = *id;
        response.questions = questions.clone();
        for section in [
            &mut response.answers,
            &mut response.authorities,
            &mut response.additionals,
        ] {
            for record in section.iter_mut() {
                let legacy_record = record
                    .as_ref()
                    .clone()
                    .with_ttl(record.ttl.min(LEGACY_MAX_TTL))
                    .with_cache_flush(false);
                *record = Arc::new(legacy_record);
            }
        }
        response
    }
}

/// The engine state behind [`Mdns`].
pub(crate) struct MdnsCore {
    self_ref: Weak<RefCell<MdnsCore>>,
    transceiver: Box<dyn Transceiver>,
    pub(crate) state: MdnsState,

    pub(crate) host_name: String,
    pub(crate) alt_host_name: String,
    alt_services: Vec<String>,
    perform_address_probe: bool,
    ready_callback: Option<Box<dyn FnOnce()>>,
    address_probe: Option<Probe>,

    pub(crate) publications: HashMap<u64, InstancePublication>,
    pub(crate) hosts: HashMap<u64, HostPublication>,
    pub(crate) requestors: HashMap<u64, InstanceRequestor>,
    pub(crate) subscribers: HashMap<SubscriberId, SubscriberEntry>,
    pub(crate) resolvers: HashMap<u64, HostResolver>,

    retransmissions: Vec<ReRun>,
    pub(crate) callouts: VecDeque<Callout>,
    dispatching: bool,

    /// All ids come from one counter, so an id names exactly one owner.
    next_id: u64,

    /// The latest time seen by `handle_timeout`.
    clock: u64,
    counters: Metrics,
}

impl MdnsCore {
    fn new(transceiver: Box<dyn Transceiver>, self_ref: Weak<RefCell<MdnsCore>>) -> Self {
        Self {
            self_ref,
            transceiver,
            state: MdnsState::Created,
            host_name: String::new(),
            alt_host_name: String::new(),
            alt_services: Vec::new(),
            perform_address_probe: false,
            ready_callback: None,
            address_probe: None,
            publications: HashMap::new(),
            hosts: HashMap::new(),
            requestors: HashMap::new(),
            subscribers: HashMap::new(),
            resolvers: HashMap::new(),
            retransmissions: Vec::new(),
            callouts: VecDeque::new(),
            dispatching: false,
            next_id: 1,
            clock: 0,
            counters: HashMap::new(),
        }
    }

    /// The current time, never behind what `handle_timeout` has seen.
    pub(crate) fn now(&self) -> u64 {
        current_time_millis().max(self.clock)
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state == MdnsState::Ready
    }

    pub(crate) fn new_responder(
        &self,
        publication_id: u64,
        request: ResponderRequest,
    ) -> PublicationResponder {
        PublicationResponder {
            core: self.self_ref.clone(),
            publication_id,
            request,
        }
    }

    pub(crate) fn schedule(&mut self, next_time: u64, action: Action) {
        trace!("schedule {:?} at {}", action, next_time);
        self.retransmissions.push(ReRun { next_time, action });
    }

    pub(crate) fn is_scheduled(&self, action: Action) -> bool {
        self.retransmissions.iter().any(|r| r.action == action)
    }

    /// Cancels all scheduled work of `owner`.
    pub(crate) fn cancel_actions(&mut self, owner: u64) {
        self.retransmissions
            .retain(|r| r.action.owner() != Some(owner));
    }

    pub(crate) fn cancel_action(&mut self, action: Action) {
        self.retransmissions.retain(|r| r.action != action);
    }

    /// Increases the value of `counter` by `count`.
    pub(crate) fn increase_counter(&mut self, counter: Counter, count: i64) {
        let key = counter.to_string();
        match self.counters.get_mut(&key) {
            Some(v) => *v += count,
            None => {
                self.counters.insert(key, count);
            }
        }
    }

    pub(crate) fn send(&mut self, message: &DnsMessage, to: &ReplyAddress, counter: Counter) {
        trace!("send {} to {}", counter, to);
        self.transceiver.send_message(message, to);
        self.increase_counter(counter, 1);
    }

    /// Sends a response to a query, following the unicast and legacy rules
    /// of `reply`.
    pub(crate) fn send_response(
        &mut self,
        response: DnsMessage,
        reply: &ReplyContext,
        media: Media,
        ip_versions: IpVersions,
    ) {
        if response.answers.is_empty() {
            return;
        }
        let destination = reply.destination(media, ip_versions);
        let response = reply.finish(response);
        self.send(&response, &destination, Counter::Respond);
    }

    /// The host full name that SRV records of `service_name` point to.
    pub(crate) fn host_full_name_for(&self, service_name: &str) -> String {
        if self
            .alt_services
            .iter()
            .any(|s| s.eq_ignore_ascii_case(service_name))
        {
            local_host_full_name(&self.alt_host_name)
        } else {
            local_host_full_name(&self.host_name)
        }
    }

    pub(crate) fn is_own_host_full_name(&self, name: &str) -> bool {
        !self.host_name.is_empty()
            && (name.eq_ignore_ascii_case(&local_host_full_name(&self.host_name))
                || name.eq_ignore_ascii_case(&local_host_full_name(&self.alt_host_name)))
    }

    /// The local host's addresses of the permitted IP versions.
    pub(crate) fn local_addresses(&self, ip_versions: IpVersions) -> Vec<IpAddr> {
        let mut addresses: Vec<IpAddr> = Vec::new();
        for host_address in self.transceiver.local_host_addresses() {
            if ip_versions.permits_addr(&host_address.address)
                && !addresses.contains(&host_address.address)
            {
                addresses.push(host_address.address);
            }
        }
        addresses
    }

    fn start(
        &mut self,
        host_name: &str,
        perform_address_probe: bool,
        ready: Box<dyn FnOnce()>,
        alt_services: Vec<String>,
    ) -> Result<()> {
        self.host_name = host_name.to_string();
        self.alt_host_name = alt_host_name(host_name);
        self.alt_services = alt_services;
        self.perform_address_probe = perform_address_probe;
        self.ready_callback = Some(ready);
        self.state = MdnsState::Starting;

        self.transceiver.start()?;
        let now = self.now();
        self.try_start(now);
        Ok(())
    }

    /// Moves on from `Starting` once there is an interface.
    fn try_start(&mut self, now: u64) {
        if !self.transceiver.has_interfaces() {
            debug!("no interface yet, waiting for a link change");
            return;
        }

        if self.perform_address_probe {
            self.start_address_probe(now + Probe::initial_delay());
        } else {
            self.become_ready(now);
        }
    }

    fn start_address_probe(&mut self, start_time: u64) {
        let host_full_name = local_host_full_name(&self.host_name);
        let records = self
            .local_addresses(IpVersions::Both)
            .into_iter()
            .map(|ip| Arc::new(DnsResource::address(&host_full_name, HOST_RECORD_TTL, ip)))
            .collect();
        debug!("probing host name {}", &host_full_name);
        self.address_probe = Some(Probe::new(&host_full_name, records));
        self.state = MdnsState::Probing;
        self.cancel_action(Action::AddressProbe);
        self.schedule(start_time, Action::AddressProbe);
    }

    fn run_address_probe(&mut self, now: u64) {
        let step = match self.address_probe.as_mut() {
            Some(probe) => probe.next_step(),
            None => return,
        };
        match step {
            ProbeStep::Send(query) => {
                self.send(
                    &query,
                    &ReplyAddress::multicast(Media::Both, IpVersions::Both),
                    Counter::Probe,
                );
                self.schedule(now + PROBE_INTERVAL_MILLIS, Action::AddressProbe);
            }
            ProbeStep::Done => {
                self.address_probe = None;
                self.become_ready(now);
            }
        }
    }

    fn become_ready(&mut self, now: u64) {
        debug!("ready as {}", &self.host_name);
        self.state = MdnsState::Ready;
        if let Some(ready) = self.ready_callback.take() {
            self.callouts.push_back(Callout::Ready(ready));
        }

        // Start what was registered while not ready, in arrival order.
        let mut ids: Vec<u64> = self.publications.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.start_publication(id, now);
        }

        let mut ids: Vec<u64> = self.hosts.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.start_host_publication(id, now);
        }

        let mut ids: Vec<u64> = self.requestors.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.start_requestor(id, now);
        }

        let mut ids: Vec<u64> = self.resolvers.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.start_resolver(id, now);
        }
    }

    fn link_change(&mut self, now: u64) {
        match self.state {
            MdnsState::Starting => self.try_start(now),
            MdnsState::Ready => {
                let mut ids: Vec<u64> = self.publications.keys().copied().collect();
                ids.sort_unstable();
                for id in ids {
                    self.reannounce_publication(id, now);
                }

                let ids: Vec<u64> = self.requestors.keys().copied().collect();
                for id in ids {
                    self.reset_browse(id, now);
                }
            }
            _ => {}
        }
    }

    fn run_action(&mut self, action: Action, now: u64) {
        trace!("run {:?}", action);
        match action {
            Action::AddressProbe => self.run_address_probe(now),
            Action::InstanceProbe(id) => self.run_instance_probe(id, now),
            Action::Announce(id) => self.run_announce(id, now),
            Action::HostProbe(id) => self.run_host_probe(id, now),
            Action::Browse(id) => self.run_browse(id, now),
            Action::ResolveInstances(id) => self.run_resolve_instances(id, now),
            Action::CacheMaintenance(id) => self.run_cache_maintenance(id, now),
            Action::ResolveHostName(id) => self.run_resolve_host_name(id, now),
            Action::HostNameDeadline(id) => self.finish_resolver(id, None, None),
        }
    }

    fn handle_timeout(&mut self, now: u64) {
        self.clock = self.clock.max(now);

        // Run due actions one at a time, earliest first, so that an action
        // can cancel others that are also due.
        while let Some(pos) = self
            .retransmissions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.next_time <= now)
            .min_by_key(|(_, r)| r.next_time)
            .map(|(i, _)| i)
        {
            let rerun = self.retransmissions.remove(pos);
            self.run_action(rerun.action, now);
        }
    }

    fn next_timeout(&self) -> Option<u64> {
        self.retransmissions.iter().map(|r| r.next_time).min()
    }

    fn handle_message(&mut self, message: &DnsMessage, from: &ReplyAddress) {
        let now = self.now();
        if message.is_query() {
            self.handle_query(message, from, now);
        } else {
            self.handle_response(message, from, now);
        }
    }

    fn handle_query(&mut self, query: &DnsMessage, from: &ReplyAddress, now: u64) {
        trace!("query from {}: {} questions", from, query.questions.len());

        if !query.authorities.is_empty() {
            self.check_tiebreaks(query, now);
        }

        let reply = ReplyContext::new(query, from);
        for question in query.questions.iter() {
            if self.is_ready() {
                self.answer_own_host_question(question, &reply);
            }
            self.answer_host_question(question, &reply);
            self.answer_instance_question(question, query, &reply);
            self.notify_query(question, from);
        }
    }

    /// Simultaneous probes, RFC 6762 section 8.2.
    fn check_tiebreaks(&mut self, query: &DnsMessage, now: u64) {
        let lost = self
            .address_probe
            .as_ref()
            .map(|probe| probe.loses_tiebreak(query))
            .unwrap_or(false);
        if lost {
            debug!("lost the tiebreak for host {}", &self.host_name);
            if let Some(probe) = self.address_probe.as_mut() {
                probe.restart();
            }
            self.cancel_action(Action::AddressProbe);
            self.schedule(now + TIEBREAK_LOST_DELAY_MILLIS, Action::AddressProbe);
        }

        self.check_instance_tiebreaks(query, now);
        self.check_host_tiebreaks(query, now);
    }

    fn answer_own_host_question(&mut self, question: &DnsQuestion, reply: &ReplyContext) {
        if !self.is_own_host_full_name(&question.name) {
            return;
        }
        let addresses = self.local_addresses(IpVersions::Both);
        let response = address_response(&question.name, question.qtype, &addresses);
        self.send_response(response, reply, Media::Both, IpVersions::Both);
    }

    fn handle_response(&mut self, response: &DnsMessage, from: &ReplyAddress, now: u64) {
        trace!(
            "response from {}: {} answers {} additionals",
            from,
            response.answers.len(),
            response.additionals.len()
        );

        let conflict = self
            .address_probe
            .as_ref()
            .map(|probe| probe.conflicts_with(response))
            .unwrap_or(false);
        if conflict {
            let new_name = host_name_change(&self.host_name);
            debug!("host name {} is taken, trying {}", &self.host_name, &new_name);
            self.host_name = new_name;
            self.alt_host_name = alt_host_name(&self.host_name);
            self.start_address_probe(now + Probe::initial_delay());
        }

        self.check_instance_conflicts(response);
        self.check_host_conflicts(response);
        self.feed_requestors(response, from, now);
        self.feed_resolvers(response);
    }

    fn stop(&mut self) {
        let ids: Vec<u64> = self.publications.keys().copied().collect();
        for id in ids {
            self.withdraw_publication(id);
        }
        let ids: Vec<u64> = self.hosts.keys().copied().collect();
        for id in ids {
            self.withdraw_host(id);
        }

        self.requestors.clear();
        self.subscribers.clear();
        self.resolvers.clear();
        self.retransmissions.clear();
        self.address_probe = None;
        self.ready_callback = None;
        self.transceiver.stop();
        self.state = MdnsState::Stopped;
    }

    fn handle_publication_reply(
        &mut self,
        publication_id: u64,
        request: ResponderRequest,
        publication: Option<Publication>,
    ) {
        if self.state == MdnsState::Stopped {
            return;
        }
        let now = self.now();
        self.handle_instance_reply(publication_id, request, publication, now);
    }
}

/// A response answering `qtype` for `name` with `addresses`. Addresses of
/// the other family go into the additionals.
pub(crate) fn address_response(name: &str, qtype: RRType, addresses: &[IpAddr]) -> DnsMessage {
    let mut response = DnsMessage::response();
    for ip in addresses {
        let record = Arc::new(DnsResource::address(name, HOST_RECORD_TTL, *ip));
        if qtype.matches(record.rr_type()) {
            response.add_answer(record);
        } else if matches!(qtype, RRType::A | RRType::AAAA) {
            response.add_additional(record);
        }
    }
    response
}

/// Runs queued callouts. Calls made while already dispatching are left
/// to the outer loop.
fn dispatch(core: &Rc<RefCell<MdnsCore>>) {
    {
        let mut core = core.borrow_mut();
        if core.dispatching {
            return;
        }
        core.dispatching = true;
    }

    loop {
        // The borrow must end before the callout runs.
        let next = core.borrow_mut().callouts.pop_front();
        let Some(callout) = next else {
            break;
        };
        run_callout(core, callout);
    }

    core.borrow_mut().dispatching = false;
}

fn run_callout(core: &Rc<RefCell<MdnsCore>>, callout: Callout) {
    match callout {
        Callout::Ready(ready) => ready(),
        Callout::ReportSuccess(publisher, success) => {
            publisher.borrow_mut().report_success(success);
        }
        Callout::HostReportSuccess(publisher, success) => {
            publisher.borrow_mut().report_success(success);
        }
        Callout::GetPublication {
            publication_id,
            publisher,
            cause,
            subtype,
            source_addresses,
            responder,
        } => {
            let live = core.borrow().publications.contains_key(&publication_id);
            if live {
                publisher.borrow_mut().get_publication(
                    cause,
                    &subtype,
                    &source_addresses,
                    responder,
                );
            }
        }
        Callout::Subscriber {
            id,
            subscriber,
            event,
        } => {
            let live = core.borrow().subscribers.contains_key(&id);
            if !live {
                trace!("subscriber {} is gone, dropping {:?}", id, event);
                return;
            }
            let mut subscriber = subscriber.borrow_mut();
            match &event {
                SubscriberEvent::InstanceDiscovered(instance) => {
                    subscriber.instance_discovered(instance)
                }
                SubscriberEvent::InstanceChanged(instance) => subscriber.instance_changed(instance),
                SubscriberEvent::InstanceLost {
                    service_name,
                    instance_name,
                } => subscriber.instance_lost(service_name, instance_name),
                SubscriberEvent::Query(qtype) => subscriber.query(*qtype),
            }
        }
        Callout::HostResolved(callback, resolution) => callback(resolution),
    }
}

/// The mDNS engine.
///
/// Cloning gives another handle to the same engine, e.g. for a publisher
/// or subscriber that wants to call back into it.
#[derive(Clone)]
pub struct Mdns {
    core: Rc<RefCell<MdnsCore>>,
}

impl Mdns {
    pub fn new(transceiver: Box<dyn Transceiver>) -> Self {
        let core =
            Rc::new_cyclic(|self_ref| RefCell::new(MdnsCore::new(transceiver, self_ref.clone())));
        Self { core }
    }

    /// Starts the transceiver and claims `host_name`.
    ///
    /// `ready` is called once, when the engine has an interface and, with
    /// `perform_address_probe`, has probed its host name. Services listed
    /// in `alt_services` are published under an alternate host name.
    pub fn start(
        &self,
        host_name: &str,
        perform_address_probe: bool,
        ready: Box<dyn FnOnce()>,
        alt_services: Vec<String>,
    ) -> Result<()> {
        let result = self.core.borrow_mut().start(
            host_name,
            perform_address_probe,
            ready,
            alt_services,
        );
        dispatch(&self.core);
        result
    }

    pub fn state(&self) -> MdnsState {
        self.core.borrow().state
    }

    /// The host name in use. Differs from the one passed to `start` after
    /// a conflict.
    pub fn host_name(&self) -> String {
        self.core.borrow().host_name.clone()
    }

    /// Subscribes to instances of `service_name`, e.g. `_printer._tcp.`.
    pub fn subscribe_to_service(
        &self,
        service_name: &str,
        media: Media,
        ip_versions: IpVersions,
        include_unknown_resources: bool,
        send_initial_query: bool,
        subscriber: Box<dyn Subscriber>,
    ) -> SubscriberId {
        let id = self.core.borrow_mut().subscribe(
            service_name,
            media,
            ip_versions,
            include_unknown_resources,
            send_initial_query,
            subscriber,
        );
        dispatch(&self.core);
        id
    }

    /// Ends a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.core.borrow_mut().unsubscribe(id);
        dispatch(&self.core);
    }

    /// Publishes a service instance. Returns false if the instance is
    /// already published or a name is invalid.
    pub fn publish_service_instance(
        &self,
        service_name: &str,
        instance_name: &str,
        media: Media,
        ip_versions: IpVersions,
        perform_probe: bool,
        publisher: Box<dyn Publisher>,
    ) -> bool {
        let published = self.core.borrow_mut().publish_instance(
            service_name,
            instance_name,
            media,
            ip_versions,
            perform_probe,
            publisher,
        );
        dispatch(&self.core);
        published
    }

    /// Withdraws a publication. A goodbye goes out during the call if the
    /// instance had been announced. Returns false if it was not published.
    pub fn unpublish_service_instance(&self, service_name: &str, instance_name: &str) -> bool {
        let found = self
            .core
            .borrow_mut()
            .unpublish_instance(service_name, instance_name);
        dispatch(&self.core);
        found
    }

    /// Replaces the subtypes of a publication and announces it again.
    pub fn set_subtypes(
        &self,
        service_name: &str,
        instance_name: &str,
        subtypes: Vec<String>,
    ) -> bool {
        let done = self
            .core
            .borrow_mut()
            .set_subtypes(service_name, instance_name, subtypes);
        dispatch(&self.core);
        done
    }

    /// Announces a publication again, e.g. after its text changed.
    pub fn reannounce(&self, service_name: &str, instance_name: &str) -> bool {
        let done = self
            .core
            .borrow_mut()
            .reannounce(service_name, instance_name);
        dispatch(&self.core);
        done
    }

    /// Answers address queries for `host_name` with `addresses` on behalf
    /// of another host.
    pub fn publish_host(
        &self,
        host_name: &str,
        addresses: Vec<IpAddr>,
        media: Media,
        ip_versions: IpVersions,
        perform_probe: bool,
        publisher: Box<dyn HostPublisher>,
    ) -> bool {
        let published = self.core.borrow_mut().publish_host(
            host_name,
            addresses,
            media,
            ip_versions,
            perform_probe,
            publisher,
        );
        dispatch(&self.core);
        published
    }

    pub fn unpublish_host(&self, host_name: &str) -> bool {
        let found = self.core.borrow_mut().unpublish_host(host_name);
        dispatch(&self.core);
        found
    }

    /// Resolves `host_name` to addresses. `callback` runs exactly once, at
    /// the latest at `deadline` (UNIX millis).
    pub fn resolve_host_name(
        &self,
        host_name: &str,
        deadline: u64,
        callback: Box<dyn FnOnce(HostResolution)>,
    ) {
        self.core
            .borrow_mut()
            .resolve_host_name(host_name, deadline, callback);
        dispatch(&self.core);
    }

    /// Handles a message received by the transceiver.
    pub fn receive_message(&self, message: DnsMessage, reply_address: ReplyAddress) {
        {
            let mut core = self.core.borrow_mut();
            if matches!(core.state, MdnsState::Created | MdnsState::Stopped) {
                return;
            }
            core.handle_message(&message, &reply_address);
        }
        dispatch(&self.core);
    }

    /// Tells the engine that interfaces came or went.
    pub fn link_change(&self) {
        {
            let mut core = self.core.borrow_mut();
            let now = core.now();
            core.link_change(now);
        }
        dispatch(&self.core);
    }

    /// Runs all scheduled work due at `now`.
    pub fn handle_timeout(&self, now: u64) {
        self.core.borrow_mut().handle_timeout(now);
        dispatch(&self.core);
    }

    /// The time of the next scheduled work, if any.
    pub fn next_timeout(&self) -> Option<u64> {
        self.core.borrow().next_timeout()
    }

    /// Sends goodbyes for announced publications and stops the transceiver.
    pub fn stop(&self) {
        self.core.borrow_mut().stop();
        dispatch(&self.core);
    }

    pub fn metrics(&self) -> Metrics {
        self.core.borrow().counters.clone()
    }
}
