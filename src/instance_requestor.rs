//! Discovery of service instances for subscribers.
//!
//! Subscriptions with the same service, media, IP versions and
//! `include_unknown_resources` share one requestor: one query schedule and
//! one record cache. The requestor lives as long as it has subscribers.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    dns_cache::DnsCache,
    dns_parser::{DnsMessage, DnsQuestion, DnsResource, RRType},
    mdns::{Action, Callout, Counter, MdnsCore, SharedSubscriber, SubscriberId},
    mdns_names::{instance_from_full_name, local_service_full_name},
    publication::{ServiceInstance, SubscriberEvent},
    reply_address::{IpVersions, Media, ReplyAddress},
    Subscriber,
};
use std::{
    cell::RefCell,
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    rc::Rc,
    sync::Arc,
};

/// The first interval between PTR queries. It doubles after each query.
const MIN_QUERY_INTERVAL_MILLIS: u64 = 1000;

/// The interval between PTR queries stops growing here, RFC 6762 section 5.2.
const MAX_QUERY_INTERVAL_MILLIS: u64 = 3_600_000;

/// Follow-up queries for an incompletely resolved instance.
const RESOLVE_TRIES: u32 = 3;
const RESOLVE_INTERVAL_MILLIS: u64 = 500;

/// What makes two subscriptions share a requestor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RequestorKey {
    service_full_name: String,
    media: Media,
    ip_versions: IpVersions,
    include_unknown: bool,
}

impl RequestorKey {
    fn new(
        service_name: &str,
        media: Media,
        ip_versions: IpVersions,
        include_unknown: bool,
    ) -> Self {
        Self {
            service_full_name: local_service_full_name(service_name).to_ascii_lowercase(),
            media,
            ip_versions,
            include_unknown,
        }
    }
}

pub(crate) struct SubscriberEntry {
    requestor_id: u64,
    subscriber: SharedSubscriber,
}

pub(crate) struct InstanceRequestor {
    key: RequestorKey,
    service_name: String,
    service_full_name: String,
    send_initial_query: bool,
    started: bool,

    /// In subscription order.
    subscribers: Vec<SubscriberId>,
    cache: DnsCache,

    /// Instances reported to subscribers, by lower-cased instance name.
    reported: HashMap<String, ServiceInstance>,
    query_interval: u64,

    /// Follow-up queries sent per instance or host full name.
    resolve_tries: HashMap<String, u32>,
}

impl InstanceRequestor {
    fn new(service_name: &str, key: RequestorKey, send_initial_query: bool) -> Self {
        Self {
            key,
            service_name: service_name.to_string(),
            service_full_name: local_service_full_name(service_name),
            send_initial_query,
            started: false,
            subscribers: Vec::new(),
            cache: DnsCache::new(),
            reported: HashMap::new(),
            query_interval: MIN_QUERY_INTERVAL_MILLIS,
            resolve_tries: HashMap::new(),
        }
    }

    fn accepts(&self, from: &ReplyAddress) -> bool {
        from.matches(self.key.media, self.key.ip_versions)
    }

    /// Caches the records of `response` that belong to this service.
    /// Returns the times at which cached records need attention.
    fn add_records(&mut self, response: &DnsMessage, now: u64) -> Vec<u64> {
        let mut timers = Vec::new();
        let records: Vec<&Arc<DnsResource>> = response
            .answers
            .iter()
            .chain(response.additionals.iter())
            .collect();

        // PTR first, then SRV and TXT, then addresses of known targets.
        for record in records.iter().filter(|r| r.rr_type() == RRType::PTR) {
            if record.name_matches(&self.service_full_name) {
                self.cache.add_or_update(record, now, &mut timers);
            }
        }
        for record in records
            .iter()
            .filter(|r| matches!(r.rr_type(), RRType::SRV | RRType::TXT))
        {
            if instance_from_full_name(&record.name, &self.service_full_name).is_some() {
                self.cache.add_or_update(record, now, &mut timers);
            }
        }
        let targets = self.targets(now);
        for record in records
            .iter()
            .filter(|r| matches!(r.rr_type(), RRType::A | RRType::AAAA))
        {
            if targets.iter().any(|t| record.name_matches(t)) {
                self.cache.add_or_update(record, now, &mut timers);
            }
        }
        timers
    }

    /// SRV targets of all live instances.
    fn targets(&self, now: u64) -> Vec<String> {
        self.cache
            .ptr_aliases(&self.service_full_name, now)
            .iter()
            .filter_map(|alias| self.cache.srv(alias, now))
            .map(|srv| srv.target.clone())
            .collect()
    }

    fn addresses_of(&self, host: &str, now: u64) -> Vec<IpAddr> {
        self.cache
            .addresses(host, now)
            .into_iter()
            .filter(|ip| self.key.ip_versions.permits_addr(ip))
            .collect()
    }

    /// The instances as they are known now, by lower-cased instance name.
    fn instances(&self, now: u64) -> HashMap<String, ServiceInstance> {
        let mut instances = HashMap::new();
        for alias in self.cache.ptr_aliases(&self.service_full_name, now) {
            let Some(instance_name) = instance_from_full_name(&alias, &self.service_full_name)
            else {
                continue;
            };

            let srv = self.cache.srv(&alias, now);
            let ips = srv
                .map(|s| self.addresses_of(&s.target, now))
                .unwrap_or_default();
            if !self.key.include_unknown && (srv.is_none() || ips.is_empty()) {
                continue;
            }

            let port = srv.map(|s| s.port).unwrap_or(0);
            let mut addresses: Vec<SocketAddr> =
                ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect();
            addresses.sort_by_key(|a| a.is_ipv6());

            let text = self
                .cache
                .txt(&alias, now)
                .map(|strings| {
                    strings
                        .iter()
                        .filter(|s| !s.is_empty())
                        .map(|s| String::from_utf8_lossy(s).into_owned())
                        .collect()
                })
                .unwrap_or_default();

            let instance = ServiceInstance {
                service_name: self.service_name.clone(),
                instance_name: instance_name.clone(),
                target: srv.map(|s| s.target.clone()).unwrap_or_default(),
                addresses,
                text,
                srv_priority: srv.map(|s| s.priority).unwrap_or(0),
                srv_weight: srv.map(|s| s.weight).unwrap_or(0),
            };
            instances.insert(instance_name.to_ascii_lowercase(), instance);
        }
        instances
    }

    /// Compares the known instances with the reported ones. Returns the
    /// events to report and whether a new instance showed up.
    fn diff(&mut self, now: u64) -> (Vec<SubscriberEvent>, bool) {
        let current = self.instances(now);
        let mut events = Vec::new();
        let mut discovered = false;

        let mut lost: Vec<&String> = self
            .reported
            .keys()
            .filter(|key| !current.contains_key(*key))
            .collect();
        lost.sort();
        for key in lost {
            if let Some(instance) = self.reported.get(key) {
                events.push(SubscriberEvent::InstanceLost {
                    service_name: instance.service_name.clone(),
                    instance_name: instance.instance_name.clone(),
                });
            }
        }

        let mut keys: Vec<&String> = current.keys().collect();
        keys.sort();
        for key in keys {
            let instance = &current[key];
            match self.reported.get(key) {
                None => {
                    discovered = true;
                    events.push(SubscriberEvent::InstanceDiscovered(instance.clone()));
                }
                Some(old) if old != instance => {
                    events.push(SubscriberEvent::InstanceChanged(instance.clone()));
                }
                Some(_) => {}
            }
        }

        self.reported = current;
        (events, discovered)
    }

    /// Questions for instances that lack SRV/TXT or addresses, with tries left.
    fn unresolved_questions(&mut self, now: u64) -> Vec<DnsQuestion> {
        // (owner name, questions about it)
        let mut wanted: Vec<(String, Vec<DnsQuestion>)> = Vec::new();
        for alias in self.cache.ptr_aliases(&self.service_full_name, now) {
            let (owner, questions) = match self.cache.srv(&alias, now) {
                None => (
                    alias.to_ascii_lowercase(),
                    vec![
                        DnsQuestion::new(&alias, RRType::SRV),
                        DnsQuestion::new(&alias, RRType::TXT),
                    ],
                ),
                Some(srv) if self.addresses_of(&srv.target, now).is_empty() => {
                    let mut questions = Vec::new();
                    if self.key.ip_versions.permits(IpVersions::V4) {
                        questions.push(DnsQuestion::new(&srv.target, RRType::A));
                    }
                    if self.key.ip_versions.permits(IpVersions::V6) {
                        questions.push(DnsQuestion::new(&srv.target, RRType::AAAA));
                    }
                    (srv.target.to_ascii_lowercase(), questions)
                }
                Some(_) => continue,
            };
            if !wanted.iter().any(|(name, _)| *name == owner) {
                wanted.push((owner, questions));
            }
        }

        // Forget names that got resolved.
        self.resolve_tries
            .retain(|name, _| wanted.iter().any(|(owner, _)| owner == name));

        let mut out = Vec::new();
        for (owner, questions) in wanted {
            let tries = self.resolve_tries.entry(owner).or_insert(0);
            if *tries < RESOLVE_TRIES {
                *tries += 1;
                out.extend(questions);
            }
        }
        out
    }
}

impl MdnsCore {
    pub(crate) fn subscribe(
        &mut self,
        service_name: &str,
        media: Media,
        ip_versions: IpVersions,
        include_unknown: bool,
        send_initial_query: bool,
        subscriber: Box<dyn Subscriber>,
    ) -> SubscriberId {
        let id = self.next_id();
        let subscriber: SharedSubscriber = Rc::new(RefCell::new(subscriber));
        let key = RequestorKey::new(service_name, media, ip_versions, include_unknown);

        let existing = self
            .requestors
            .iter()
            .find(|(_, r)| r.key == key)
            .map(|(rid, _)| *rid);

        let requestor_id = match existing {
            Some(rid) => {
                if let Some(requestor) = self.requestors.get_mut(&rid) {
                    requestor.subscribers.push(id);

                    // Catch the newcomer up on what is already known.
                    let mut known: Vec<&ServiceInstance> = requestor.reported.values().collect();
                    known.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
                    for instance in known {
                        self.callouts.push_back(Callout::Subscriber {
                            id,
                            subscriber: subscriber.clone(),
                            event: SubscriberEvent::InstanceDiscovered(instance.clone()),
                        });
                    }
                }
                rid
            }
            None => {
                let rid = self.next_id();
                let mut requestor = InstanceRequestor::new(service_name, key, send_initial_query);
                requestor.subscribers.push(id);
                debug!("new requestor {} for {}", rid, &requestor.service_full_name);
                self.requestors.insert(rid, requestor);
                if self.is_ready() {
                    let now = self.now();
                    self.start_requestor(rid, now);
                }
                rid
            }
        };

        self.subscribers.insert(
            id,
            SubscriberEntry {
                requestor_id,
                subscriber,
            },
        );
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriberId) {
        let Some(entry) = self.subscribers.remove(&id) else {
            return;
        };
        let rid = entry.requestor_id;
        let Some(requestor) = self.requestors.get_mut(&rid) else {
            return;
        };
        requestor.subscribers.retain(|s| *s != id);
        if requestor.subscribers.is_empty() {
            debug!("last subscriber left {}", &requestor.service_full_name);
            self.requestors.remove(&rid);
            self.cancel_actions(rid);
        }
    }

    pub(crate) fn start_requestor(&mut self, rid: u64, now: u64) {
        let Some(requestor) = self.requestors.get_mut(&rid) else {
            return;
        };
        if requestor.started {
            return;
        }
        requestor.started = true;
        if requestor.send_initial_query {
            self.run_browse(rid, now);
        } else {
            self.schedule(now + MIN_QUERY_INTERVAL_MILLIS, Action::Browse(rid));
        }
    }

    /// Sends the PTR query with known answers and schedules the next one.
    pub(crate) fn run_browse(&mut self, rid: u64, now: u64) {
        let Some(requestor) = self.requestors.get_mut(&rid) else {
            return;
        };

        let mut query = DnsMessage::query();
        query.add_question(&requestor.service_full_name, RRType::PTR);
        for known in requestor
            .cache
            .known_answers(&requestor.service_full_name, RRType::PTR, now)
        {
            query.add_answer(known);
        }
        let to = ReplyAddress::multicast(requestor.key.media, requestor.key.ip_versions);

        let next_time = now + requestor.query_interval;
        requestor.query_interval = (requestor.query_interval * 2).min(MAX_QUERY_INTERVAL_MILLIS);

        self.send(&query, &to, Counter::Browse);
        self.schedule(next_time, Action::Browse(rid));
    }

    /// Starts the query schedule over from the shortest interval.
    pub(crate) fn reset_browse(&mut self, rid: u64, now: u64) {
        let Some(requestor) = self.requestors.get_mut(&rid) else {
            return;
        };
        if !requestor.started {
            return;
        }
        requestor.query_interval = MIN_QUERY_INTERVAL_MILLIS;
        self.cancel_action(Action::Browse(rid));
        self.run_browse(rid, now);
    }

    pub(crate) fn run_resolve_instances(&mut self, rid: u64, now: u64) {
        let Some(requestor) = self.requestors.get_mut(&rid) else {
            return;
        };
        let questions = requestor.unresolved_questions(now);
        if questions.is_empty() {
            return;
        }
        let to = ReplyAddress::multicast(requestor.key.media, requestor.key.ip_versions);
        let mut query = DnsMessage::query();
        query.questions = questions;

        self.send(&query, &to, Counter::ResolveInstance);
        self.schedule(now + RESOLVE_INTERVAL_MILLIS, Action::ResolveInstances(rid));
    }

    /// Expires records, sends refresh queries and reports lost instances.
    pub(crate) fn run_cache_maintenance(&mut self, rid: u64, now: u64) {
        let Some(requestor) = self.requestors.get_mut(&rid) else {
            return;
        };
        requestor.cache.evict_expired(now);
        let due = requestor.cache.refresh_due(now);
        let to = ReplyAddress::multicast(requestor.key.media, requestor.key.ip_versions);
        let (events, _) = requestor.diff(now);

        if !due.is_empty() {
            let mut query = DnsMessage::query();
            for (name, qtype) in due {
                trace!("refresh {} {}", &name, qtype);
                query.add_question(&name, qtype);
            }
            self.send(&query, &to, Counter::CacheRefresh);
        }

        self.notify_subscribers(rid, events);
        self.schedule_cache_maintenance(rid, now);
    }

    fn schedule_cache_maintenance(&mut self, rid: u64, now: u64) {
        let Some(next) = self
            .requestors
            .get(&rid)
            .and_then(|r| r.cache.next_event_time())
        else {
            return;
        };
        self.cancel_action(Action::CacheMaintenance(rid));
        self.schedule(next.max(now + 1), Action::CacheMaintenance(rid));
    }

    fn notify_subscribers(&mut self, rid: u64, events: Vec<SubscriberEvent>) {
        let Some(requestor) = self.requestors.get(&rid) else {
            return;
        };
        for event in events {
            for id in requestor.subscribers.iter() {
                if let Some(entry) = self.subscribers.get(id) {
                    self.callouts.push_back(Callout::Subscriber {
                        id: *id,
                        subscriber: entry.subscriber.clone(),
                        event: event.clone(),
                    });
                }
            }
        }
    }

    /// Lets each requestor take what it wants from an inbound response.
    pub(crate) fn feed_requestors(&mut self, response: &DnsMessage, from: &ReplyAddress, now: u64) {
        let rids: Vec<u64> = self
            .requestors
            .iter()
            .filter(|(_, r)| r.started && r.accepts(from))
            .map(|(rid, _)| *rid)
            .collect();

        for rid in rids {
            let Some(requestor) = self.requestors.get_mut(&rid) else {
                continue;
            };
            let timers = requestor.add_records(response, now);
            if timers.is_empty() {
                continue;
            }
            let (events, discovered) = requestor.diff(now);
            let needs_resolve = requestor
                .cache
                .ptr_aliases(&requestor.service_full_name, now)
                .iter()
                .any(|alias| match requestor.cache.srv(alias, now) {
                    None => true,
                    Some(srv) => requestor.addresses_of(&srv.target, now).is_empty(),
                });

            self.notify_subscribers(rid, events);
            if discovered {
                self.reset_backoff(rid, now);
            }
            if needs_resolve && !self.is_scheduled(Action::ResolveInstances(rid)) {
                self.schedule(now, Action::ResolveInstances(rid));
            }
            self.schedule_cache_maintenance(rid, now);
        }
    }

    /// A new instance brings the PTR query interval back to the minimum.
    fn reset_backoff(&mut self, rid: u64, now: u64) {
        let Some(requestor) = self.requestors.get_mut(&rid) else {
            return;
        };
        if !requestor.started || requestor.query_interval <= MIN_QUERY_INTERVAL_MILLIS * 2 {
            return;
        }
        requestor.query_interval = MIN_QUERY_INTERVAL_MILLIS;
        self.cancel_action(Action::Browse(rid));
        self.schedule(now + MIN_QUERY_INTERVAL_MILLIS, Action::Browse(rid));
    }

    /// Tells subscribers that someone else asked for their service.
    pub(crate) fn notify_query(&mut self, question: &DnsQuestion, from: &ReplyAddress) {
        let rids: Vec<u64> = self
            .requestors
            .iter()
            .filter(|(_, r)| {
                r.accepts(from) && question.name.eq_ignore_ascii_case(&r.service_full_name)
            })
            .map(|(rid, _)| *rid)
            .collect();
        for rid in rids {
            self.notify_subscribers(rid, vec![SubscriberEvent::Query(question.qtype)]);
        }
    }
}
