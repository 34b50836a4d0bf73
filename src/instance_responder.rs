//! Publication of service instances: probe, announce, respond, goodbye.

#[cfg(feature = "logging")]
use crate::log::{debug, trace, warn};
use crate::{
    dns_parser::{DnsMessage, DnsQuestion, DnsRData, DnsResource, DnsSrv, RRType},
    mdns::{Action, Callout, Counter, MdnsCore, ReplyContext, SharedPublisher},
    mdns_names::{
        check_instance_name, check_service_name, check_subtype_name, local_instance_full_name,
        local_service_full_name, local_subtype_full_name, split_subtype_full_name,
        SERVICES_META_QUERY,
    },
    prober::{Probe, ProbeStep, PROBE_INTERVAL_MILLIS, TIEBREAK_LOST_DELAY_MILLIS},
    publication::{Publication, PublicationCause, DEFAULT_PTR_TTL},
    reply_address::{IpVersions, Media, ReplyAddress},
    Publisher,
};
use std::{cell::RefCell, net::IpAddr, rc::Rc, sync::Arc, time::Duration};

/// Number of unsolicited announcements, RFC 6762 section 8.3.
const ANNOUNCE_COUNT: u32 = 4;

/// Announcements go out at 0, 1, 3 and 7 seconds.
const FIRST_ANNOUNCE_INTERVAL_MILLIS: u64 = 1000;

/// What a [`PublicationResponder`](crate::PublicationResponder) answers.
#[derive(Debug, Clone)]
pub(crate) enum ResponderRequest {
    /// The first publication, needed before probing.
    Setup,
    Announce,
    Answer { kind: AnswerKind, reply: ReplyContext },
}

/// Which records a query asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AnswerKind {
    ServicePtr,
    SubtypePtr(String),
    Instance(RRType),
}

#[derive(Debug)]
pub(crate) enum PublicationState {
    /// Registered before the engine became ready.
    Pending,
    AwaitingPublication,
    Probing(Probe),
    Announcing { sent: u32 },
    Responding,
}

pub(crate) struct InstancePublication {
    pub(crate) service_name: String,
    pub(crate) instance_name: String,
    pub(crate) service_full_name: String,
    pub(crate) instance_full_name: String,
    pub(crate) media: Media,
    pub(crate) ip_versions: IpVersions,
    perform_probe: bool,
    publisher: SharedPublisher,
    pub(crate) state: PublicationState,

    /// The latest publication received from the publisher.
    publication: Option<Publication>,
    subtypes: Vec<String>,

    /// At least one announcement went out, so a goodbye is owed.
    announced: bool,
}

fn ttl_secs(ttl: Duration) -> u32 {
    ttl.as_secs().min(u32::MAX as u64) as u32
}

impl InstancePublication {
    fn is_visible(&self) -> bool {
        matches!(
            self.state,
            PublicationState::Announcing { .. } | PublicationState::Responding
        )
    }

    fn has_subtype(&self, subtype: &str) -> bool {
        self.subtypes.iter().any(|s| s.eq_ignore_ascii_case(subtype))
    }

    fn ptr_record(&self, publication: &Publication) -> Arc<DnsResource> {
        Arc::new(DnsResource::new(
            &self.service_full_name,
            ttl_secs(publication.ptr_ttl),
            DnsRData::Ptr(self.instance_full_name.clone()),
        ))
    }

    fn subtype_ptr_record(&self, subtype: &str, publication: &Publication) -> Arc<DnsResource> {
        Arc::new(DnsResource::new(
            &local_subtype_full_name(subtype, &self.service_name),
            ttl_secs(publication.ptr_ttl),
            DnsRData::Ptr(self.instance_full_name.clone()),
        ))
    }

    fn srv_record(&self, publication: &Publication, host_full_name: &str) -> Arc<DnsResource> {
        let srv = DnsSrv {
            priority: publication.srv_priority,
            weight: publication.srv_weight,
            port: publication.port,
            target: host_full_name.to_string(),
        };
        Arc::new(
            DnsResource::new(
                &self.instance_full_name,
                ttl_secs(publication.srv_ttl),
                DnsRData::Srv(srv),
            )
            .with_cache_flush(true),
        )
    }

    fn txt_record(&self, publication: &Publication) -> Arc<DnsResource> {
        Arc::new(
            DnsResource::new(
                &self.instance_full_name,
                ttl_secs(publication.txt_ttl),
                DnsRData::Txt(publication.txt_strings()),
            )
            .with_cache_flush(true),
        )
    }

    fn address_records(
        &self,
        publication: &Publication,
        host_full_name: &str,
        addresses: &[IpAddr],
    ) -> Vec<Arc<DnsResource>> {
        addresses
            .iter()
            .map(|ip| {
                Arc::new(DnsResource::address(
                    host_full_name,
                    ttl_secs(publication.srv_ttl),
                    *ip,
                ))
            })
            .collect()
    }

    /// Every record of the publication in the answer section.
    fn announcement(
        &self,
        publication: &Publication,
        host_full_name: &str,
        addresses: &[IpAddr],
    ) -> DnsMessage {
        let mut out = DnsMessage::response();
        out.add_answer(self.ptr_record(publication));
        for subtype in self.subtypes.iter() {
            out.add_answer(self.subtype_ptr_record(subtype, publication));
        }
        out.add_answer(self.srv_record(publication, host_full_name));
        out.add_answer(self.txt_record(publication));
        for record in self.address_records(publication, host_full_name, addresses) {
            out.add_answer(record);
        }
        out
    }

    /// The answer to one question, with the rest in the additionals.
    fn answer(
        &self,
        kind: &AnswerKind,
        publication: &Publication,
        host_full_name: &str,
        addresses: &[IpAddr],
    ) -> DnsMessage {
        let mut out = DnsMessage::response();
        let srv = self.srv_record(publication, host_full_name);
        let txt = self.txt_record(publication);
        match kind {
            AnswerKind::ServicePtr => {
                out.add_answer(self.ptr_record(publication));
                out.add_additional(srv);
                out.add_additional(txt);
            }
            AnswerKind::SubtypePtr(subtype) => {
                out.add_answer(self.subtype_ptr_record(subtype, publication));
                out.add_additional(srv);
                out.add_additional(txt);
            }
            AnswerKind::Instance(qtype) => {
                if qtype.matches(RRType::SRV) {
                    out.add_answer(srv);
                } else {
                    out.add_additional(srv);
                }
                if qtype.matches(RRType::TXT) {
                    out.add_answer(txt);
                }
            }
        }
        for record in self.address_records(publication, host_full_name, addresses) {
            out.add_additional(record);
        }
        out
    }

    /// PTR, SRV and TXT records with TTL 0.
    fn goodbye(&self, publication: &Publication, host_full_name: &str) -> DnsMessage {
        let mut out = DnsMessage::response();
        let mut records = vec![self.ptr_record(publication)];
        for subtype in self.subtypes.iter() {
            records.push(self.subtype_ptr_record(subtype, publication));
        }
        records.push(self.srv_record(publication, host_full_name));
        records.push(self.txt_record(publication));
        for record in records {
            out.add_answer(Arc::new(record.as_ref().clone().with_ttl(0)));
        }
        out
    }

    /// Matches a question against this publication.
    fn answer_kind(&self, question: &DnsQuestion) -> Option<AnswerKind> {
        let name = &question.name;
        if name.eq_ignore_ascii_case(&self.service_full_name) && question.qtype.matches(RRType::PTR)
        {
            return Some(AnswerKind::ServicePtr);
        }
        if name.eq_ignore_ascii_case(&self.instance_full_name)
            && (question.qtype.matches(RRType::SRV) || question.qtype.matches(RRType::TXT))
        {
            return Some(AnswerKind::Instance(question.qtype));
        }
        if let Some((subtype, service_full_name)) = split_subtype_full_name(name) {
            if service_full_name.eq_ignore_ascii_case(&self.service_full_name)
                && question.qtype.matches(RRType::PTR)
                && self.has_subtype(subtype)
            {
                return Some(AnswerKind::SubtypePtr(subtype.to_string()));
            }
        }
        None
    }

    /// Known-answer suppression, RFC 6762 section 7.1: the querier already
    /// holds our PTR with at least half of its TTL left.
    fn is_known_answer(
        &self,
        kind: &AnswerKind,
        question: &DnsQuestion,
        query: &DnsMessage,
    ) -> bool {
        if matches!(kind, AnswerKind::Instance(_)) {
            return false;
        }
        let ptr_ttl = self
            .publication
            .as_ref()
            .map(|p| ttl_secs(p.ptr_ttl))
            .unwrap_or_else(|| ttl_secs(DEFAULT_PTR_TTL));
        query.answers.iter().any(|known| {
            known.name_matches(&question.name)
                && known
                    .ptr_alias()
                    .map(|alias| alias.eq_ignore_ascii_case(&self.instance_full_name))
                    .unwrap_or(false)
                && known.ttl >= ptr_ttl / 2
        })
    }
}

impl MdnsCore {
    fn find_publication(&self, service_name: &str, instance_name: &str) -> Option<u64> {
        let instance_full_name =
            local_instance_full_name(instance_name, service_name).to_ascii_lowercase();
        self.publications
            .iter()
            .find(|(_, p)| p.instance_full_name.eq_ignore_ascii_case(&instance_full_name))
            .map(|(id, _)| *id)
    }

    pub(crate) fn publish_instance(
        &mut self,
        service_name: &str,
        instance_name: &str,
        media: Media,
        ip_versions: IpVersions,
        perform_probe: bool,
        publisher: Box<dyn Publisher>,
    ) -> bool {
        if let Err(e) =
            check_service_name(service_name).and_then(|_| check_instance_name(instance_name))
        {
            debug!("publish_instance: {}", e);
            return false;
        }
        if self.find_publication(service_name, instance_name).is_some() {
            debug!(
                "publish_instance: {} {} is already published",
                instance_name, service_name
            );
            return false;
        }

        let id = self.next_id();
        let publication = InstancePublication {
            service_name: service_name.to_string(),
            instance_name: instance_name.to_string(),
            service_full_name: local_service_full_name(service_name),
            instance_full_name: local_instance_full_name(instance_name, service_name),
            media,
            ip_versions,
            perform_probe,
            publisher: Rc::new(RefCell::new(publisher)),
            state: PublicationState::Pending,
            publication: None,
            subtypes: Vec::new(),
            announced: false,
        };
        debug!("publish {}", &publication.instance_full_name);
        self.publications.insert(id, publication);

        if self.is_ready() {
            let now = self.now();
            self.start_publication(id, now);
        }
        true
    }

    /// Asks for the first publication. Probing starts once it arrives.
    pub(crate) fn start_publication(&mut self, id: u64, _now: u64) {
        let Some(p) = self.publications.get_mut(&id) else {
            return;
        };
        if !matches!(p.state, PublicationState::Pending) {
            return;
        }
        p.state = PublicationState::AwaitingPublication;
        self.request_publication(
            id,
            PublicationCause::Announcement,
            "",
            vec![],
            ResponderRequest::Setup,
        );
    }

    fn request_publication(
        &mut self,
        id: u64,
        cause: PublicationCause,
        subtype: &str,
        source_addresses: Vec<std::net::SocketAddr>,
        request: ResponderRequest,
    ) {
        let Some(p) = self.publications.get(&id) else {
            return;
        };
        let publisher = p.publisher.clone();
        let responder = self.new_responder(id, request);
        self.callouts.push_back(Callout::GetPublication {
            publication_id: id,
            publisher,
            cause,
            subtype: subtype.to_string(),
            source_addresses,
            responder,
        });
    }

    pub(crate) fn handle_instance_reply(
        &mut self,
        id: u64,
        request: ResponderRequest,
        publication: Option<Publication>,
        now: u64,
    ) {
        let (service_name, ip_versions) = match self.publications.get(&id) {
            Some(p) => (p.service_name.clone(), p.ip_versions),
            None => {
                trace!("publication {} is gone, dropping reply", id);
                return;
            }
        };
        let host_full_name = self.host_full_name_for(&service_name);
        let addresses = self.local_addresses(ip_versions);
        let Some(p) = self.publications.get_mut(&id) else {
            return;
        };

        let publication = publication.filter(|publication| {
            let valid = publication.has_valid_text();
            if !valid {
                warn!(
                    "text of {} does not fit in TXT strings",
                    &p.instance_full_name
                );
            }
            valid
        });
        let Some(publication) = publication else {
            if matches!(request, ResponderRequest::Setup) {
                debug!(
                    "no publication for {}, withdrawing it",
                    &p.instance_full_name
                );
                let publisher = p.publisher.clone();
                self.publications.remove(&id);
                self.cancel_actions(id);
                self.callouts
                    .push_back(Callout::ReportSuccess(publisher, false));
            }
            return;
        };
        p.publication = Some(publication.clone());

        match request {
            ResponderRequest::Setup => {
                if !matches!(p.state, PublicationState::AwaitingPublication) {
                    return;
                }
                if p.perform_probe {
                    let records = vec![
                        p.srv_record(&publication, &host_full_name),
                        p.txt_record(&publication),
                    ];
                    p.state = PublicationState::Probing(Probe::new(&p.instance_full_name, records));
                    self.schedule(now + Probe::initial_delay(), Action::InstanceProbe(id));
                } else {
                    self.publication_succeeded(id, now);
                }
            }
            ResponderRequest::Announce => {
                let out = p.announcement(&publication, &host_full_name, &addresses);
                let to = ReplyAddress::multicast(p.media, p.ip_versions);
                p.announced = true;
                self.send(&out, &to, Counter::Announce);
            }
            ResponderRequest::Answer { kind, reply } => {
                let (media, ip_versions) = (p.media, p.ip_versions);
                let out = p.answer(&kind, &publication, &host_full_name, &addresses);
                self.send_response(out, &reply, media, ip_versions);
            }
        }
    }

    fn publication_succeeded(&mut self, id: u64, now: u64) {
        let Some(p) = self.publications.get_mut(&id) else {
            return;
        };
        debug!("{} is ours", &p.instance_full_name);
        p.state = PublicationState::Announcing { sent: 0 };
        let publisher = p.publisher.clone();
        self.callouts
            .push_back(Callout::ReportSuccess(publisher, true));
        self.run_announce(id, now);
    }

    pub(crate) fn run_instance_probe(&mut self, id: u64, now: u64) {
        let Some(p) = self.publications.get_mut(&id) else {
            return;
        };
        let PublicationState::Probing(probe) = &mut p.state else {
            return;
        };
        match probe.next_step() {
            ProbeStep::Send(query) => {
                let to = ReplyAddress::multicast(p.media, p.ip_versions);
                self.send(&query, &to, Counter::Probe);
                self.schedule(now + PROBE_INTERVAL_MILLIS, Action::InstanceProbe(id));
            }
            ProbeStep::Done => self.publication_succeeded(id, now),
        }
    }

    /// Asks for the publication behind the next announcement and schedules
    /// the one after.
    pub(crate) fn run_announce(&mut self, id: u64, now: u64) {
        let Some(p) = self.publications.get_mut(&id) else {
            return;
        };
        let PublicationState::Announcing { sent } = p.state else {
            return;
        };

        let sent = sent + 1;
        if sent < ANNOUNCE_COUNT {
            p.state = PublicationState::Announcing { sent };
            let delay = FIRST_ANNOUNCE_INTERVAL_MILLIS << (sent - 1);
            self.schedule(now + delay, Action::Announce(id));
        } else {
            p.state = PublicationState::Responding;
        }

        self.request_publication(
            id,
            PublicationCause::Announcement,
            "",
            vec![],
            ResponderRequest::Announce,
        );
    }

    /// Restarts the announcements of a visible publication.
    pub(crate) fn reannounce_publication(&mut self, id: u64, now: u64) {
        let Some(p) = self.publications.get_mut(&id) else {
            return;
        };
        if !p.is_visible() {
            return;
        }
        p.state = PublicationState::Announcing { sent: 0 };
        self.cancel_actions(id);
        self.run_announce(id, now);
    }

    pub(crate) fn reannounce(&mut self, service_name: &str, instance_name: &str) -> bool {
        let Some(id) = self.find_publication(service_name, instance_name) else {
            return false;
        };
        let now = self.now();
        self.reannounce_publication(id, now);
        true
    }

    pub(crate) fn set_subtypes(
        &mut self,
        service_name: &str,
        instance_name: &str,
        subtypes: Vec<String>,
    ) -> bool {
        if let Some(e) = subtypes.iter().find_map(|s| check_subtype_name(s).err()) {
            warn!("set_subtypes: {}", e);
            return false;
        }
        let Some(id) = self.find_publication(service_name, instance_name) else {
            return false;
        };
        let host_full_name = self.host_full_name_for(service_name);
        let Some(p) = self.publications.get_mut(&id) else {
            return false;
        };

        // Say goodbye to the subtypes going away.
        let mut goodbye = DnsMessage::response();
        if let (true, Some(publication)) = (p.announced, p.publication.as_ref()) {
            for old in p.subtypes.iter() {
                if !subtypes.iter().any(|s| s.eq_ignore_ascii_case(old)) {
                    let record = p.subtype_ptr_record(old, publication);
                    goodbye.add_answer(Arc::new(record.as_ref().clone().with_ttl(0)));
                }
            }
        }
        trace!(
            "subtypes of {} on {}: {:?}",
            &p.instance_full_name,
            host_full_name,
            &subtypes
        );
        p.subtypes = subtypes;
        let to = ReplyAddress::multicast(p.media, p.ip_versions);
        if !goodbye.answers.is_empty() {
            self.send(&goodbye, &to, Counter::Goodbye);
        }

        let now = self.now();
        self.reannounce_publication(id, now);
        true
    }

    pub(crate) fn unpublish_instance(&mut self, service_name: &str, instance_name: &str) -> bool {
        match self.find_publication(service_name, instance_name) {
            Some(id) => {
                self.withdraw_publication(id);
                true
            }
            None => false,
        }
    }

    /// Removes a publication, sending a goodbye if it was announced.
    pub(crate) fn withdraw_publication(&mut self, id: u64) {
        self.cancel_actions(id);
        let Some(p) = self.publications.remove(&id) else {
            return;
        };
        debug!("unpublish {}", &p.instance_full_name);
        if let (true, Some(publication)) = (p.announced, p.publication.as_ref()) {
            let host_full_name = self.host_full_name_for(&p.service_name);
            let out = p.goodbye(publication, &host_full_name);
            let to = ReplyAddress::multicast(p.media, p.ip_versions);
            self.send(&out, &to, Counter::Goodbye);
        }
    }

    /// Publications still probing lose their name to a conflicting response.
    pub(crate) fn check_instance_conflicts(&mut self, response: &DnsMessage) {
        let conflicts: Vec<u64> = self
            .publications
            .iter()
            .filter(|(_, p)| match &p.state {
                PublicationState::Probing(probe) => probe.conflicts_with(response),
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect();

        for id in conflicts {
            self.cancel_actions(id);
            if let Some(p) = self.publications.remove(&id) {
                debug!(
                    "instance name {} of {} is taken",
                    &p.instance_name, &p.service_name
                );
                self.callouts
                    .push_back(Callout::ReportSuccess(p.publisher, false));
            }
        }
    }

    pub(crate) fn check_instance_tiebreaks(&mut self, query: &DnsMessage, now: u64) {
        let mut lost = Vec::new();
        for (id, p) in self.publications.iter_mut() {
            if let PublicationState::Probing(probe) = &mut p.state {
                if probe.loses_tiebreak(query) {
                    debug!("lost the tiebreak for {}", &p.instance_full_name);
                    probe.restart();
                    lost.push(*id);
                }
            }
        }
        for id in lost {
            self.cancel_actions(id);
            self.schedule(now + TIEBREAK_LOST_DELAY_MILLIS, Action::InstanceProbe(id));
        }
    }

    /// Answers one question of an inbound query from the publications.
    pub(crate) fn answer_instance_question(
        &mut self,
        question: &DnsQuestion,
        query: &DnsMessage,
        reply: &ReplyContext,
    ) {
        if question.name.eq_ignore_ascii_case(SERVICES_META_QUERY)
            && question.qtype.matches(RRType::PTR)
        {
            self.answer_meta_query(reply);
            return;
        }

        let mut ids: Vec<u64> = self.publications.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(p) = self.publications.get(&id) else {
                continue;
            };
            if !p.is_visible() || !reply.from.matches(p.media, p.ip_versions) {
                continue;
            }
            let Some(kind) = p.answer_kind(question) else {
                continue;
            };
            if p.is_known_answer(&kind, question, query) {
                trace!("known answer for {}", &p.instance_full_name);
                self.increase_counter(Counter::KnownAnswerSuppression, 1);
                continue;
            }

            let subtype = match &kind {
                AnswerKind::SubtypePtr(subtype) => subtype.clone(),
                _ => String::new(),
            };
            self.request_publication(
                id,
                reply.cause(),
                &subtype,
                vec![reply.from.socket_address()],
                ResponderRequest::Answer {
                    kind,
                    reply: reply.clone(),
                },
            );
        }
    }

    /// Service type enumeration, RFC 6763 section 9.
    fn answer_meta_query(&mut self, reply: &ReplyContext) {
        let mut out = DnsMessage::response();
        for p in self.publications.values() {
            if p.is_visible() && reply.from.matches(p.media, p.ip_versions) {
                out.add_answer(Arc::new(DnsResource::new(
                    SERVICES_META_QUERY,
                    ttl_secs(DEFAULT_PTR_TTL),
                    DnsRData::Ptr(p.service_full_name.clone()),
                )));
            }
        }
        let (media, ip_versions) = (reply.from.media(), reply.from.ip_versions());
        self.send_response(out, reply, media, ip_versions);
    }
}
