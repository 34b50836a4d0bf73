use mdns_core::{
    current_time_millis, DnsMessage, DnsRData, DnsResource, DnsSrv, HostAddress, HostPublisher,
    HostResolution, IpVersions, Mdns, MdnsState, Media, Publication, PublicationCause,
    PublicationResponder, Publisher, RRType, ReplyAddress, Result, ServiceInstance, Subscriber,
    SubscriberEvent, Transceiver,
};
use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;

const SERVICE: &str = "_ipp._tcp.";
const SERVICE_FULL: &str = "_ipp._tcp.local.";

type Sent = Rc<RefCell<Vec<(DnsMessage, ReplyAddress)>>>;

/// Records what the engine sends instead of touching the network.
struct FakeTransceiver {
    sent: Sent,
    stopped: Rc<RefCell<bool>>,
}

impl Transceiver for FakeTransceiver {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {
        *self.stopped.borrow_mut() = true;
    }

    fn has_interfaces(&self) -> bool {
        true
    }

    fn send_message(&mut self, message: &DnsMessage, reply_address: &ReplyAddress) {
        self.sent
            .borrow_mut()
            .push((message.clone(), *reply_address));
    }

    fn local_host_addresses(&self) -> Vec<HostAddress> {
        vec![HostAddress::new(
            "192.168.1.2".parse().unwrap(),
            1,
            Duration::from_secs(120),
        )]
    }
}

struct TestEngine {
    mdns: Mdns,
    sent: Sent,
    stopped: Rc<RefCell<bool>>,
}

fn started_engine() -> TestEngine {
    let sent: Sent = Rc::new(RefCell::new(Vec::new()));
    let stopped = Rc::new(RefCell::new(false));
    let mdns = Mdns::new(Box::new(FakeTransceiver {
        sent: sent.clone(),
        stopped: stopped.clone(),
    }));

    let ready = Rc::new(RefCell::new(false));
    let ready_flag = ready.clone();
    mdns.start(
        "office",
        false,
        Box::new(move || *ready_flag.borrow_mut() = true),
        vec![],
    )
    .expect("start");
    assert!(*ready.borrow());
    assert_eq!(mdns.state(), MdnsState::Ready);

    TestEngine {
        mdns,
        sent,
        stopped,
    }
}

impl TestEngine {
    /// Runs the timers from now until `millis` later, in 50 ms steps.
    fn advance(&self, from: u64, millis: u64) -> u64 {
        let mut t = from;
        while t < from + millis {
            t += 50;
            self.mdns.handle_timeout(t);
        }
        t
    }

    fn take_sent(&self) -> Vec<(DnsMessage, ReplyAddress)> {
        self.sent.borrow_mut().drain(..).collect()
    }

    fn counter(&self, name: &str) -> i64 {
        self.mdns.metrics().get(name).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct PublisherLog {
    successes: Vec<bool>,
    causes: Vec<PublicationCause>,
    pending: Vec<PublicationResponder>,
}

/// Answers every request on the spot, or keeps the responders when
/// `publication` is `None`.
struct TestPublisher {
    publication: Option<Publication>,
    log: Rc<RefCell<PublisherLog>>,
}

impl Publisher for TestPublisher {
    fn report_success(&mut self, success: bool) {
        self.log.borrow_mut().successes.push(success);
    }

    fn get_publication(
        &mut self,
        cause: PublicationCause,
        _subtype: &str,
        _source_addresses: &[SocketAddr],
        responder: PublicationResponder,
    ) {
        self.log.borrow_mut().causes.push(cause);
        match &self.publication {
            Some(publication) => responder.respond(Some(publication.clone())),
            None => self.log.borrow_mut().pending.push(responder),
        }
    }
}

fn publisher(publication: Option<Publication>) -> (Box<TestPublisher>, Rc<RefCell<PublisherLog>>) {
    let log = Rc::new(RefCell::new(PublisherLog::default()));
    let publisher = TestPublisher {
        publication,
        log: log.clone(),
    };
    (Box::new(publisher), log)
}

fn printer_publication() -> Publication {
    Publication::new(631, vec!["rp=ipp".to_string()])
}

struct TestSubscriber {
    events: Rc<RefCell<Vec<SubscriberEvent>>>,
}

impl Subscriber for TestSubscriber {
    fn instance_discovered(&mut self, instance: &ServiceInstance) {
        self.events
            .borrow_mut()
            .push(SubscriberEvent::InstanceDiscovered(instance.clone()));
    }

    fn instance_changed(&mut self, instance: &ServiceInstance) {
        self.events
            .borrow_mut()
            .push(SubscriberEvent::InstanceChanged(instance.clone()));
    }

    fn instance_lost(&mut self, service_name: &str, instance_name: &str) {
        self.events.borrow_mut().push(SubscriberEvent::InstanceLost {
            service_name: service_name.to_string(),
            instance_name: instance_name.to_string(),
        });
    }

    fn query(&mut self, qtype: RRType) {
        self.events.borrow_mut().push(SubscriberEvent::Query(qtype));
    }
}

fn subscriber() -> (Box<TestSubscriber>, Rc<RefCell<Vec<SubscriberEvent>>>) {
    let events = Rc::new(RefCell::new(Vec::new()));
    (
        Box::new(TestSubscriber {
            events: events.clone(),
        }),
        events,
    )
}

struct TestHostPublisher {
    successes: Rc<RefCell<Vec<bool>>>,
}

impl HostPublisher for TestHostPublisher {
    fn report_success(&mut self, success: bool) {
        self.successes.borrow_mut().push(success);
    }
}

fn peer(port: u16, media: Media) -> ReplyAddress {
    ReplyAddress::new(
        SocketAddr::new("192.168.1.7".parse().unwrap(), port),
        "192.168.1.2".parse().unwrap(),
        media,
        IpVersions::V4,
    )
}

fn query(name: &str, qtype: RRType) -> DnsMessage {
    let mut query = DnsMessage::query();
    query.add_question(name, qtype);
    query
}

/// A response from another host announcing `instance` of `_ipp._tcp.`.
fn lab_response(instance: &str, port: u16) -> DnsMessage {
    let instance_full = format!("{}.{}", instance, SERVICE_FULL);
    let mut response = DnsMessage::response();
    response.add_answer(Arc::new(DnsResource::new(
        SERVICE_FULL,
        4500,
        DnsRData::Ptr(instance_full.clone()),
    )));
    response.add_additional(Arc::new(
        DnsResource::new(
            &instance_full,
            120,
            DnsRData::Srv(DnsSrv {
                priority: 0,
                weight: 0,
                port,
                target: "lab.local.".to_string(),
            }),
        )
        .with_cache_flush(true),
    ));
    response.add_additional(Arc::new(DnsResource::new(
        &instance_full,
        4500,
        DnsRData::Txt(vec![b"note=lab".to_vec()]),
    )));
    response.add_additional(Arc::new(DnsResource::address(
        "lab.local.",
        120,
        "192.168.1.9".parse().unwrap(),
    )));
    response
}

#[test]
fn publication_probes_then_announces() {
    let engine = started_engine();
    let (publisher, log) = publisher(Some(printer_publication()));

    assert!(engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        true,
        publisher,
    ));
    assert_eq!(engine.counter("probe"), 0);

    let t0 = current_time_millis();
    engine.advance(t0, 10_000);

    assert_eq!(engine.counter("probe"), 3);
    assert_eq!(engine.counter("announce"), 4);
    assert_eq!(log.borrow().successes, vec![true]);

    let sent = engine.take_sent();
    let probes: Vec<&DnsMessage> = sent
        .iter()
        .map(|(m, _)| m)
        .filter(|m| m.is_query())
        .collect();
    assert_eq!(probes.len(), 3);
    assert!(probes[0].questions[0].unicast_response);
    assert!(!probes[1].questions[0].unicast_response);
    assert_eq!(probes[0].questions[0].qtype, RRType::ANY);
    assert!(probes[0].authorities.iter().all(|r| r.ttl == 2));

    let announcement = sent
        .iter()
        .map(|(m, _)| m)
        .find(|m| m.is_response())
        .expect("an announcement");
    assert!(announcement
        .answers
        .iter()
        .any(|r| r.ptr_alias() == Some("Office._ipp._tcp.local.")));
    assert!(announcement
        .answers
        .iter()
        .any(|r| r.ip_address() == Some("192.168.1.2".parse().unwrap())));
}

#[test]
fn one_publication_per_instance_name() {
    let engine = started_engine();
    let (first, _) = publisher(Some(printer_publication()));
    let (second, _) = publisher(Some(printer_publication()));

    assert!(engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        false,
        first,
    ));
    assert!(!engine.mdns.publish_service_instance(
        "_IPP._tcp.",
        "office",
        Media::Both,
        IpVersions::Both,
        false,
        second,
    ));

    assert!(engine.mdns.unpublish_service_instance(SERVICE, "Office"));
    assert!(!engine.mdns.unpublish_service_instance(SERVICE, "Office"));
}

#[test]
fn probe_conflict_withdraws_publication() {
    let engine = started_engine();
    let (publisher, log) = publisher(Some(printer_publication()));
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        true,
        publisher,
    );

    // Send the first probe.
    let t0 = current_time_millis();
    let t = engine.advance(t0, 300);
    assert!(engine.counter("probe") >= 1);

    let mut response = DnsMessage::response();
    response.add_answer(Arc::new(DnsResource::new(
        "Office._ipp._tcp.local.",
        120,
        DnsRData::Srv(DnsSrv {
            priority: 0,
            weight: 0,
            port: 9,
            target: "other.local.".to_string(),
        }),
    )));
    engine.mdns.receive_message(response, peer(5353, Media::Wired));
    assert_eq!(log.borrow().successes, vec![false]);

    let probes = engine.counter("probe");
    engine.advance(t, 10_000);
    assert_eq!(engine.counter("probe"), probes);
    assert_eq!(engine.counter("announce"), 0);

    // The name is free again.
    let (again, _) = self::publisher(Some(printer_publication()));
    assert!(engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        true,
        again,
    ));
}

#[test]
fn late_publisher_reply_drives_announcement() {
    let engine = started_engine();
    let (publisher, log) = publisher(None);
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        false,
        publisher,
    );

    assert_eq!(log.borrow().causes, vec![PublicationCause::Announcement]);
    assert_eq!(engine.counter("announce"), 0);

    let responder = log.borrow_mut().pending.remove(0);
    responder.respond(Some(printer_publication()));
    assert_eq!(log.borrow().successes, vec![true]);

    // Success asks for the first announcement; answer that one too.
    let responder = log.borrow_mut().pending.remove(0);
    responder.respond(Some(printer_publication()));
    assert_eq!(engine.counter("announce"), 1);
}

#[test]
fn no_publication_means_failure() {
    let engine = started_engine();
    let (publisher, log) = publisher(None);
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        true,
        publisher,
    );

    let responder = log.borrow_mut().pending.remove(0);
    responder.respond(None);
    assert_eq!(log.borrow().successes, vec![false]);
    assert!(!engine.mdns.unpublish_service_instance(SERVICE, "Office"));
}

#[test]
fn oversized_text_means_failure() {
    let engine = started_engine();
    let text = vec!["x".repeat(256)];
    let (publisher, log) = publisher(Some(Publication::new(631, text)));
    engine.take_sent();
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        false,
        publisher,
    );

    assert_eq!(log.borrow().successes, vec![false]);
    assert!(engine.take_sent().is_empty());
    assert!(!engine.mdns.unpublish_service_instance(SERVICE, "Office"));
}

#[test]
fn queries_outside_media_are_ignored() {
    let engine = started_engine();
    let (publisher, _) = publisher(Some(printer_publication()));
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Wired,
        IpVersions::V4,
        false,
        publisher,
    );
    engine.take_sent();

    engine
        .mdns
        .receive_message(query(SERVICE_FULL, RRType::PTR), peer(5353, Media::Wireless));
    assert!(engine.take_sent().is_empty());

    engine
        .mdns
        .receive_message(query(SERVICE_FULL, RRType::PTR), peer(5353, Media::Wired));
    let sent = engine.take_sent();
    assert_eq!(sent.len(), 1);
    let (response, to) = &sent[0];
    assert_eq!(*to, ReplyAddress::multicast(Media::Wired, IpVersions::V4));
    assert_eq!(response.answers.len(), 1);
    assert_eq!(
        response.answers[0].ptr_alias(),
        Some("Office._ipp._tcp.local.")
    );
    assert!(response
        .additionals
        .iter()
        .any(|r| r.rr_type() == RRType::SRV));
}

#[test]
fn known_answer_suppresses_response() {
    let engine = started_engine();
    let (publisher, _) = publisher(Some(printer_publication()));
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        false,
        publisher,
    );
    engine.take_sent();

    let mut known = query(SERVICE_FULL, RRType::PTR);
    known.add_answer(Arc::new(DnsResource::new(
        SERVICE_FULL,
        4000,
        DnsRData::Ptr("Office._ipp._tcp.local.".to_string()),
    )));
    engine.mdns.receive_message(known, peer(5353, Media::Wired));

    assert!(engine.take_sent().is_empty());
    assert_eq!(engine.counter("known-answer-suppression"), 1);
}

#[test]
fn legacy_unicast_query() {
    let engine = started_engine();
    let (publisher, log) = publisher(Some(printer_publication()));
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        false,
        publisher,
    );
    engine.take_sent();

    let mut legacy = query(SERVICE_FULL, RRType::PTR);
    legacy.header.id = 0x77;
    let from = peer(40000, Media::Wired);
    engine.mdns.receive_message(legacy, from);

    assert_eq!(
        log.borrow().causes.last(),
        Some(&PublicationCause::QueryUnicastResponse)
    );
    let sent = engine.take_sent();
    assert_eq!(sent.len(), 1);
    let (response, to) = &sent[0];
    assert_eq!(*to, from);
    assert_eq!(response.header.id, 0x77);
    assert_eq!(response.questions.len(), 1);
    for record in response.answers.iter().chain(response.additionals.iter()) {
        assert!(record.ttl <= 10);
        assert!(!record.cache_flush);
    }
}

#[test]
fn service_type_enumeration() {
    let engine = started_engine();
    let (publisher, _) = publisher(Some(printer_publication()));
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        false,
        publisher,
    );
    engine.take_sent();

    engine.mdns.receive_message(
        query("_services._dns-sd._udp.local.", RRType::PTR),
        peer(5353, Media::Wired),
    );
    let sent = engine.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.answers[0].ptr_alias(), Some(SERVICE_FULL));
}

#[test]
fn unpublish_says_goodbye() {
    let engine = started_engine();
    let (publisher, _) = publisher(Some(printer_publication()));
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        false,
        publisher,
    );
    engine.take_sent();

    engine.mdns.unpublish_service_instance(SERVICE, "Office");
    let sent = engine.take_sent();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].0.answers.is_empty());
    assert!(sent[0].0.answers.iter().all(|r| r.is_goodbye()));
    assert_eq!(engine.counter("goodbye"), 1);
}

#[test]
fn subtypes_are_answered_and_retracted() {
    let engine = started_engine();
    let (publisher, _) = publisher(Some(printer_publication()));
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        false,
        publisher,
    );
    assert!(engine
        .mdns
        .set_subtypes(SERVICE, "Office", vec!["_color".to_string()]));
    engine.take_sent();

    engine.mdns.receive_message(
        query("_color._sub._ipp._tcp.local.", RRType::PTR),
        peer(5353, Media::Wired),
    );
    assert_eq!(engine.take_sent().len(), 1);

    assert!(engine.mdns.set_subtypes(SERVICE, "Office", vec![]));
    let sent = engine.take_sent();
    let goodbye = &sent[0].0;
    assert_eq!(goodbye.answers.len(), 1);
    assert!(goodbye.answers[0].is_goodbye());

    assert!(!engine
        .mdns
        .set_subtypes(SERVICE, "Office", vec!["bad.subtype".to_string()]));
}

#[test]
fn subscription_discovers_instances() {
    let engine = started_engine();
    let (first, events) = subscriber();
    engine.mdns.subscribe_to_service(
        SERVICE,
        Media::Both,
        IpVersions::Both,
        false,
        true,
        first,
    );

    let sent = engine.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.questions[0].name, SERVICE_FULL);
    assert_eq!(sent[0].0.questions[0].qtype, RRType::PTR);

    engine
        .mdns
        .receive_message(lab_response("Lab", 631), peer(5353, Media::Wired));
    {
        let events = events.borrow();
        assert_eq!(events.len(), 1);
        let SubscriberEvent::InstanceDiscovered(instance) = &events[0] else {
            panic!("expected a discovery, got {:?}", events[0]);
        };
        assert_eq!(instance.instance_name, "Lab");
        assert_eq!(instance.target, "lab.local.");
        assert_eq!(
            instance.addresses,
            vec!["192.168.1.9:631".parse::<SocketAddr>().unwrap()]
        );
        assert_eq!(instance.get_property_val_str("note"), Some("lab"));
    }

    // A second subscriber with the same options catches up at once.
    let (second, late_events) = subscriber();
    engine.mdns.subscribe_to_service(
        "_IPP._tcp.",
        Media::Both,
        IpVersions::Both,
        false,
        true,
        second,
    );
    assert_eq!(late_events.borrow().len(), 1);
    assert!(engine.take_sent().is_empty());

    // New port: changed.
    engine
        .mdns
        .receive_message(lab_response("Lab", 632), peer(5353, Media::Wired));
    assert!(matches!(
        events.borrow().last(),
        Some(SubscriberEvent::InstanceChanged(i)) if i.addresses[0].port() == 632
    ));
}

#[test]
fn goodbye_reports_lost_instance() {
    let engine = started_engine();
    let (subscriber, events) = subscriber();
    engine.mdns.subscribe_to_service(
        SERVICE,
        Media::Both,
        IpVersions::Both,
        false,
        true,
        subscriber,
    );
    engine
        .mdns
        .receive_message(lab_response("Lab", 631), peer(5353, Media::Wired));

    let mut goodbye = DnsMessage::response();
    goodbye.add_answer(Arc::new(DnsResource::new(
        SERVICE_FULL,
        0,
        DnsRData::Ptr("Lab._ipp._tcp.local.".to_string()),
    )));
    engine
        .mdns
        .receive_message(goodbye, peer(5353, Media::Wired));

    // Goodbye records linger for a second.
    let t0 = current_time_millis();
    engine.advance(t0, 2_000);
    assert_eq!(
        events.borrow().last(),
        Some(&SubscriberEvent::InstanceLost {
            service_name: SERVICE.to_string(),
            instance_name: "Lab".to_string(),
        })
    );
}

#[test]
fn subscription_media_filter_and_queries() {
    let engine = started_engine();
    let (subscriber, events) = subscriber();
    let id = engine.mdns.subscribe_to_service(
        SERVICE,
        Media::Wired,
        IpVersions::Both,
        false,
        false,
        subscriber,
    );
    assert!(engine.take_sent().is_empty());

    engine
        .mdns
        .receive_message(lab_response("Lab", 631), peer(5353, Media::Wireless));
    assert!(events.borrow().is_empty());

    engine
        .mdns
        .receive_message(query(SERVICE_FULL, RRType::PTR), peer(5353, Media::Wired));
    assert_eq!(
        events.borrow().as_slice(),
        &[SubscriberEvent::Query(RRType::PTR)]
    );

    engine.mdns.unsubscribe(id);
    engine
        .mdns
        .receive_message(lab_response("Lab", 631), peer(5353, Media::Wired));
    assert_eq!(events.borrow().len(), 1);

    let t0 = current_time_millis();
    engine.advance(t0, 5_000);
    assert_eq!(engine.counter("browse"), 0);
}

#[test]
fn browse_backs_off() {
    let engine = started_engine();
    let (subscriber, _) = subscriber();
    engine.mdns.subscribe_to_service(
        SERVICE,
        Media::Both,
        IpVersions::Both,
        false,
        true,
        subscriber,
    );

    // Queries at 0, 1, 3 and 7 seconds.
    let t0 = current_time_millis();
    engine.advance(t0, 8_000);
    assert_eq!(engine.counter("browse"), 4);
}

#[test]
fn proxy_host_answers_by_media() {
    let engine = started_engine();
    let successes = Rc::new(RefCell::new(Vec::new()));
    assert!(engine.mdns.publish_host(
        "printer",
        vec!["192.168.1.50".parse().unwrap()],
        Media::Wired,
        IpVersions::V4,
        false,
        Box::new(TestHostPublisher {
            successes: successes.clone(),
        }),
    ));
    assert_eq!(*successes.borrow(), vec![true]);

    // Our own host name is not available to proxy.
    assert!(!engine.mdns.publish_host(
        "office",
        vec![],
        Media::Both,
        IpVersions::Both,
        false,
        Box::new(TestHostPublisher {
            successes: successes.clone(),
        }),
    ));

    engine
        .mdns
        .receive_message(query("printer.local.", RRType::A), peer(5353, Media::Wireless));
    assert!(engine.take_sent().is_empty());

    engine
        .mdns
        .receive_message(query("printer.local.", RRType::A), peer(5353, Media::Wired));
    let sent = engine.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].0.answers[0].ip_address(),
        Some("192.168.1.50".parse().unwrap())
    );

    assert!(engine.mdns.unpublish_host("printer"));
    let sent = engine.take_sent();
    assert!(sent[0].0.answers.iter().all(|r| r.is_goodbye()));
}

#[test]
fn own_host_name_is_answered() {
    let engine = started_engine();
    engine
        .mdns
        .receive_message(query("office.local.", RRType::A), peer(5353, Media::Wired));
    let sent = engine.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].0.answers[0].ip_address(),
        Some("192.168.1.2".parse().unwrap())
    );
}

fn resolution_sink() -> (
    Box<dyn FnOnce(HostResolution)>,
    Rc<RefCell<Vec<HostResolution>>>,
) {
    let results = Rc::new(RefCell::new(Vec::new()));
    let sink = results.clone();
    (
        Box::new(move |resolution| sink.borrow_mut().push(resolution)),
        results,
    )
}

#[test]
fn resolve_host_names() {
    let engine = started_engine();
    let t0 = current_time_millis();

    // Our own name needs no query.
    let (callback, results) = resolution_sink();
    engine
        .mdns
        .resolve_host_name("office", t0 + 3_000, callback);
    assert_eq!(
        results.borrow()[0].v4_address,
        Some("192.168.1.2".parse().unwrap())
    );

    // Answered by the network.
    let (callback, results) = resolution_sink();
    engine.mdns.resolve_host_name("lab", t0 + 3_000, callback);
    assert!(results.borrow().is_empty());
    assert_eq!(engine.counter("resolve-hostname"), 1);

    let mut response = DnsMessage::response();
    response.add_answer(Arc::new(DnsResource::address(
        "lab.local.",
        120,
        "192.168.1.9".parse().unwrap(),
    )));
    engine
        .mdns
        .receive_message(response, peer(5353, Media::Wired));
    assert!(results.borrow()[0].is_resolved());

    // Nobody answers.
    let (callback, results) = resolution_sink();
    engine.mdns.resolve_host_name("ghost", t0 + 3_000, callback);
    engine.advance(t0, 2_000);
    assert!(results.borrow().is_empty());
    engine.advance(t0 + 2_000, 2_000);
    assert_eq!(results.borrow().len(), 1);
    assert!(!results.borrow()[0].is_resolved());
}

#[test]
fn stop_says_goodbye() {
    let engine = started_engine();
    let (publisher, _) = publisher(Some(printer_publication()));
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        false,
        publisher,
    );
    engine.take_sent();

    engine.mdns.stop();
    assert_eq!(engine.mdns.state(), MdnsState::Stopped);
    assert!(*engine.stopped.borrow());
    let sent = engine.take_sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.answers.iter().all(|r| r.is_goodbye()));

    // Nothing is answered afterwards.
    engine
        .mdns
        .receive_message(query("office.local.", RRType::A), peer(5353, Media::Wired));
    assert!(engine.take_sent().is_empty());
}

#[test]
fn engine_parses_wire_messages() {
    let engine = started_engine();
    let wire = query("office.local.", RRType::ANY).to_data_on_wire();
    let parsed = DnsMessage::from_bytes(&wire[0]).expect("parse");
    engine.mdns.receive_message(parsed, peer(5353, Media::Wired));

    let sent = engine.take_sent();
    assert_eq!(sent.len(), 1);
    let ips: Vec<IpAddr> = sent[0]
        .0
        .answers
        .iter()
        .filter_map(|r| r.ip_address())
        .collect();
    assert_eq!(ips, vec!["192.168.1.2".parse::<IpAddr>().unwrap()]);
}

#[test]
fn unpublish_cancels_probing() {
    let engine = started_engine();
    let (publisher, log) = publisher(Some(printer_publication()));
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        true,
        publisher,
    );
    let t0 = current_time_millis();
    let t = engine.advance(t0, 300);
    let probes = engine.counter("probe");
    assert!(probes >= 1);

    assert!(engine.mdns.unpublish_service_instance(SERVICE, "Office"));
    engine.take_sent();
    engine.advance(t, 10_000);

    // Never announced, so no goodbye either.
    assert!(engine.take_sent().is_empty());
    assert_eq!(engine.counter("probe"), probes);
    assert!(log.borrow().successes.is_empty());
}

#[test]
fn late_reply_after_unpublish_sends_nothing() {
    let engine = started_engine();
    let (publisher, log) = publisher(None);
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        false,
        publisher,
    );
    let responder = log.borrow_mut().pending.remove(0);

    assert!(engine.mdns.unpublish_service_instance(SERVICE, "Office"));
    engine.take_sent();
    responder.respond(Some(printer_publication()));

    let t0 = current_time_millis();
    engine.advance(t0, 10_000);
    assert!(engine.take_sent().is_empty());
    assert!(log.borrow().successes.is_empty());
    assert_eq!(engine.counter("announce"), 0);
}

#[test]
fn late_query_reply_after_goodbye_sends_nothing() {
    let engine = started_engine();
    let (publisher, log) = publisher(None);
    engine.mdns.publish_service_instance(
        SERVICE,
        "Office",
        Media::Both,
        IpVersions::Both,
        false,
        publisher,
    );
    let responder = log.borrow_mut().pending.remove(0);
    responder.respond(Some(printer_publication()));
    let responder = log.borrow_mut().pending.remove(0);
    responder.respond(Some(printer_publication()));
    assert_eq!(engine.counter("announce"), 1);

    // A query the publisher answers in its own time.
    engine
        .mdns
        .receive_message(query(SERVICE_FULL, RRType::PTR), peer(5353, Media::Wired));
    let t0 = current_time_millis();
    engine.advance(t0, 500);
    assert!(log
        .borrow()
        .causes
        .iter()
        .any(|c| *c != PublicationCause::Announcement));

    assert!(engine.mdns.unpublish_service_instance(SERVICE, "Office"));
    assert_eq!(engine.counter("goodbye"), 1);
    engine.take_sent();

    let late: Vec<PublicationResponder> = log.borrow_mut().pending.drain(..).collect();
    assert!(!late.is_empty());
    for responder in late {
        responder.respond(Some(printer_publication()));
    }
    assert!(engine.take_sent().is_empty());
    assert_eq!(engine.counter("respond"), 0);
}

#[test]
fn resubscribe_starts_fresh() {
    let engine = started_engine();
    let (first, _) = subscriber();
    let id = engine.mdns.subscribe_to_service(
        SERVICE,
        Media::Both,
        IpVersions::Both,
        false,
        true,
        first,
    );
    engine
        .mdns
        .receive_message(lab_response("Lab", 631), peer(5353, Media::Wired));
    engine.mdns.unsubscribe(id);
    engine.mdns.unsubscribe(id);
    engine.take_sent();

    let (second, events) = subscriber();
    engine.mdns.subscribe_to_service(
        SERVICE,
        Media::Both,
        IpVersions::Both,
        false,
        true,
        second,
    );

    // A new requestor: a fresh query and no cached instances.
    let sent = engine.take_sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.answers.is_empty());
    assert!(events.borrow().is_empty());
}
