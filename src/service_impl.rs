//! Flow control between the engine and the daemon's clients.
//!
//! The engine calls its subscribers and publishers synchronously. Clients
//! live on other threads behind channels and may be slow or gone. The
//! adapters here bound what a client can have outstanding and tear a
//! binding down when its client misbehaves:
//!
//! - [`SubscriberPipeline`] keeps at most [`MAX_PIPELINE_DEPTH`] events
//!   unacknowledged per subscription and queues the rest in order.
//! - [`PublisherThrottle`] keeps at most [`MAX_OUTSTANDING_REQUESTS`]
//!   publication requests unanswered per publisher.
//! - [`DeferredBindings`] holds requests until the engine is ready.
//! - [`BindingRegistry`] owns what is bound, and removes each entry once.

#[cfg(feature = "logging")]
use crate::log::{debug, trace, warn};
use crate::{
    dns_parser::{RRType, MAX_TXT_STRING_LEN},
    mdns::{HostPublisher, PublicationResponder, Publisher, Subscriber},
    mdns_names::check_subtype_name,
    publication::{Publication, PublicationCause, ServiceInstance, SubscriberEvent},
    service_daemon::{
        AckFn, HostPublisherEvent, PublicationReplier, PublicationRequest, PublisherEvent,
        ReplyFn, SubscriptionEvent,
    },
};
use flume::{Sender, TrySendError};
use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    rc::Rc,
};

/// Events sent to a subscription but not yet acknowledged.
pub(crate) const MAX_PIPELINE_DEPTH: usize = 16;

/// Publication requests sent to a publisher but not yet answered.
pub(crate) const MAX_OUTSTANDING_REQUESTS: usize = 2;

/// Runs once when a client is gone or misbehaved. It must only note the
/// binding for teardown, never tear it down itself.
pub(crate) type Deleter = Box<dyn FnOnce()>;

/// Delivers engine events to one subscription, in order, with bounded
/// outstanding events.
pub(crate) struct SubscriberPipeline {
    subscription_id: u64,
    sender: Sender<SubscriptionEvent>,
    ack: AckFn,
    queue: VecDeque<SubscriberEvent>,

    /// Events sent and not yet acknowledged.
    depth: usize,
    deleter: Option<Deleter>,
}

impl SubscriberPipeline {
    pub(crate) fn new(
        subscription_id: u64,
        sender: Sender<SubscriptionEvent>,
        ack: AckFn,
        deleter: Deleter,
    ) -> Self {
        Self {
            subscription_id,
            sender,
            ack,
            queue: VecDeque::new(),
            depth: 0,
            deleter: Some(deleter),
        }
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    fn is_closed(&self) -> bool {
        self.deleter.is_none()
    }

    fn push(&mut self, event: SubscriberEvent) {
        if self.is_closed() {
            return;
        }
        self.queue.push_back(event);
        self.pump();
    }

    /// One event was acknowledged by the client.
    pub(crate) fn ack(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.pump();
    }

    fn pump(&mut self) {
        while self.depth < MAX_PIPELINE_DEPTH && !self.is_closed() {
            let Some(event) = self.queue.pop_front() else {
                break;
            };
            let event = SubscriptionEvent::new(event, self.subscription_id, self.ack.clone());
            match self.sender.try_send(event) {
                Ok(()) => self.depth += 1,
                Err(TrySendError::Full(event)) => {
                    // Unacked events are still in the channel.
                    self.queue.push_front(event.into_event());
                    break;
                }
                Err(TrySendError::Disconnected(event)) => {
                    // Not delivered, so no ack comes back.
                    event.forget_ack();
                    self.close();
                }
            }
        }
    }

    fn close(&mut self) {
        if let Some(deleter) = self.deleter.take() {
            debug!("subscription {} is closed by the client", self.subscription_id);
            self.queue.clear();
            deleter();
        }
    }
}

/// The [`Subscriber`] handed to the engine.
pub(crate) struct PipelineSubscriber(pub(crate) Rc<RefCell<SubscriberPipeline>>);

impl Subscriber for PipelineSubscriber {
    fn instance_discovered(&mut self, instance: &ServiceInstance) {
        self.0
            .borrow_mut()
            .push(SubscriberEvent::InstanceDiscovered(instance.clone()));
    }

    fn instance_changed(&mut self, instance: &ServiceInstance) {
        self.0
            .borrow_mut()
            .push(SubscriberEvent::InstanceChanged(instance.clone()));
    }

    fn instance_lost(&mut self, service_name: &str, instance_name: &str) {
        self.0.borrow_mut().push(SubscriberEvent::InstanceLost {
            service_name: service_name.to_string(),
            instance_name: instance_name.to_string(),
        });
    }

    fn query(&mut self, qtype: RRType) {
        self.0.borrow_mut().push(SubscriberEvent::Query(qtype));
    }
}

/// A publication request waiting for a free slot.
struct PendingRequest {
    cause: PublicationCause,
    subtype: String,
    source_addresses: Vec<SocketAddr>,
    responder: PublicationResponder,
}

/// Passes the engine's publication requests to one publisher client, at
/// most [`MAX_OUTSTANDING_REQUESTS`] at a time.
pub(crate) struct PublisherThrottle {
    publication_id: u64,
    sender: Sender<PublisherEvent>,
    reply: ReplyFn,
    queue: VecDeque<PendingRequest>,

    /// Responders of requests sent to the client, by request sequence.
    outstanding: HashMap<u64, PublicationResponder>,
    next_seq: u64,
    deleter: Option<Deleter>,
}

impl PublisherThrottle {
    pub(crate) fn new(
        publication_id: u64,
        sender: Sender<PublisherEvent>,
        reply: ReplyFn,
        deleter: Deleter,
    ) -> Self {
        Self {
            publication_id,
            sender,
            reply,
            queue: VecDeque::new(),
            outstanding: HashMap::new(),
            next_seq: 1,
            deleter: Some(deleter),
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.deleter.is_some()
    }

    fn request(&mut self, pending: PendingRequest) {
        if !self.is_valid() {
            return;
        }
        self.queue.push_back(pending);
        self.pump();
    }

    /// Sends queued requests while there are free slots.
    pub(crate) fn pump(&mut self) {
        while self.outstanding.len() < MAX_OUTSTANDING_REQUESTS && self.is_valid() {
            let Some(pending) = self.queue.pop_front() else {
                break;
            };
            let seq = self.next_seq;
            self.next_seq += 1;

            let request = PublicationRequest {
                cause: pending.cause,
                subtype: pending.subtype,
                source_addresses: pending.source_addresses,
                replier: PublicationReplier::new(self.publication_id, seq, self.reply.clone()),
            };
            match self.sender.try_send(PublisherEvent::GetPublication(request)) {
                Ok(()) => {
                    trace!("publication request {} to {}", seq, self.publication_id);
                    self.outstanding.insert(seq, pending.responder);
                }
                Err(TrySendError::Full(event)) => {
                    // The client is behind on reading. Retry on the next reply.
                    if let PublisherEvent::GetPublication(request) = event {
                        let PublicationRequest {
                            cause,
                            subtype,
                            source_addresses,
                            replier,
                        } = request;
                        replier.forget();
                        self.queue.push_front(PendingRequest {
                            cause,
                            subtype,
                            source_addresses,
                            responder: pending.responder,
                        });
                    }
                    break;
                }
                Err(TrySendError::Disconnected(event)) => {
                    if let PublisherEvent::GetPublication(request) = event {
                        request.replier.forget();
                    }
                    debug!("publisher {} is not listening", self.publication_id);
                    self.invalidate();
                }
            }
        }
    }

    /// Takes the responder of request `seq` with the client's answer.
    ///
    /// Returns `None` for unknown requests, and when the answer breaks the
    /// rules, in which case the publisher is torn down.
    pub(crate) fn take_reply(
        &mut self,
        seq: u64,
        publication: Option<Publication>,
    ) -> Option<(PublicationResponder, Option<Publication>)> {
        let responder = self.outstanding.remove(&seq)?;
        if let Some(p) = publication.as_ref() {
            if !p.has_valid_ttls() {
                warn!(
                    "publisher {} replied with a TTL below one second",
                    self.publication_id
                );
                self.invalidate();
                return None;
            }
            if !p.has_valid_text() {
                warn!(
                    "publisher {} replied with a text entry over {} bytes",
                    self.publication_id, MAX_TXT_STRING_LEN
                );
                self.invalidate();
                return None;
            }
        }
        Some((responder, publication))
    }

    /// Checks subtypes the client wants to publish. Bad ones end the
    /// publisher.
    pub(crate) fn check_subtypes(&mut self, subtypes: &[String]) -> bool {
        if let Some(bad) = subtypes.iter().find(|s| check_subtype_name(s).is_err()) {
            warn!("publisher {} set invalid subtype {}", self.publication_id, bad);
            self.invalidate();
            return false;
        }
        self.is_valid()
    }

    pub(crate) fn report_success(&mut self, success: bool) {
        if !self.is_valid() {
            return;
        }
        if let Err(TrySendError::Disconnected(_)) =
            self.sender.try_send(PublisherEvent::ReportSuccess(success))
        {
            self.invalidate();
        }
    }

    /// Stops using this publisher. Pending responders are dropped unanswered.
    fn invalidate(&mut self) {
        if let Some(deleter) = self.deleter.take() {
            self.queue.clear();
            self.outstanding.clear();
            deleter();
        }
    }
}

/// The [`Publisher`] handed to the engine.
pub(crate) struct ThrottledPublisher(pub(crate) Rc<RefCell<PublisherThrottle>>);

impl Publisher for ThrottledPublisher {
    fn report_success(&mut self, success: bool) {
        self.0.borrow_mut().report_success(success);
    }

    fn get_publication(
        &mut self,
        cause: PublicationCause,
        subtype: &str,
        source_addresses: &[SocketAddr],
        responder: PublicationResponder,
    ) {
        self.0.borrow_mut().request(PendingRequest {
            cause,
            subtype: subtype.to_string(),
            source_addresses: source_addresses.to_vec(),
            responder,
        });
    }
}

/// The [`HostPublisher`] handed to the engine.
pub(crate) struct ChannelHostPublisher {
    pub(crate) sender: Sender<HostPublisherEvent>,
}

impl HostPublisher for ChannelHostPublisher {
    fn report_success(&mut self, success: bool) {
        if let Err(e) = self
            .sender
            .try_send(HostPublisherEvent::ReportSuccess(success))
        {
            debug!("host publisher is not listening: {}", e);
        }
    }
}

/// Holds bind requests until the engine is ready, then hands them out in
/// arrival order.
pub(crate) struct DeferredBindings<T> {
    ready: bool,
    pending: VecDeque<T>,
}

impl<T> DeferredBindings<T> {
    pub(crate) fn new() -> Self {
        Self {
            ready: false,
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready
    }

    /// Returns the request back if it can be serviced now.
    pub(crate) fn submit(&mut self, request: T) -> Option<T> {
        if self.ready {
            return Some(request);
        }
        self.pending.push_back(request);
        None
    }

    /// Marks readiness and returns the buffered requests.
    pub(crate) fn set_ready(&mut self) -> Vec<T> {
        self.ready = true;
        self.pending.drain(..).collect()
    }
}

/// Live bindings keyed by their id. Ids come from a monotonically
/// increasing counter and each binding is removed exactly once.
pub(crate) struct BindingRegistry<T> {
    bindings: HashMap<u64, T>,
}

impl<T> BindingRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    /// Returns false if `id` is already bound.
    pub(crate) fn insert(&mut self, id: u64, binding: T) -> bool {
        if self.bindings.contains_key(&id) {
            debug!("binding id {} is taken", id);
            return false;
        }
        self.bindings.insert(id, binding);
        true
    }

    pub(crate) fn get(&self, id: u64) -> Option<&T> {
        self.bindings.get(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.bindings.len()
    }

    pub(crate) fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.bindings.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Detaches the binding first, then runs `teardown` on it. A second
    /// call for the same id does nothing.
    pub(crate) fn teardown(&mut self, id: u64, teardown: impl FnOnce(T)) -> bool {
        match self.bindings.remove(&id) {
            Some(binding) => {
                teardown(binding);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flume::{bounded, unbounded};
    use std::{cell::Cell, sync::Arc, time::Duration};
    use test_log::test;

    fn lost(n: usize) -> SubscriberEvent {
        SubscriberEvent::InstanceLost {
            service_name: "_ipp._tcp.".to_string(),
            instance_name: format!("printer {}", n),
        }
    }

    fn pipeline(
        sender: Sender<SubscriptionEvent>,
    ) -> (SubscriberPipeline, flume::Receiver<u64>, Rc<Cell<bool>>) {
        let (ack_s, ack_r) = unbounded();
        let ack: AckFn = Arc::new(move |id| {
            let _ = ack_s.send(id);
        });
        let deleted = Rc::new(Cell::new(false));
        let flag = deleted.clone();
        let pipeline = SubscriberPipeline::new(7, sender, ack, Box::new(move || flag.set(true)));
        (pipeline, ack_r, deleted)
    }

    fn throttle(
        deleted: Rc<Cell<bool>>,
    ) -> (
        Rc<RefCell<PublisherThrottle>>,
        flume::Receiver<PublisherEvent>,
    ) {
        let (sender, receiver) = unbounded();
        let reply: ReplyFn = Arc::new(|_, _, _| {});
        let throttle =
            PublisherThrottle::new(1, sender, reply, Box::new(move || deleted.set(true)));
        (Rc::new(RefCell::new(throttle)), receiver)
    }

    fn requests(receiver: &flume::Receiver<PublisherEvent>) -> Vec<PublicationRequest> {
        receiver
            .drain()
            .filter_map(|event| match event {
                PublisherEvent::GetPublication(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_pipeline_bound() {
        let (sender, receiver) = bounded(MAX_PIPELINE_DEPTH);
        let (mut pipeline, acks, _) = pipeline(sender);

        for n in 0..20 {
            pipeline.push(lost(n));
        }
        assert_eq!(pipeline.depth(), MAX_PIPELINE_DEPTH);
        assert_eq!(pipeline.queued(), 4);
        assert_eq!(receiver.len(), MAX_PIPELINE_DEPTH);

        // Dropping a received event acknowledges it.
        let first = receiver.recv().unwrap();
        assert_eq!(first.event(), &lost(0));
        drop(first);
        assert_eq!(acks.recv().unwrap(), 7);
        pipeline.ack();
        assert_eq!(pipeline.depth(), MAX_PIPELINE_DEPTH);
        assert_eq!(pipeline.queued(), 3);

        // Order is kept.
        for n in 1..=MAX_PIPELINE_DEPTH {
            let event = receiver.recv().unwrap();
            assert_eq!(event.event(), &lost(n));
        }
    }

    #[test]
    fn test_pipeline_closed_by_client() {
        let (sender, receiver) = bounded(MAX_PIPELINE_DEPTH);
        let (mut pipeline, _acks, deleted) = pipeline(sender);
        drop(receiver);

        pipeline.push(lost(0));
        assert!(deleted.get());
        assert_eq!(pipeline.depth(), 0);

        // Nothing more is queued once closed.
        pipeline.push(lost(1));
        assert_eq!(pipeline.queued(), 0);
    }

    #[test]
    fn test_publisher_concurrency_bound() {
        let (throttle, receiver) = throttle(Rc::new(Cell::new(false)));
        let mut publisher = ThrottledPublisher(throttle.clone());

        for _ in 0..3 {
            publisher.get_publication(
                PublicationCause::Announcement,
                "",
                &[],
                PublicationResponder::detached(1),
            );
        }
        assert_eq!(throttle.borrow().outstanding(), MAX_OUTSTANDING_REQUESTS);
        assert_eq!(throttle.borrow().queued(), 1);
        let first = requests(&receiver);
        assert_eq!(first.len(), MAX_OUTSTANDING_REQUESTS);

        // Answering the oldest request lets the third one through.
        let reply = throttle
            .borrow_mut()
            .take_reply(first[0].replier.seq, Some(Publication::new(631, Vec::new())));
        let (responder, publication) = reply.unwrap();
        responder.respond(publication);
        throttle.borrow_mut().pump();

        assert_eq!(throttle.borrow().outstanding(), MAX_OUTSTANDING_REQUESTS);
        assert_eq!(throttle.borrow().queued(), 0);
        let third = requests(&receiver);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].replier.seq, 3);

        // A reply to an unknown request is ignored.
        assert!(throttle.borrow_mut().take_reply(42, None).is_none());
    }

    #[test]
    fn test_short_ttl_invalidates_publisher() {
        let deleted = Rc::new(Cell::new(false));
        let (throttle, receiver) = throttle(deleted.clone());
        let mut publisher = ThrottledPublisher(throttle.clone());
        publisher.get_publication(
            PublicationCause::QueryMulticastResponse,
            "",
            &[],
            PublicationResponder::detached(1),
        );
        let seq = requests(&receiver)[0].replier.seq;

        let mut publication = Publication::new(631, Vec::new());
        publication.srv_ttl = Duration::from_millis(500);
        assert!(throttle.borrow_mut().take_reply(seq, Some(publication)).is_none());
        assert!(deleted.get());

        // No more requests reach the client.
        publisher.get_publication(
            PublicationCause::Announcement,
            "",
            &[],
            PublicationResponder::detached(1),
        );
        assert!(requests(&receiver).is_empty());
    }

    #[test]
    fn test_oversized_text_invalidates_publisher() {
        let deleted = Rc::new(Cell::new(false));
        let (throttle, receiver) = throttle(deleted.clone());
        let mut publisher = ThrottledPublisher(throttle.clone());
        publisher.get_publication(
            PublicationCause::Announcement,
            "",
            &[],
            PublicationResponder::detached(1),
        );
        let seq = requests(&receiver)[0].replier.seq;

        let text = vec!["a".repeat(MAX_TXT_STRING_LEN + 1)];
        let publication = Publication::new(631, text);
        assert!(throttle.borrow_mut().take_reply(seq, Some(publication)).is_none());
        assert!(deleted.get());
        assert!(!throttle.borrow().is_valid());
    }

    #[test]
    fn test_invalid_subtype_invalidates_publisher() {
        let deleted = Rc::new(Cell::new(false));
        let (throttle, _receiver) = throttle(deleted.clone());

        assert!(throttle.borrow_mut().check_subtypes(&["_color".to_string()]));
        assert!(!deleted.get());

        assert!(!throttle
            .borrow_mut()
            .check_subtypes(&["no-underscore".to_string()]));
        assert!(deleted.get());
        assert!(!throttle.borrow().is_valid());
    }

    #[test]
    fn test_deferred_bindings() {
        let mut deferred = DeferredBindings::new();
        assert!(deferred.submit(1).is_none());
        assert!(deferred.submit(2).is_none());
        assert!(!deferred.is_ready());

        assert_eq!(deferred.set_ready(), vec![1, 2]);
        assert_eq!(deferred.submit(3), Some(3));
    }

    #[test]
    fn test_binding_registry() {
        let mut registry = BindingRegistry::new();
        assert!(registry.insert(1, "a"));
        assert!(registry.insert(5, "b"));
        assert!(!registry.insert(5, "c"));
        assert_eq!(registry.ids(), vec![1, 5]);

        let mut torn_down = Vec::new();
        assert!(registry.teardown(1, |b| torn_down.push(b)));
        assert!(!registry.teardown(1, |b| torn_down.push(b)));
        assert_eq!(torn_down, vec!["a"]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(5), Some(&"b"));
    }
}
