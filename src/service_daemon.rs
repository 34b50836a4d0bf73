//! Service daemon for mDNS
//!
//! [`ServiceDaemon`] runs an [`Mdns`] engine with a [`MdnsTransceiver`] on a
//! thread of its own. Clients talk to it through `flume` channels: commands
//! go in with `try_send`, events and replies come back on per-request
//! receivers. A loopback UDP "signal" socket wakes the daemon's `mio` poll
//! whenever a command is sent.
//!
//! Subscription events are acknowledged by dropping them, and a daemon keeps
//! at most 16 of them unacknowledged per subscription. Publication requests
//! are answered through [`PublicationReplier`], and at most two are
//! unanswered per publication.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    config::MdnsConfig,
    current_time_millis,
    error::{e_fmt, Error, Result},
    mdns::{Mdns, Metrics, SubscriberId},
    mdns_names::{
        check_host_name, check_instance_name, check_service_name, check_subtype_name,
        local_instance_full_name,
    },
    publication::{HostResolution, Publication, PublicationCause, SubscriberEvent},
    reply_address::{IpVersions, Media},
    service_impl::{
        BindingRegistry, ChannelHostPublisher, DeferredBindings, PipelineSubscriber,
        PublisherThrottle, SubscriberPipeline, ThrottledPublisher, MAX_PIPELINE_DEPTH,
    },
    transceiver::MdnsTransceiver,
};
use flume::{bounded, Receiver, Sender, TrySendError};
use mio::{net::UdpSocket as MioUdpSocket, Poll};
use std::{
    cell::{Cell, RefCell},
    fmt,
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    rc::Rc,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

const LOOPBACK_V4: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

const SIGNAL_SOCK_EVENT_KEY: usize = usize::MAX - 1; // avoid to overlap with interface tokens

/// Capacity of a publisher's event channel.
const PUBLISHER_CHANNEL_SIZE: usize = 16;

/// Acknowledges one subscription event, by subscription id.
pub(crate) type AckFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Carries a publisher's answer: (publication id, request sequence, answer).
pub(crate) type ReplyFn = Arc<dyn Fn(u64, u64, Option<Publication>) + Send + Sync>;

/// Status code for the service daemon.
#[derive(Debug, PartialEq, Clone, Eq)]
#[non_exhaustive]
pub enum DaemonStatus {
    /// The daemon is running as normal.
    Running,

    /// The daemon has been shutdown.
    Shutdown,
}

/// One event of a subscription.
///
/// Dropping the event acknowledges it to the daemon, which then may send
/// the next one.
pub struct SubscriptionEvent {
    event: SubscriberEvent,
    subscription_id: u64,
    ack: Option<AckFn>,
}

impl SubscriptionEvent {
    pub(crate) fn new(event: SubscriberEvent, subscription_id: u64, ack: AckFn) -> Self {
        Self {
            event,
            subscription_id,
            ack: Some(ack),
        }
    }

    pub fn event(&self) -> &SubscriberEvent {
        &self.event
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription_id
    }

    /// Takes the event back without acknowledging it.
    pub(crate) fn into_event(mut self) -> SubscriberEvent {
        self.ack = None;
        self.event.clone()
    }

    /// Drops the event without acknowledging it.
    pub(crate) fn forget_ack(mut self) {
        self.ack = None;
    }
}

impl Drop for SubscriptionEvent {
    fn drop(&mut self) {
        if let Some(ack) = self.ack.take() {
            ack(self.subscription_id);
        }
    }
}

impl fmt::Debug for SubscriptionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEvent")
            .field("event", &self.event)
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

/// Answers one [`PublicationRequest`]. Dropping it unanswered is the same
/// as replying `None`.
pub struct PublicationReplier {
    publication_id: u64,
    pub(crate) seq: u64,
    reply: Option<ReplyFn>,
}

impl PublicationReplier {
    pub(crate) fn new(publication_id: u64, seq: u64, reply: ReplyFn) -> Self {
        Self {
            publication_id,
            seq,
            reply: Some(reply),
        }
    }

    /// Sends the publication for the request. `None` means there is nothing
    /// to publish for it.
    pub fn reply(mut self, publication: Option<Publication>) {
        if let Some(reply) = self.reply.take() {
            reply(self.publication_id, self.seq, publication);
        }
    }

    pub(crate) fn forget(mut self) {
        self.reply = None;
    }
}

impl Drop for PublicationReplier {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            reply(self.publication_id, self.seq, None);
        }
    }
}

impl fmt::Debug for PublicationReplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicationReplier")
            .field("publication_id", &self.publication_id)
            .field("seq", &self.seq)
            .finish()
    }
}

/// The daemon asks a publisher for its publication.
#[derive(Debug)]
pub struct PublicationRequest {
    pub cause: PublicationCause,

    /// Non-empty when a query asked for one subtype.
    pub subtype: String,

    /// Senders of the query being answered, if any.
    pub source_addresses: Vec<SocketAddr>,
    pub replier: PublicationReplier,
}

/// Events sent to a publisher client.
#[derive(Debug)]
#[non_exhaustive]
pub enum PublisherEvent {
    /// The outcome of probing. `false` means the name is taken.
    ReportSuccess(bool),
    GetPublication(PublicationRequest),

    /// The publication was not accepted, e.g. [`Error::AlreadyPublished`].
    Rejected(Error),
}

/// Events sent to a host publisher client.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HostPublisherEvent {
    ReportSuccess(bool),
    Rejected(Error),
}

/// Options of [`ServiceDaemon::subscribe_to_service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub media: Media,
    pub ip_versions: IpVersions,

    /// Report instances before their SRV and addresses are known.
    pub include_unknown_resources: bool,

    /// Query right away instead of after the first interval.
    pub send_initial_query: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            media: Media::Both,
            ip_versions: IpVersions::Both,
            include_unknown_resources: false,
            send_initial_query: true,
        }
    }
}

/// Options of [`ServiceDaemon::publish_service_instance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicationOptions {
    pub media: Media,
    pub ip_versions: IpVersions,
    pub perform_probe: bool,
}

impl Default for PublicationOptions {
    fn default() -> Self {
        Self {
            media: Media::Both,
            ip_versions: IpVersions::Both,
            perform_probe: true,
        }
    }
}

/// Options of [`ServiceDaemon::publish_host`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPublishOptions {
    pub media: Media,
    pub ip_versions: IpVersions,
    pub perform_probe: bool,
}

impl Default for HostPublishOptions {
    fn default() -> Self {
        Self {
            media: Media::Both,
            ip_versions: IpVersions::Both,
            perform_probe: true,
        }
    }
}

/// A live subscription.
#[derive(Debug)]
pub struct ServiceSubscription {
    /// Pass to [`ServiceDaemon::unsubscribe`].
    pub id: u64,
    pub receiver: Receiver<SubscriptionEvent>,
}

/// A live publication.
pub struct ServicePublication {
    pub id: u64,
    pub receiver: Receiver<PublisherEvent>,
    daemon: ServiceDaemon,
}

impl ServicePublication {
    /// Replaces the subtypes of this publication. An invalid subtype ends
    /// the publication.
    pub fn set_subtypes(&self, subtypes: Vec<String>) -> Result<()> {
        self.daemon
            .send_cmd(Command::PublisherSubtypes(self.id, subtypes))
    }
}

impl fmt::Debug for ServicePublication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicePublication")
            .field("id", &self.id)
            .finish()
    }
}

/// A daemon thread for mDNS
///
/// This struct provides a handle and an API to the daemon. It is cloneable.
#[derive(Clone)]
pub struct ServiceDaemon {
    /// Sender handle of the channel to the daemon.
    sender: Sender<Command>,

    /// Send to this addr to signal that a `Command` is coming.
    ///
    /// The daemon listens on this addr together with other mDNS sockets,
    /// to avoid busy polling the flume channel.
    signal_addr: SocketAddr,

    /// Ids of subscriptions and publications.
    next_id: Arc<AtomicU64>,
}

impl ServiceDaemon {
    /// Creates a new daemon and spawns a thread to run the daemon.
    ///
    /// The daemon (re)uses the default mDNS port 5353.
    pub fn new(config: MdnsConfig) -> Result<Self> {
        check_host_name(&config.host_name)?;

        // Use port 0 to allow the system assign a random available port,
        // no need for a pre-defined port number.
        let signal_addr = SocketAddrV4::new(LOOPBACK_V4, 0);

        let signal_sock = UdpSocket::bind(signal_addr)
            .map_err(|e| e_fmt!("failed to create signal_sock for daemon: {}", e))?;

        // Get the socket with the OS chosen port
        let signal_addr = signal_sock
            .local_addr()
            .map_err(|e| e_fmt!("failed to get signal sock addr: {}", e))?;

        // Must be nonblocking so we can listen to it together with mDNS sockets.
        signal_sock
            .set_nonblocking(true)
            .map_err(|e| e_fmt!("failed to set nonblocking for signal socket: {}", e))?;

        let poller = Poll::new().map_err(|e| e_fmt!("failed to create mio Poll: {e}"))?;

        let (sender, receiver) = bounded(100);

        let daemon = Self {
            sender,
            signal_addr,
            next_id: Arc::new(AtomicU64::new(1)),
        };

        // Spawn the daemon thread
        let mio_sock = MioUdpSocket::from_std(signal_sock);
        let handle = daemon.clone();
        thread::Builder::new()
            .name("mDNS_daemon".to_string())
            .spawn(move || Self::daemon_thread(mio_sock, poller, receiver, config, handle))
            .map_err(|e| e_fmt!("thread builder failed to spawn: {}", e))?;

        Ok(daemon)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends `cmd` to the daemon via its channel, and sends a signal
    /// to its sock addr to notify.
    fn send_cmd(&self, cmd: Command) -> Result<()> {
        let cmd_name = cmd.to_string();

        // First, send to the flume channel.
        self.sender.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => Error::Again,
            e => e_fmt!("flume::channel::send failed: {}", e),
        })?;

        // Second, send a signal to notify the daemon.
        let addr = SocketAddrV4::new(LOOPBACK_V4, 0);
        let socket = UdpSocket::bind(addr)
            .map_err(|e| e_fmt!("Failed to create socket to send signal: {}", e))?;
        socket
            .send_to(cmd_name.as_bytes(), self.signal_addr)
            .map_err(|e| {
                e_fmt!(
                    "signal socket send_to {} ({}) failed: {}",
                    self.signal_addr,
                    cmd_name,
                    e
                )
            })?;

        Ok(())
    }

    fn ack_fn(&self) -> AckFn {
        let daemon = self.clone();
        Arc::new(move |subscription_id| {
            if let Err(e) = daemon.send_cmd(Command::SubscriberAck(subscription_id)) {
                debug!("failed to ack subscription {}: {}", subscription_id, e);
            }
        })
    }

    fn reply_fn(&self) -> ReplyFn {
        let daemon = self.clone();
        Arc::new(move |publication_id, seq, publication| {
            let cmd = Command::PublicationReply {
                publication_id,
                seq,
                publication,
            };
            if let Err(e) = daemon.send_cmd(cmd) {
                debug!("failed to send publication reply {}: {}", publication_id, e);
            }
        })
    }

    /// Subscribes to instances of `service_name`, e.g. `_printer._tcp.`.
    ///
    /// Events arrive on the returned receiver. The caller can call
    /// `.recv_async().await` on it in an async environment or `.recv()` in
    /// a sync environment.
    pub fn subscribe_to_service(
        &self,
        service_name: &str,
        options: SubscriptionOptions,
    ) -> Result<ServiceSubscription> {
        check_service_name(service_name)?;

        let id = self.next_id();
        let (sender, receiver) = bounded(MAX_PIPELINE_DEPTH);
        self.send_cmd(Command::Subscribe {
            id,
            service_name: service_name.to_string(),
            options,
            sender,
        })?;
        Ok(ServiceSubscription { id, receiver })
    }

    /// Ends a subscription.
    ///
    /// When an error is returned, the caller should retry only when
    /// the error is `Error::Again`, otherwise should log and move on.
    pub fn unsubscribe(&self, id: u64) -> Result<()> {
        self.send_cmd(Command::Unsubscribe(id))
    }

    /// Publishes a service instance. The daemon asks for its records on
    /// the returned publication's receiver.
    pub fn publish_service_instance(
        &self,
        service_name: &str,
        instance_name: &str,
        options: PublicationOptions,
    ) -> Result<ServicePublication> {
        check_service_name(service_name)?;
        check_instance_name(instance_name)?;

        let id = self.next_id();
        let (sender, receiver) = bounded(PUBLISHER_CHANNEL_SIZE);
        self.send_cmd(Command::Publish {
            id,
            service_name: service_name.to_string(),
            instance_name: instance_name.to_string(),
            options,
            sender,
        })?;
        Ok(ServicePublication {
            id,
            receiver,
            daemon: self.clone(),
        })
    }

    /// Withdraws a publication, with a goodbye if it was announced.
    pub fn unpublish_service_instance(
        &self,
        service_name: &str,
        instance_name: &str,
    ) -> Result<()> {
        check_service_name(service_name)?;
        check_instance_name(instance_name)?;
        self.send_cmd(Command::Unpublish(
            service_name.to_string(),
            instance_name.to_string(),
        ))
    }

    /// Replaces the subtypes of a publication and announces it again.
    pub fn set_subtypes(
        &self,
        service_name: &str,
        instance_name: &str,
        subtypes: Vec<String>,
    ) -> Result<()> {
        check_service_name(service_name)?;
        check_instance_name(instance_name)?;
        for subtype in subtypes.iter() {
            check_subtype_name(subtype)?;
        }
        self.send_cmd(Command::SetSubtypes {
            service_name: service_name.to_string(),
            instance_name: instance_name.to_string(),
            subtypes,
        })
    }

    /// Announces a publication again.
    pub fn reannounce(&self, service_name: &str, instance_name: &str) -> Result<()> {
        check_service_name(service_name)?;
        check_instance_name(instance_name)?;
        self.send_cmd(Command::Reannounce(
            service_name.to_string(),
            instance_name.to_string(),
        ))
    }

    /// Answers address queries for `host_name` on behalf of another host.
    pub fn publish_host(
        &self,
        host_name: &str,
        addresses: Vec<IpAddr>,
        options: HostPublishOptions,
    ) -> Result<Receiver<HostPublisherEvent>> {
        check_host_name(host_name)?;

        let id = self.next_id();
        let (sender, receiver) = bounded(4);
        self.send_cmd(Command::PublishHost {
            id,
            host_name: host_name.to_string(),
            addresses,
            options,
            sender,
        })?;
        Ok(receiver)
    }

    pub fn unpublish_host(&self, host_name: &str) -> Result<()> {
        check_host_name(host_name)?;
        self.send_cmd(Command::UnpublishHost(host_name.to_string()))
    }

    /// Resolves `host_name` to addresses. Exactly one [`HostResolution`]
    /// arrives, at the latest after `timeout`.
    pub fn resolve_host_name(
        &self,
        host_name: &str,
        timeout: Duration,
    ) -> Result<Receiver<HostResolution>> {
        check_host_name(host_name)?;
        let (sender, receiver) = bounded(1);
        self.send_cmd(Command::ResolveHostName {
            host_name: host_name.to_string(),
            timeout,
            sender,
        })?;
        Ok(receiver)
    }

    /// Shuts down the daemon thread and returns a channel to receive the status.
    ///
    /// When an error is returned, the caller should retry only when
    /// the error is `Error::Again`, otherwise should log and move on.
    pub fn shutdown(&self) -> Result<Receiver<DaemonStatus>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Exit(resp_s))?;
        Ok(resp_r)
    }

    /// Returns the status of the daemon.
    ///
    /// When an error is returned, the caller should retry only when
    /// the error is `Error::Again`, otherwise should consider the daemon
    /// stopped working and move on.
    pub fn status(&self) -> Result<Receiver<DaemonStatus>> {
        let (resp_s, resp_r) = bounded(1);

        if self.sender.is_disconnected() {
            resp_s
                .send(DaemonStatus::Shutdown)
                .map_err(|e| e_fmt!("failed to send daemon status to the client: {}", e))?;
        } else {
            self.send_cmd(Command::GetStatus(resp_s))?;
        }

        Ok(resp_r)
    }

    /// Returns a channel receiver for the metrics, e.g. input/output counters.
    ///
    /// The metrics returned is a snapshot. Hence the caller should call
    /// this method repeatedly if they want to monitor the metrics continuously.
    pub fn get_metrics(&self) -> Result<Receiver<Metrics>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::GetMetrics(resp_s))?;
        Ok(resp_r)
    }

    fn daemon_thread(
        signal_sock: MioUdpSocket,
        poller: Poll,
        receiver: Receiver<Command>,
        config: MdnsConfig,
        handle: ServiceDaemon,
    ) {
        let Some(reactor) = Reactor::new(signal_sock, poller, config, handle) else {
            return;
        };

        if let Some(cmd) = reactor.run(receiver) {
            match cmd {
                Command::Exit(resp_s) => {
                    if let Err(e) = resp_s.send(DaemonStatus::Shutdown) {
                        debug!("exit: failed to send response of shutdown: {}", e);
                    }
                }
                _ => {
                    debug!("Unexpected command: {}", cmd);
                }
            }
        }
    }
}

/// Commands supported by the daemon
enum Command {
    Subscribe {
        id: u64,
        service_name: String,
        options: SubscriptionOptions,
        sender: Sender<SubscriptionEvent>,
    },

    Unsubscribe(u64),

    /// A subscription event was dropped by the client.
    SubscriberAck(u64),

    Publish {
        id: u64,
        service_name: String,
        instance_name: String,
        options: PublicationOptions,
        sender: Sender<PublisherEvent>,
    },

    Unpublish(String, String), // (service_name, instance_name)

    PublicationReply {
        publication_id: u64,
        seq: u64,
        publication: Option<Publication>,
    },

    SetSubtypes {
        service_name: String,
        instance_name: String,
        subtypes: Vec<String>,
    },

    /// Subtypes set through a publication handle, checked by the daemon.
    PublisherSubtypes(u64, Vec<String>),

    Reannounce(String, String), // (service_name, instance_name)

    PublishHost {
        id: u64,
        host_name: String,
        addresses: Vec<IpAddr>,
        options: HostPublishOptions,
        sender: Sender<HostPublisherEvent>,
    },

    UnpublishHost(String),

    ResolveHostName {
        host_name: String,
        timeout: Duration,
        sender: Sender<HostResolution>,
    },

    /// Read the current values of the counters
    GetMetrics(Sender<Metrics>),

    /// Get the current status of the daemon.
    GetStatus(Sender<DaemonStatus>),

    Exit(Sender<DaemonStatus>),
}

impl Command {
    /// Commands that only make sense once the engine is ready.
    fn needs_engine(&self) -> bool {
        !matches!(
            self,
            Self::GetMetrics(_) | Self::GetStatus(_) | Self::Exit(_)
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe { .. } => write!(f, "Command Subscribe"),
            Self::Unsubscribe(_) => write!(f, "Command Unsubscribe"),
            Self::SubscriberAck(_) => write!(f, "Command SubscriberAck"),
            Self::Publish { .. } => write!(f, "Command Publish"),
            Self::Unpublish(_, _) => write!(f, "Command Unpublish"),
            Self::PublicationReply { .. } => write!(f, "Command PublicationReply"),
            Self::SetSubtypes { .. } => write!(f, "Command SetSubtypes"),
            Self::PublisherSubtypes(_, _) => write!(f, "Command PublisherSubtypes"),
            Self::Reannounce(_, _) => write!(f, "Command Reannounce"),
            Self::PublishHost { .. } => write!(f, "Command PublishHost"),
            Self::UnpublishHost(_) => write!(f, "Command UnpublishHost"),
            Self::ResolveHostName { .. } => write!(f, "Command ResolveHostName"),
            Self::GetMetrics(_) => write!(f, "Command GetMetrics"),
            Self::GetStatus(_) => write!(f, "Command GetStatus"),
            Self::Exit(_) => write!(f, "Command Exit"),
        }
    }
}

/// What the daemon keeps for each client binding.
enum Binding {
    Subscription {
        subscriber_id: SubscriberId,
        pipeline: Rc<RefCell<SubscriberPipeline>>,
    },
    Publication {
        service_name: String,
        instance_name: String,
        throttle: Rc<RefCell<PublisherThrottle>>,
    },
    Host {
        host_name: String,
    },
}

impl Binding {
    fn teardown(self, mdns: &Mdns) {
        match self {
            Binding::Subscription { subscriber_id, .. } => mdns.unsubscribe(subscriber_id),
            Binding::Publication {
                service_name,
                instance_name,
                ..
            } => {
                mdns.unpublish_service_instance(&service_name, &instance_name);
            }
            Binding::Host { host_name } => {
                mdns.unpublish_host(&host_name);
            }
        }
    }

    fn is_publication(&self, service: &str, instance: &str) -> bool {
        match self {
            Binding::Publication {
                service_name,
                instance_name,
                ..
            } => {
                local_instance_full_name(instance_name, service_name)
                    .eq_ignore_ascii_case(&local_instance_full_name(instance, service))
            }
            _ => false,
        }
    }

    fn is_host(&self, name: &str) -> bool {
        matches!(self, Binding::Host { host_name } if host_name.eq_ignore_ascii_case(name))
    }
}

/// The state of the daemon thread.
struct Reactor {
    poller: Poll,
    signal_sock: MioUdpSocket,
    transceiver: Rc<RefCell<MdnsTransceiver>>,
    dispatcher: Dispatcher,
    ip_check_interval: Duration,
}

/// Runs client commands on the engine and owns their bindings.
struct Dispatcher {
    mdns: Mdns,

    /// A handle to ourselves, for acks and publication replies.
    handle: ServiceDaemon,
    bindings: BindingRegistry<Binding>,
    deferred: DeferredBindings<Command>,

    /// Set by the engine's ready callback.
    ready: Rc<Cell<bool>>,

    /// Bindings whose clients are gone or misbehaved.
    closed: Rc<RefCell<Vec<u64>>>,
    status: DaemonStatus,
}

impl Reactor {
    fn new(
        signal_sock: MioUdpSocket,
        poller: Poll,
        config: MdnsConfig,
        handle: ServiceDaemon,
    ) -> Option<Self> {
        let registry = match poller.registry().try_clone() {
            Ok(registry) => registry,
            Err(e) => {
                debug!("failed to clone the poll registry: {}", e);
                return None;
            }
        };

        let host_name = config.host_name.clone();
        let perform_address_probe = config.perform_address_probe;
        let alt_services = config.alt_services.clone();
        let ip_check_interval = config.ip_check_interval;

        let transceiver = Rc::new(RefCell::new(MdnsTransceiver::new(config, registry)));
        let mdns = Mdns::new(Box::new(transceiver.clone()));

        let ready = Rc::new(Cell::new(false));
        let ready_flag = ready.clone();
        if let Err(e) = mdns.start(
            &host_name,
            perform_address_probe,
            Box::new(move || ready_flag.set(true)),
            alt_services,
        ) {
            debug!("failed to start mDNS: {}", e);
            return None;
        }

        Some(Self {
            poller,
            signal_sock,
            transceiver,
            dispatcher: Dispatcher::new(mdns, handle, ready),
            ip_check_interval,
        })
    }

    /// The main event loop of the daemon thread
    ///
    /// In each round, it will:
    /// 1. select the listening sockets with a timeout.
    /// 2. process the incoming packets if any.
    /// 3. try_recv on its channel and execute commands.
    /// 4. run the engine's due timers.
    /// 5. check IP changes when due.
    fn run(mut self, receiver: Receiver<Command>) -> Option<Command> {
        // Add the daemon's signal socket to the poller.
        if let Err(e) = self.poller.registry().register(
            &mut self.signal_sock,
            mio::Token(SIGNAL_SOCK_EVENT_KEY),
            mio::Interest::READABLE,
        ) {
            debug!("failed to add signal socket to the poller: {}", e);
            return None;
        }

        let ip_check_millis = self.ip_check_interval.as_millis() as u64;
        let mut next_ip_check = current_time_millis() + ip_check_millis;

        let mut events = mio::Events::with_capacity(1024);
        loop {
            let now = current_time_millis();
            let next_timer = self
                .dispatcher
                .mdns
                .next_timeout()
                .map_or(next_ip_check, |t| t.min(next_ip_check));

            // If `next_timer` already passed, set `timeout` to be 1ms.
            let timeout = Duration::from_millis(next_timer.saturating_sub(now).max(1));

            // Process incoming packets, command events and optional timeout.
            events.clear();
            match self.poller.poll(&mut events, Some(timeout)) {
                Ok(_) => self.handle_poller_events(&events),
                Err(e) => debug!("failed to select from sockets: {}", e),
            }

            // process commands from the command channel
            while let Ok(command) = receiver.try_recv() {
                if matches!(command, Command::Exit(_)) {
                    self.dispatcher.mdns.stop();
                    self.dispatcher.status = DaemonStatus::Shutdown;
                    return Some(command);
                }
                self.dispatcher.submit(command);
            }

            let now = current_time_millis();
            self.dispatcher.mdns.handle_timeout(now);

            if now >= next_ip_check {
                next_ip_check = now + ip_check_millis;
                let changed = self.transceiver.borrow_mut().check_ip_changes();
                if changed {
                    debug!("interfaces changed");
                    self.dispatcher.mdns.link_change();
                }
            }

            self.dispatcher.flush_deferred();
            self.dispatcher.teardown_closed();
        }
    }

    fn handle_poller_events(&mut self, events: &mio::Events) {
        for ev in events.iter() {
            trace!("event received with key {:?}", ev.token());
            if ev.token().0 == SIGNAL_SOCK_EVENT_KEY {
                // Drain signals as we will drain commands as well.
                self.signal_sock_drain();

                if let Err(e) = self.poller.registry().reregister(
                    &mut self.signal_sock,
                    ev.token(),
                    mio::Interest::READABLE,
                ) {
                    debug!("failed to modify poller for signal socket: {}", e);
                }
                continue; // Next event.
            }

            // The transceiver must not stay borrowed while the engine runs.
            let messages = self.transceiver.borrow_mut().read_messages(ev.token());
            for (message, reply_address) in messages {
                self.dispatcher.mdns.receive_message(message, reply_address);
            }
        }
        self.dispatcher.teardown_closed();
    }

    fn signal_sock_drain(&self) {
        let mut signal_buf = [0; 1024];

        // This recv is non-blocking as the socket is non-blocking.
        loop {
            match self.signal_sock.recv(&mut signal_buf) {
                Ok(sz) => trace!(
                    "signal socket recvd: {}",
                    String::from_utf8_lossy(&signal_buf[0..sz])
                ),
                Err(e) => {
                    if e.kind() != ErrorKind::WouldBlock {
                        debug!("signal socket recv error: {}", e);
                    }
                    break;
                }
            }
        }
    }

}

impl Dispatcher {
    fn new(mdns: Mdns, handle: ServiceDaemon, ready: Rc<Cell<bool>>) -> Self {
        Self {
            mdns,
            handle,
            bindings: BindingRegistry::new(),
            deferred: DeferredBindings::new(),
            ready,
            closed: Rc::new(RefCell::new(Vec::new())),
            status: DaemonStatus::Running,
        }
    }

    /// Runs `command` now, or holds it until the engine is ready.
    fn submit(&mut self, command: Command) {
        if !command.needs_engine() {
            self.exec_command(command);
            return;
        }
        if let Some(command) = self.deferred.submit(command) {
            self.exec_command(command);
        }
        self.teardown_closed();
    }

    fn flush_deferred(&mut self) {
        if !self.ready.get() || self.deferred.is_ready() {
            return;
        }
        let commands = self.deferred.set_ready();
        debug!("ready, running {} deferred commands", commands.len());
        for command in commands {
            self.exec_command(command);
            self.teardown_closed();
        }
    }

    /// Tears down bindings whose deleter fired: detach first, then unbind.
    fn teardown_closed(&mut self) {
        loop {
            let ids: Vec<u64> = self.closed.borrow_mut().drain(..).collect();
            if ids.is_empty() {
                break;
            }
            for id in ids {
                let mdns = &self.mdns;
                self.bindings.teardown(id, |binding| binding.teardown(mdns));
            }
        }
    }

    fn deleter(&self, id: u64) -> Box<dyn FnOnce()> {
        let closed = self.closed.clone();
        Box::new(move || closed.borrow_mut().push(id))
    }

    fn exec_command(&mut self, command: Command) {
        trace!("exec {}", command);
        match command {
            Command::Subscribe {
                id,
                service_name,
                options,
                sender,
            } => {
                let pipeline = Rc::new(RefCell::new(SubscriberPipeline::new(
                    id,
                    sender,
                    self.handle.ack_fn(),
                    self.deleter(id),
                )));
                let subscriber_id = self.mdns.subscribe_to_service(
                    &service_name,
                    options.media,
                    options.ip_versions,
                    options.include_unknown_resources,
                    options.send_initial_query,
                    Box::new(PipelineSubscriber(pipeline.clone())),
                );
                self.bindings.insert(
                    id,
                    Binding::Subscription {
                        subscriber_id,
                        pipeline,
                    },
                );
            }

            Command::Unsubscribe(id) => {
                let mdns = &self.mdns;
                if !self.bindings.teardown(id, |binding| binding.teardown(mdns)) {
                    debug!("unsubscribe: no subscription {}", id);
                }
            }

            Command::SubscriberAck(id) => {
                if let Some(Binding::Subscription { pipeline, .. }) = self.bindings.get(id) {
                    pipeline.borrow_mut().ack();
                }
            }

            Command::Publish {
                id,
                service_name,
                instance_name,
                options,
                sender,
            } => {
                let throttle = Rc::new(RefCell::new(PublisherThrottle::new(
                    id,
                    sender.clone(),
                    self.handle.reply_fn(),
                    self.deleter(id),
                )));
                let published = self.mdns.publish_service_instance(
                    &service_name,
                    &instance_name,
                    options.media,
                    options.ip_versions,
                    options.perform_probe,
                    Box::new(ThrottledPublisher(throttle.clone())),
                );
                if !published {
                    let full_name = local_instance_full_name(&instance_name, &service_name);
                    debug!("publish: {} is already published", &full_name);
                    let event = PublisherEvent::Rejected(Error::AlreadyPublished(full_name));
                    if let Err(e) = sender.try_send(event) {
                        debug!("failed to send rejection: {}", e);
                    }
                    return;
                }
                self.bindings.insert(
                    id,
                    Binding::Publication {
                        service_name,
                        instance_name,
                        throttle,
                    },
                );
            }

            Command::Unpublish(service_name, instance_name) => {
                let id = self.bindings.ids().into_iter().find(|id| {
                    self.bindings
                        .get(*id)
                        .is_some_and(|b| b.is_publication(&service_name, &instance_name))
                });
                match id {
                    Some(id) => {
                        let mdns = &self.mdns;
                        self.bindings.teardown(id, |binding| binding.teardown(mdns));
                    }
                    None => {
                        self.mdns
                            .unpublish_service_instance(&service_name, &instance_name);
                    }
                }
            }

            Command::PublicationReply {
                publication_id,
                seq,
                publication,
            } => {
                let Some(Binding::Publication { throttle, .. }) =
                    self.bindings.get(publication_id)
                else {
                    trace!("reply for unknown publication {}", publication_id);
                    return;
                };
                let throttle = throttle.clone();

                // Respond with the throttle released, as the engine may call
                // back into it.
                let reply = throttle.borrow_mut().take_reply(seq, publication);
                if let Some((responder, publication)) = reply {
                    responder.respond(publication);
                }
                throttle.borrow_mut().pump();
            }

            Command::SetSubtypes {
                service_name,
                instance_name,
                subtypes,
            } => {
                if !self
                    .mdns
                    .set_subtypes(&service_name, &instance_name, subtypes)
                {
                    debug!("set_subtypes: {} is not published", &instance_name);
                }
            }

            Command::PublisherSubtypes(id, subtypes) => {
                let Some(Binding::Publication {
                    service_name,
                    instance_name,
                    throttle,
                }) = self.bindings.get(id)
                else {
                    return;
                };
                let accepted = throttle.borrow_mut().check_subtypes(&subtypes);
                if accepted {
                    self.mdns.set_subtypes(service_name, instance_name, subtypes);
                }
            }

            Command::Reannounce(service_name, instance_name) => {
                if !self.mdns.reannounce(&service_name, &instance_name) {
                    debug!("reannounce: {} is not published", &instance_name);
                }
            }

            Command::PublishHost {
                id,
                host_name,
                addresses,
                options,
                sender,
            } => {
                let published = self.mdns.publish_host(
                    &host_name,
                    addresses,
                    options.media,
                    options.ip_versions,
                    options.perform_probe,
                    Box::new(ChannelHostPublisher {
                        sender: sender.clone(),
                    }),
                );
                if !published {
                    let event =
                        HostPublisherEvent::Rejected(Error::AlreadyPublished(host_name.clone()));
                    if let Err(e) = sender.try_send(event) {
                        debug!("failed to send rejection: {}", e);
                    }
                    return;
                }
                self.bindings.insert(id, Binding::Host { host_name });
            }

            Command::UnpublishHost(host_name) => {
                let id = self.bindings.ids().into_iter().find(|id| {
                    self.bindings
                        .get(*id)
                        .is_some_and(|b| b.is_host(&host_name))
                });
                match id {
                    Some(id) => {
                        let mdns = &self.mdns;
                        self.bindings.teardown(id, |binding| binding.teardown(mdns));
                    }
                    None => {
                        self.mdns.unpublish_host(&host_name);
                    }
                }
            }

            Command::ResolveHostName {
                host_name,
                timeout,
                sender,
            } => {
                let deadline = current_time_millis() + timeout.as_millis() as u64;
                self.mdns.resolve_host_name(
                    &host_name,
                    deadline,
                    Box::new(move |resolution| {
                        if let Err(e) = sender.try_send(resolution) {
                            debug!("failed to send host resolution: {}", e);
                        }
                    }),
                );
            }

            Command::GetMetrics(resp_s) => {
                if let Err(e) = resp_s.send(self.mdns.metrics()) {
                    debug!("Failed to send metrics: {}", e);
                }
            }

            Command::GetStatus(resp_s) => {
                if let Err(e) = resp_s.send(self.status.clone()) {
                    debug!("Failed to send status: {}", e);
                }
            }

            Command::Exit(_) => {
                debug!("Exit is handled by the run loop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dns_parser::DnsMessage,
        reply_address::{HostAddress, ReplyAddress},
        transceiver::Transceiver,
    };
    use std::sync::Mutex;
    use test_log::test;

    type Sent = Rc<RefCell<Vec<DnsMessage>>>;

    struct RecordingTransceiver(Sent);

    impl Transceiver for RecordingTransceiver {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self) {}

        fn has_interfaces(&self) -> bool {
            true
        }

        fn send_message(&mut self, message: &DnsMessage, _reply_address: &ReplyAddress) {
            self.0.borrow_mut().push(message.clone());
        }

        fn local_host_addresses(&self) -> Vec<HostAddress> {
            vec![HostAddress::new(
                "192.168.1.2".parse().unwrap(),
                1,
                Duration::from_secs(120),
            )]
        }
    }

    /// A ready dispatcher on a recording transceiver. The returned socket
    /// stands in for the daemon's signal socket.
    fn ready_dispatcher() -> (Dispatcher, Sent, Receiver<Command>, UdpSocket) {
        let sent: Sent = Rc::new(RefCell::new(Vec::new()));
        let mdns = Mdns::new(Box::new(RecordingTransceiver(sent.clone())));
        let ready = Rc::new(Cell::new(false));
        let ready_flag = ready.clone();
        mdns.start(
            "daemon-host",
            false,
            Box::new(move || ready_flag.set(true)),
            vec![],
        )
        .unwrap();
        assert!(ready.get());

        let signal_sock = UdpSocket::bind(SocketAddrV4::new(LOOPBACK_V4, 0)).unwrap();
        let (sender, commands) = bounded(100);
        let handle = ServiceDaemon {
            sender,
            signal_addr: signal_sock.local_addr().unwrap(),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let mut dispatcher = Dispatcher::new(mdns, handle, ready);
        dispatcher.flush_deferred();
        (dispatcher, sent, commands, signal_sock)
    }

    /// Answers the next publication request the way the client's reply
    /// would arrive at the daemon.
    fn answer_next_request(
        dispatcher: &mut Dispatcher,
        events: &Receiver<PublisherEvent>,
        publication_id: u64,
    ) {
        let request = loop {
            match events.try_recv() {
                Ok(PublisherEvent::GetPublication(request)) => break request,
                Ok(_) => continue,
                Err(e) => panic!("no publication request: {}", e),
            }
        };
        let seq = request.replier.seq;
        request.replier.forget();
        dispatcher.submit(Command::PublicationReply {
            publication_id,
            seq,
            publication: Some(Publication::new(631, vec!["rp=ipp".to_string()])),
        });
    }

    #[test]
    fn test_invalid_publisher_subtype_unpublishes() {
        let (mut dispatcher, sent, _commands, _signal_sock) = ready_dispatcher();
        let (sender, events) = bounded(PUBLISHER_CHANNEL_SIZE);
        dispatcher.submit(Command::Publish {
            id: 1,
            service_name: "_ipp._tcp.".to_string(),
            instance_name: "Office".to_string(),
            options: PublicationOptions {
                perform_probe: false,
                ..Default::default()
            },
            sender,
        });

        // Setup, then the first announcement.
        answer_next_request(&mut dispatcher, &events, 1);
        answer_next_request(&mut dispatcher, &events, 1);
        assert_eq!(dispatcher.mdns.metrics().get("announce"), Some(&1));

        dispatcher.submit(Command::PublisherSubtypes(1, vec!["_color".to_string()]));
        assert!(dispatcher.bindings.get(1).is_some());

        sent.borrow_mut().clear();
        dispatcher.submit(Command::PublisherSubtypes(
            1,
            vec!["no-underscore".to_string()],
        ));

        // Torn down exactly like an unpublish: binding gone, goodbye sent.
        assert!(dispatcher.bindings.get(1).is_none());
        assert_eq!(dispatcher.mdns.metrics().get("goodbye"), Some(&1));
        let sent = sent.borrow();
        assert!(!sent.is_empty());
        assert!(sent
            .iter()
            .all(|m| !m.answers.is_empty() && m.answers.iter().all(|r| r.is_goodbye())));
        assert!(!dispatcher
            .mdns
            .unpublish_service_instance("_ipp._tcp.", "Office"));
    }

    #[test]
    fn test_subscription_event_acks_on_drop() {
        let acked = Arc::new(Mutex::new(Vec::new()));
        let sink = acked.clone();
        let ack: AckFn = Arc::new(move |id| sink.lock().unwrap().push(id));

        let event =
            SubscriptionEvent::new(SubscriberEvent::Query(crate::RRType::PTR), 3, ack.clone());
        assert_eq!(event.subscription_id(), 3);
        drop(event);
        assert_eq!(*acked.lock().unwrap(), vec![3]);

        // Taken back, not acknowledged.
        let event = SubscriptionEvent::new(SubscriberEvent::Query(crate::RRType::PTR), 4, ack);
        let inner = event.into_event();
        assert_eq!(inner, SubscriberEvent::Query(crate::RRType::PTR));
        assert_eq!(*acked.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_dropped_replier_replies_none() {
        let replies = Arc::new(Mutex::new(Vec::new()));
        let sink = replies.clone();
        let reply: ReplyFn = Arc::new(move |id, seq, publication| {
            sink.lock().unwrap().push((id, seq, publication));
        });

        drop(PublicationReplier::new(1, 1, reply.clone()));
        PublicationReplier::new(1, 2, reply.clone()).reply(Some(Publication::new(80, vec![])));
        PublicationReplier::new(1, 3, reply).forget();

        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], (1, 1, None));
        assert_eq!(replies[1].1, 2);
        assert_eq!(replies[1].2.as_ref().map(|p| p.port), Some(80));
    }

    #[test]
    fn test_command_deferral() {
        let (s, _r) = bounded(1);
        assert!(!Command::GetMetrics(s).needs_engine());
        assert!(Command::Unsubscribe(1).needs_engine());
    }
}
