//! The discovery engine: browse, cancel and resolve on top of a dedicated event-loop thread.
//!
//! All protocol state lives on the loop thread. Public methods post requests into the loop's
//! input queue, which also receives every packet the transport reads, so requests and packets
//! are handled strictly in the order they arrive. Notifier callbacks run on the loop thread.

mod config;
#[cfg(test)]
mod sim;
mod state;

use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use crate::{
    cache::{CacheReader, RecordCache},
    name::DomainName,
    service::{ServiceInstance, ServiceRecord, ServiceType},
    transport::{MulticastTransport, PacketSink, Transport, TransportGuard},
    Error, ErrorKind,
};

pub use config::EngineConfig;

use state::{EngineState, Reply};

/// Longest wait accepted by [`Engine::resolve_once`].
const MAX_RESOLVE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on the delay between socket reopen attempts.
const MAX_REOPEN_DELAY: Duration = Duration::from_secs(60);

/// Receives discovery events. All methods are invoked on the engine's event loop thread.
///
/// For each subscription and instance, `on_service_removed` is only called after
/// `on_service_found`, and `on_service_updated` only between the two.
pub trait HostNotifier: Send + Sync {
    fn on_service_found(&self, record: &ServiceRecord);

    /// The instance changed host, port, addresses or TXT data.
    fn on_service_updated(&self, record: &ServiceRecord);

    /// The instance sent a goodbye or its records expired.
    fn on_service_removed(&self, instance: &ServiceInstance);

    fn on_error(&self, kind: ErrorKind, detail: &str);

    fn on_browse_started(&self, _service_type: &ServiceType) {}

    fn on_browse_stopped(&self, _service_type: &ServiceType) {}
}

/// Shared between a [`Subscription`] handle and the engine, which only holds a weak reference.
pub(crate) struct SubscriptionShared {
    id: u64,
    service_type: ServiceType,
    notifier: Arc<dyn HostNotifier>,
    cancelled: AtomicBool,
}

impl SubscriptionShared {
    pub(crate) fn new(id: u64, service_type: ServiceType, notifier: Arc<dyn HostNotifier>) -> Self {
        Self {
            id,
            service_type,
            notifier,
            cancelled: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    pub(crate) fn notifier(&self) -> &dyn HostNotifier {
        &*self.notifier
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle of an active browse, returned by [`Engine::browse`].
///
/// Dropping the handle stops delivery too, but lazily; use [`Engine::cancel_browse`] to stop it
/// synchronously.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub fn service_type(&self) -> &ServiceType {
        self.shared.service_type()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("service_type", &self.shared.service_type)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Messages processed by the event loop, in arrival order.
pub(crate) enum Input {
    Browse(Arc<SubscriptionShared>),
    Cancel {
        id: u64,
        ack: Option<SyncSender<()>>,
    },
    Resolve {
        instance: ServiceInstance,
        deadline: Instant,
        force: bool,
        reply: Reply,
    },
    Packet(Vec<u8>),
    SocketFailed(io::ErrorKind),
    InterfacesChanged,
    Shutdown,
}

/// mDNS/DNS-SD service discovery engine.
///
/// Owns an event loop thread and the transport's sockets; both are released by
/// [`Engine::stop`] or when the engine is dropped.
pub struct Engine {
    tx: Sender<Input>,
    cache: CacheReader,
    domain: DomainName,
    next_id: AtomicU64,
    loop_thread: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl Engine {
    /// Starts an engine on the multicast sockets of all IPv4 interfaces.
    pub fn start(config: EngineConfig) -> Result<Self, Error> {
        let transport = MulticastTransport::new(&config);
        Self::with_transport(config, Box::new(transport))
    }

    /// Starts an engine on a custom [`Transport`].
    ///
    /// Fails if the transport cannot be opened; the transport is closed again in that case.
    pub fn with_transport(
        config: EngineConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel();
        let sink = PacketSink::new(tx.clone());
        let mut transport = TransportGuard::new(transport);
        transport.open(sink.clone())?;

        let cache = RecordCache::new();
        let reader = cache.reader();
        let domain = config.domain.clone();
        let event_loop = EventLoop {
            state: EngineState::new(&config, cache),
            rx,
            transport,
            sink,
            reopen_at: None,
            reopen_attempts: 0,
            config,
        };
        let handle = thread::Builder::new()
            .name("mdns-engine".into())
            .spawn(move || event_loop.run())?;

        log::info!("mDNS engine started (domain {})", domain);
        Ok(Self {
            tx,
            cache: reader,
            domain,
            next_id: AtomicU64::new(0),
            loop_thread: handle.thread().id(),
            handle: Some(handle),
        })
    }

    fn send(&self, input: Input) -> Result<(), Error> {
        self.tx.send(input).map_err(|_| Error::EngineStopped)
    }

    fn on_loop_thread(&self) -> bool {
        thread::current().id() == self.loop_thread
    }

    #[inline]
    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    /// Starts browsing for instances of `service_type` (like `_http._tcp`).
    ///
    /// Instances already in the cache are reported as found right away, followed by live
    /// updates. Fails with [`Error::InvalidServiceType`] if `service_type` is malformed.
    pub fn browse(
        &self,
        service_type: &str,
        notifier: Arc<dyn HostNotifier>,
    ) -> Result<Subscription, Error> {
        let service_type = ServiceType::parse(service_type, &self.domain)?;
        self.browse_type(service_type, notifier)
    }

    pub fn browse_type(
        &self,
        service_type: ServiceType,
        notifier: Arc<dyn HostNotifier>,
    ) -> Result<Subscription, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SubscriptionShared::new(id, service_type, notifier));
        self.send(Input::Browse(shared.clone()))?;
        Ok(Subscription { shared })
    }

    /// Stops delivery for `subscription`. Calling this more than once has no further effect.
    ///
    /// No callback for the subscription runs after this returns. When the last subscription of
    /// a service type is cancelled, its browse queries stop.
    pub fn cancel_browse(&self, subscription: &Subscription) {
        let shared = &subscription.shared;
        shared.cancelled.store(true, Ordering::SeqCst);
        if self.on_loop_thread() {
            // Called from a callback; the flag already suppresses further deliveries.
            self.tx.send(Input::Cancel { id: shared.id, ack: None }).ok();
            return;
        }
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        let cancel = Input::Cancel {
            id: shared.id,
            ack: Some(ack_tx),
        };
        if self.tx.send(cancel).is_ok() {
            // An error means the loop is gone, which is just as good.
            ack_rx.recv().ok();
        }
    }

    /// Resolves `instance` to its host, port, addresses and TXT data, blocking for at most
    /// `timeout`.
    ///
    /// Returns the cached record if there is one. Fails with [`Error::ResolutionTimeout`] or
    /// [`Error::ServiceWithdrawn`], and with [`Error::ReentrantCall`] when called from a
    /// [`HostNotifier`] callback.
    pub fn resolve_once(
        &self,
        instance: &ServiceInstance,
        timeout: Duration,
    ) -> Result<ServiceRecord, Error> {
        self.resolve(instance, timeout, false)
    }

    /// Like [`Engine::resolve_once`], but ignores cached data and queries the network again.
    pub fn refresh(
        &self,
        instance: &ServiceInstance,
        timeout: Duration,
    ) -> Result<ServiceRecord, Error> {
        self.resolve(instance, timeout, true)
    }

    fn resolve(
        &self,
        instance: &ServiceInstance,
        timeout: Duration,
        force: bool,
    ) -> Result<ServiceRecord, Error> {
        if self.on_loop_thread() {
            return Err(Error::ReentrantCall);
        }
        let timeout = timeout.min(MAX_RESOLVE_TIMEOUT);
        let (tx, rx) = mpsc::channel();
        self.send(Input::Resolve {
            instance: instance.clone(),
            deadline: Instant::now() + timeout,
            force,
            reply: Box::new(move |res| {
                tx.send(res).ok();
            }),
        })?;
        match rx.recv_timeout(timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => Err(Error::ResolutionTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::EngineStopped),
        }
    }

    /// Returns a reader for concurrent lookups in the record cache.
    #[inline]
    pub fn cache(&self) -> &CacheReader {
        &self.cache
    }

    /// Tells the engine that network interfaces were added or removed; sockets are reopened.
    pub fn notify_interfaces_changed(&self) {
        self.tx.send(Input::InterfacesChanged).ok();
    }

    /// Stops the event loop and closes all sockets.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.tx.send(Input::Shutdown).ok();
        if self.on_loop_thread() {
            // Dropped from within a callback; the loop exits after the callback returns.
            return;
        }
        if handle.join().is_err() {
            log::error!("mDNS engine thread panicked");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct EventLoop {
    state: EngineState,
    rx: Receiver<Input>,
    transport: TransportGuard,
    sink: PacketSink,
    reopen_at: Option<Instant>,
    reopen_attempts: u32,
    config: EngineConfig,
}

impl EventLoop {
    fn run(mut self) {
        loop {
            let now = Instant::now();
            if self.reopen_at.is_some_and(|at| at <= now) && !self.reopen(now) {
                break;
            }
            self.state.handle_timers(now);
            self.flush(now);

            let deadline = self.state.next_deadline().into_iter().chain(self.reopen_at).min();
            let input = match deadline {
                Some(deadline) => {
                    match self.rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(input) => input,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.rx.recv() {
                    Ok(input) => input,
                    Err(_) => break,
                },
            };
            let now = Instant::now();
            if !self.handle(input, now) {
                break;
            }
            self.flush(now);
        }

        self.state.shutdown();
        self.transport.close();
        log::info!("mDNS engine stopped");
    }

    /// Returns `false` when the loop should exit.
    fn handle(&mut self, input: Input, now: Instant) -> bool {
        match input {
            Input::Browse(shared) => self.state.browse(shared, now),
            Input::Cancel { id, ack } => {
                self.state.cancel_browse(id);
                if let Some(ack) = ack {
                    ack.send(()).ok();
                }
            }
            Input::Resolve {
                instance,
                deadline,
                force,
                reply,
            } => self.state.resolve(instance, deadline, force, reply, now),
            Input::Packet(packet) => self.state.handle_packet(&packet, now),
            Input::SocketFailed(kind) => self.socket_failed(kind, now),
            Input::InterfacesChanged => {
                log::info!("network interfaces changed, reopening sockets");
                self.transport.close();
                self.reopen_attempts = 0;
                self.reopen_at = Some(now);
            }
            Input::Shutdown => return false,
        }
        true
    }

    fn flush(&mut self, now: Instant) {
        for packet in self.state.take_outgoing() {
            if !self.transport.is_open() {
                log::trace!("transport closed, dropping outgoing packet");
                continue;
            }
            if let Err(e) = self.transport.send(&packet) {
                self.socket_failed(e.kind(), now);
            }
        }
    }

    fn socket_failed(&mut self, kind: io::ErrorKind, now: Instant) {
        if self.reopen_at.is_some() {
            return;
        }
        log::warn!("socket error: {}, reopening", kind);
        self.transport.close();
        self.schedule_reopen(now);
    }

    fn schedule_reopen(&mut self, now: Instant) {
        let delay = self
            .config
            .reopen_delay
            .saturating_mul(1 << self.reopen_attempts.min(16))
            .min(MAX_REOPEN_DELAY);
        self.reopen_at = Some(now + delay);
    }

    /// Returns `false` if the transport could not be reopened and the engine has to stop.
    fn reopen(&mut self, now: Instant) -> bool {
        self.reopen_at = None;
        match self.transport.open(self.sink.clone()) {
            Ok(()) => {
                log::info!("sockets reopened");
                self.reopen_attempts = 0;
                true
            }
            Err(e) => {
                self.reopen_attempts += 1;
                if self.reopen_attempts >= self.config.max_reopen_attempts {
                    log::error!(
                        "giving up after {} attempts to reopen sockets: {}",
                        self.reopen_attempts,
                        e
                    );
                    self.state.report_error(
                        ErrorKind::SocketError,
                        &format!("failed to reopen sockets: {e}"),
                    );
                    return false;
                }
                log::warn!("failed to reopen sockets (attempt {}): {}", self.reopen_attempts, e);
                self.schedule_reopen(now);
                true
            }
        }
    }
}
