//! In-memory network for driving a real [`Engine`] in tests.
//!
//! Queries sent by the engine are answered by a [`Responder`] holding the "remote" services.

use std::{
    io,
    net::{IpAddr, Ipv4Addr},
    sync::{mpsc, Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use super::*;
use crate::{
    name::DomainName,
    packet::{Message, RecordType},
    service::{
        advertising::{InstanceDetails, Responder},
        TxtRecordValue,
    },
};

struct SimState {
    sink: Option<PacketSink>,
    responder: Responder,
    sent: Vec<Message>,
    opens: u32,
    /// Number of upcoming `open` calls that fail.
    open_failures: u32,
}

#[derive(Clone)]
struct SimNetwork {
    inner: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                sink: None,
                responder: Responder::new(domain()),
                sent: Vec::new(),
                opens: 0,
                open_failures: 0,
            })),
        }
    }

    fn transport(&self) -> Box<dyn Transport> {
        Box::new(SimTransport { net: self.clone() })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.inner.lock().unwrap()
    }

    fn deliver(&self, packet: Vec<u8>) {
        if let Some(sink) = &self.state().sink {
            sink.deliver(packet);
        }
    }

    fn register(&self, instance: ServiceInstance, details: InstanceDetails) {
        self.state().responder.register(instance, details);
    }

    fn announce(&self, instance: &ServiceInstance) {
        let msg = self.state().responder.announcement(instance).unwrap();
        self.deliver(msg.encode().unwrap());
    }

    fn unregister(&self, instance: &ServiceInstance) {
        let goodbye = self.state().responder.unregister(instance).unwrap();
        self.deliver(goodbye.encode().unwrap());
    }

    fn inject(&self, packet: &[u8]) {
        self.deliver(packet.to_vec());
    }

    /// Breaks the socket; the next `open_failures` attempts to reopen it fail.
    fn fail_socket(&self, open_failures: u32) {
        let sink = {
            let mut state = self.state();
            state.open_failures = open_failures;
            state.sink.take()
        };
        if let Some(sink) = sink {
            sink.fail(io::ErrorKind::ConnectionReset.into());
        }
    }

    fn is_open(&self) -> bool {
        self.state().sink.is_some()
    }

    fn opens(&self) -> u32 {
        self.state().opens
    }

    fn sent(&self) -> Vec<Message> {
        self.state().sent.clone()
    }
}

struct SimTransport {
    net: SimNetwork,
}

impl Transport for SimTransport {
    fn open(&mut self, sink: PacketSink) -> io::Result<()> {
        let mut state = self.net.state();
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(io::ErrorKind::AddrInUse.into());
        }
        state.opens += 1;
        state.sink = Some(sink);
        Ok(())
    }

    fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        let msg = Message::decode(packet).map_err(io::Error::from)?;
        let mut state = self.net.state();
        if let Some(answer) = state.responder.answer(&msg) {
            if let Some(sink) = &state.sink {
                sink.deliver(answer.encode().map_err(io::Error::from)?);
            }
        }
        state.sent.push(msg);
        Ok(())
    }

    fn close(&mut self) {
        self.net.state().sink = None;
    }
}

#[derive(Debug)]
enum Event {
    Found(ServiceRecord),
    Updated(ServiceRecord),
    Removed(ServiceInstance),
    Error(ErrorKind),
    Started,
    Stopped,
}

struct Events {
    tx: Mutex<mpsc::Sender<Event>>,
}

impl Events {
    fn new() -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }

    fn push(&self, event: Event) {
        self.tx.lock().unwrap().send(event).ok();
    }
}

impl HostNotifier for Events {
    fn on_service_found(&self, record: &ServiceRecord) {
        self.push(Event::Found(record.clone()));
    }

    fn on_service_updated(&self, record: &ServiceRecord) {
        self.push(Event::Updated(record.clone()));
    }

    fn on_service_removed(&self, instance: &ServiceInstance) {
        self.push(Event::Removed(instance.clone()));
    }

    fn on_error(&self, kind: ErrorKind, _detail: &str) {
        self.push(Event::Error(kind));
    }

    fn on_browse_started(&self, _service_type: &ServiceType) {
        self.push(Event::Started);
    }

    fn on_browse_stopped(&self, _service_type: &ServiceType) {
        self.push(Event::Stopped);
    }
}

const TIMEOUT: Duration = Duration::from_secs(5);

fn next(rx: &mpsc::Receiver<Event>) -> Event {
    rx.recv_timeout(TIMEOUT).expect("no event received")
}

fn assert_quiet(rx: &mpsc::Receiver<Event>) {
    if let Ok(event) = rx.recv_timeout(Duration::from_millis(300)) {
        panic!("unexpected event {event:?}");
    }
}

fn init_logger() {
    env_logger::builder()
        .is_test(true)
        .filter_module(env!("CARGO_CRATE_NAME"), log::LevelFilter::Debug)
        .try_init()
        .ok();
}

fn domain() -> DomainName {
    DomainName::from_str("local").unwrap()
}

fn config() -> EngineConfig {
    EngineConfig::new()
        .rng_seed(1)
        .reopen_delay(Duration::from_millis(10))
}

fn instance(name: &str) -> ServiceInstance {
    ServiceInstance::new(name.parse().unwrap(), "_http._tcp".parse().unwrap(), domain())
}

fn printer() -> ServiceInstance {
    instance("printer")
}

fn printer_details() -> InstanceDetails {
    let mut details = InstanceDetails::new(DomainName::from_str("printer.local").unwrap(), 631);
    details.add_address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40)));
    details.txt_records_mut().insert("product", "LaserX");
    details
}

fn start(net: &SimNetwork) -> Engine {
    init_logger();
    Engine::with_transport(config(), net.transport()).unwrap()
}

#[test]
fn printer_found_then_removed() {
    let net = SimNetwork::new();
    net.register(printer(), printer_details());
    let engine = start(&net);

    let (notifier, rx) = Events::new();
    let _sub = engine.browse("_http._tcp", notifier).unwrap();
    assert!(matches!(next(&rx), Event::Started));

    let Event::Found(rec) = next(&rx) else {
        panic!("expected the printer to be found");
    };
    assert_eq!(rec.instance(), &printer());
    assert_eq!(rec.port(), 631);
    assert_eq!(rec.txt_records().get("product"), Some(TxtRecordValue::Value(b"LaserX")));
    assert!(rec.addresses().contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40))));
    assert!(engine.cache().contains(&printer()));
    assert_quiet(&rx);

    net.unregister(&printer());
    let Event::Removed(instance) = next(&rx) else {
        panic!("expected the printer to be removed");
    };
    assert_eq!(instance, printer());
    assert!(!engine.cache().contains(&printer()));
    assert_quiet(&rx);
}

#[test]
fn resolve_missing_instance_times_out() {
    let net = SimNetwork::new();
    let engine = start(&net);

    let missing = instance("ghost");
    let started = Instant::now();
    let err = engine.resolve_once(&missing, Duration::from_secs(2)).unwrap_err();
    assert_eq!(err, Error::ResolutionTimeout);
    assert!(started.elapsed() >= Duration::from_secs(2));

    let srv_queries = net
        .sent()
        .iter()
        .flat_map(|msg| msg.questions().to_vec())
        .filter(|q| q.qtype() == RecordType::SRV)
        .count();
    assert!(srv_queries >= 1);
}

#[test]
fn resolve_once_queries_and_caches() {
    let net = SimNetwork::new();
    net.register(printer(), printer_details());
    let engine = start(&net);

    let rec = engine.resolve_once(&printer(), TIMEOUT).unwrap();
    assert_eq!(rec.port(), 631);
    assert_eq!(rec.host().to_string(), "printer.local.");
    assert_eq!(rec.ttl(), 120);
    assert_eq!(engine.cache().get(&printer()).unwrap().port(), 631);

    // Served from the cache, without asking the network again.
    let sent = net.sent().len();
    engine.resolve_once(&printer(), TIMEOUT).unwrap();
    assert_eq!(net.sent().len(), sent);

    engine.refresh(&printer(), TIMEOUT).unwrap();
    assert!(net.sent().len() > sent);
}

#[test]
fn resolved_record_is_cached_on_return() {
    let net = SimNetwork::new();
    net.register(printer(), printer_details());
    for _ in 0..20 {
        let engine = start(&net);
        let rec = engine.resolve_once(&printer(), TIMEOUT).unwrap();
        let cached = engine.cache().get(&printer()).expect("record missing from the cache");
        assert!(cached.content_eq(&rec));
        engine.stop();
    }
}

#[test]
fn resolve_withdrawn_service() {
    let net = SimNetwork::new();
    let engine = Arc::new(start(&net));

    let waiter = {
        let engine = engine.clone();
        thread::spawn(move || engine.resolve_once(&printer(), TIMEOUT))
    };
    let deadline = Instant::now() + TIMEOUT;
    while net.sent().is_empty() {
        assert!(Instant::now() < deadline, "no query was sent");
        thread::sleep(Duration::from_millis(10));
    }

    // The printer never answers, but says goodbye.
    let mut remote = Responder::new(domain());
    remote.register(printer(), printer_details());
    net.inject(&remote.goodbye(&printer()).unwrap().encode().unwrap());

    let err = waiter.join().unwrap().unwrap_err();
    assert_eq!(err, Error::ServiceWithdrawn);
}

#[test]
fn cancel_browse_is_idempotent() {
    let net = SimNetwork::new();
    let engine = start(&net);

    let (notifier, rx) = Events::new();
    let sub = engine.browse("_http._tcp", notifier).unwrap();
    assert!(matches!(next(&rx), Event::Started));
    engine.cancel_browse(&sub);
    engine.cancel_browse(&sub);
    assert!(sub.is_cancelled());
    assert!(matches!(next(&rx), Event::Stopped));

    // Announcements for the type are no longer delivered.
    let http = instance("web");
    net.register(http.clone(), printer_details());
    net.announce(&http);
    assert_quiet(&rx);
}

#[test]
fn browse_reports_invalid_service_type() {
    let net = SimNetwork::new();
    let engine = start(&net);
    for ty in ["http", "_http", "_http._xyz", "_http._tcp.example.com", "_-http._tcp"] {
        let (notifier, _rx) = Events::new();
        let err = engine.browse(ty, notifier).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidServiceType, "{ty}");
    }
}

#[test]
fn resolve_from_callback_is_rejected() {
    struct Reentrant {
        engine: OnceLock<Arc<Engine>>,
        tx: Mutex<mpsc::Sender<Result<ServiceRecord, Error>>>,
    }

    impl HostNotifier for Reentrant {
        fn on_service_found(&self, record: &ServiceRecord) {
            if let Some(engine) = self.engine.get() {
                let res = engine.resolve_once(record.instance(), TIMEOUT);
                self.tx.lock().unwrap().send(res).ok();
            }
        }

        fn on_service_updated(&self, _record: &ServiceRecord) {}

        fn on_service_removed(&self, _instance: &ServiceInstance) {}

        fn on_error(&self, _kind: ErrorKind, _detail: &str) {}
    }

    let net = SimNetwork::new();
    net.register(printer(), printer_details());
    let engine = Arc::new(start(&net));

    let (tx, rx) = mpsc::channel();
    let notifier = Arc::new(Reentrant {
        engine: OnceLock::new(),
        tx: Mutex::new(tx),
    });
    notifier.engine.set(engine.clone()).ok();
    let sub = engine.browse("_http._tcp", notifier.clone()).unwrap();

    let res = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(res.unwrap_err(), Error::ReentrantCall);
    engine.cancel_browse(&sub);
}

#[test]
fn malformed_packets_are_ignored() {
    let net = SimNetwork::new();
    let engine = start(&net);

    let (notifier, rx) = Events::new();
    let _sub = engine.browse("_http._tcp", notifier).unwrap();
    assert!(matches!(next(&rx), Event::Started));

    net.inject(&[0xde, 0xad, 0xbe, 0xef]);
    net.inject(&[0; 12 + 3]);
    net.register(printer(), printer_details());
    net.announce(&printer());
    assert!(matches!(next(&rx), Event::Found(_)));
    assert_quiet(&rx);
}

#[test]
fn socket_is_reopened_after_failure() {
    let net = SimNetwork::new();
    let engine = start(&net);

    let (notifier, rx) = Events::new();
    let _sub = engine.browse("_http._tcp", notifier).unwrap();
    assert!(matches!(next(&rx), Event::Started));

    net.fail_socket(1);
    let deadline = Instant::now() + TIMEOUT;
    while net.opens() < 2 {
        assert!(Instant::now() < deadline, "socket was not reopened");
        thread::sleep(Duration::from_millis(10));
    }

    net.register(printer(), printer_details());
    net.announce(&printer());
    assert!(matches!(next(&rx), Event::Found(_)));

    engine.notify_interfaces_changed();
    let deadline = Instant::now() + TIMEOUT;
    while net.opens() < 3 {
        assert!(Instant::now() < deadline, "socket was not reopened");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn persistent_socket_failure_stops_engine() {
    let net = SimNetwork::new();
    let engine = Engine::with_transport(config().max_reopen_attempts(2), net.transport()).unwrap();

    let (notifier, rx) = Events::new();
    let _sub = engine.browse("_http._tcp", notifier).unwrap();
    assert!(matches!(next(&rx), Event::Started));

    net.fail_socket(u32::MAX);
    assert!(matches!(next(&rx), Event::Error(ErrorKind::SocketError)));
    assert!(matches!(next(&rx), Event::Stopped));
    assert_eq!(
        engine.resolve_once(&printer(), TIMEOUT).unwrap_err(),
        Error::EngineStopped
    );
}

#[test]
fn start_failure_and_stop_release_the_transport() {
    let net = SimNetwork::new();
    net.state().open_failures = 1;
    let err = Engine::with_transport(config(), net.transport()).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::SocketError);
    assert!(!net.is_open());

    let engine = start(&net);
    assert!(net.is_open());
    engine.stop();
    assert!(!net.is_open());
}

#[test]
fn updates_are_reported() {
    let net = SimNetwork::new();
    net.register(printer(), printer_details());
    let engine = start(&net);

    let (notifier, rx) = Events::new();
    let _sub = engine.browse("_http._tcp", notifier).unwrap();
    assert!(matches!(next(&rx), Event::Started));
    assert!(matches!(next(&rx), Event::Found(_)));

    let mut details = printer_details();
    details.txt_records_mut().insert("note", "2nd floor");
    net.register(printer(), details);
    net.announce(&printer());
    let Event::Updated(rec) = next(&rx) else {
        panic!("expected an update");
    };
    assert_eq!(rec.txt_records().get("note"), Some(TxtRecordValue::Value(b"2nd floor")));
}
