//! Protocol state of the engine, driven by the event loop.
//!
//! [`EngineState`] performs no I/O and reads no clock: it is handed decoded inputs together with
//! the current time and leaves the packets it wants sent in an outgoing queue.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    net::IpAddr,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use crate::{
    cache::RecordCache,
    name::DomainName,
    packet::{Class, Message, Opcode, Question, RCode, Record, RecordType, ResourceRecord, PTR},
    resolver::{Resolution, ResolveState, Transition},
    scheduler::{Backoff, Fired, QueryKind, QueryScheduler, QueryTarget},
    service::{ServiceInstance, ServiceRecord, ServiceType, TxtRecords},
    Error, ErrorKind,
};

use super::{EngineConfig, SubscriptionShared};

/// Completion callback of a pending resolution.
pub(crate) type Reply = Box<dyn FnOnce(Result<ServiceRecord, Error>) + Send>;

struct Subscriber {
    id: u64,
    service_type: ServiceType,
    shared: Weak<SubscriptionShared>,
    /// Instances reported as found and not removed since.
    delivered: HashSet<ServiceInstance>,
}

impl Subscriber {
    /// Returns the subscription if its handle is alive and not cancelled.
    fn live(&self) -> Option<Arc<SubscriptionShared>> {
        self.shared.upgrade().filter(|shared| !shared.is_cancelled())
    }
}

struct Waiter {
    instance: ServiceInstance,
    deadline: Instant,
    reply: Reply,
}

#[derive(Debug, Clone, Copy)]
struct HostAddress {
    ttl: u32,
    expires_at: Instant,
}

pub(crate) struct EngineState {
    domain: DomainName,
    cache: RecordCache,
    scheduler: QueryScheduler,
    subscribers: Vec<Subscriber>,
    tracked: HashMap<ServiceInstance, Resolution>,
    /// Addresses of SRV target hosts, keyed by lowercased host name.
    hosts: HashMap<DomainName, BTreeMap<IpAddr, HostAddress>>,
    waiters: Vec<Waiter>,
    outgoing: Vec<Vec<u8>>,
}

impl EngineState {
    pub(crate) fn new(config: &EngineConfig, cache: RecordCache) -> Self {
        let backoff = Backoff::new(
            config.initial_query_interval,
            config.max_query_interval,
            config.jitter,
            config.rng_seed,
        );
        Self {
            domain: config.domain.clone(),
            cache,
            scheduler: QueryScheduler::new(backoff, config.max_query_attempts),
            subscribers: Vec::new(),
            tracked: HashMap::new(),
            hosts: HashMap::new(),
            waiters: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    pub(crate) fn browse(&mut self, shared: Arc<SubscriptionShared>, now: Instant) {
        if shared.is_cancelled() {
            return;
        }
        let service_type = shared.service_type().clone();
        log::debug!("browse #{} for {}", shared.id(), service_type);

        let notifier = shared.notifier();
        notifier.on_browse_started(&service_type);
        let mut delivered = HashSet::new();
        for record in self.cache.list(&service_type) {
            if shared.is_cancelled() {
                break;
            }
            notifier.on_service_found(&record);
            delivered.insert(record.instance().clone());
        }

        self.subscribers.push(Subscriber {
            id: shared.id(),
            service_type: service_type.clone(),
            shared: Arc::downgrade(&shared),
            delivered,
        });
        self.scheduler
            .schedule_query(QueryTarget::Browse(service_type), QueryKind::Ptr, now);
    }

    pub(crate) fn cancel_browse(&mut self, id: u64) {
        if let Some(pos) = self.subscribers.iter().position(|sub| sub.id == id) {
            let sub = self.subscribers.remove(pos);
            self.stopped(sub);
        }
    }

    /// Drops subscribers whose handle was dropped or cancelled.
    fn prune(&mut self) {
        let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.subscribers)
            .into_iter()
            .partition(|sub| sub.live().is_none());
        self.subscribers = live;
        for sub in dead {
            self.stopped(sub);
        }
    }

    fn stopped(&mut self, sub: Subscriber) {
        log::debug!("browse #{} for {} stopped", sub.id, sub.service_type);
        if let Some(shared) = sub.shared.upgrade() {
            shared.notifier().on_browse_stopped(&sub.service_type);
        }
        if self.is_browsed(&sub.service_type) {
            return;
        }

        self.scheduler
            .cancel_target(&QueryTarget::Browse(sub.service_type.clone()));
        let unwanted: Vec<_> = self
            .tracked
            .keys()
            .filter(|instance| instance.service_type() == &sub.service_type)
            .filter(|instance| !self.has_waiters(instance))
            .cloned()
            .collect();
        for instance in unwanted {
            self.untrack(&instance);
        }
    }

    fn is_browsed(&self, service_type: &ServiceType) -> bool {
        self.subscribers
            .iter()
            .any(|sub| sub.service_type == *service_type && sub.live().is_some())
    }

    fn has_waiters(&self, instance: &ServiceInstance) -> bool {
        self.waiters.iter().any(|w| w.instance == *instance)
    }

    fn is_wanted(&self, instance: &ServiceInstance) -> bool {
        self.has_waiters(instance) || self.is_browsed(instance.service_type())
    }

    fn untrack(&mut self, instance: &ServiceInstance) {
        self.scheduler.cancel(instance);
        self.tracked.remove(instance);
    }

    /// Starts resolving `instance` on behalf of a caller waiting until `deadline`.
    ///
    /// Unless `force` is set, an unexpired cached record is returned without any network traffic.
    pub(crate) fn resolve(
        &mut self,
        instance: ServiceInstance,
        deadline: Instant,
        force: bool,
        reply: Reply,
        now: Instant,
    ) {
        if !force {
            if let Some(record) = self.cache.get(&instance).filter(|rec| !rec.is_expired(now)) {
                log::debug!("resolved {} from cache", instance);
                reply(Ok(record));
                return;
            }
        }
        if deadline <= now {
            reply(Err(Error::ResolutionTimeout));
            return;
        }

        self.waiters.push(Waiter {
            instance: instance.clone(),
            deadline,
            reply,
        });
        let resolution = self
            .tracked
            .entry(instance.clone())
            .or_insert_with(|| Resolution::new(instance.clone()));
        let transition = if force {
            resolution.restart()
        } else {
            resolution.start()
        };
        self.apply(&instance, transition, now);
        self.evaluate(&instance, now);
    }

    fn apply(&mut self, instance: &ServiceInstance, transition: Transition, now: Instant) {
        let target = QueryTarget::Instance(instance.clone());
        for kind in transition.satisfied {
            self.scheduler.answer(&target, kind);
        }
        for kind in transition.wanted {
            self.scheduler.schedule_query(target.clone(), kind, now);
        }
    }

    /// Feeds known host addresses to the resolution of `instance` and acts on its new state.
    fn evaluate(&mut self, instance: &ServiceInstance, now: Instant) {
        let Some(resolution) = self.tracked.get_mut(instance) else {
            return;
        };
        if let Some(host) = resolution.host().map(DomainName::to_lowercase) {
            let (addresses, ttl) = host_addresses(self.hosts.get(&host), now);
            resolution.on_addresses(addresses, ttl);
        }
        let transition = resolution.advance();
        let record = resolution.record(now);
        self.apply(instance, transition, now);

        if let Some(record) = record {
            self.publish(record.clone());
            self.complete(instance, Ok(record));
            if !self.is_browsed(instance.service_type()) {
                self.untrack(instance);
            }
        }
    }

    fn complete(&mut self, instance: &ServiceInstance, result: Result<ServiceRecord, Error>) {
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| w.instance == *instance);
        self.waiters = waiting;
        for waiter in done {
            (waiter.reply)(result.clone());
        }
    }

    fn publish(&mut self, record: ServiceRecord) {
        let changed = self
            .cache
            .get(record.instance())
            .map_or(true, |old| !old.content_eq(&record));
        if changed {
            log::debug!("resolved {}", record);
        }
        self.cache.put(record.clone());

        let instance = record.instance();
        for sub in &mut self.subscribers {
            if sub.service_type != *instance.service_type() {
                continue;
            }
            let Some(shared) = sub.live() else {
                continue;
            };
            if sub.delivered.insert(instance.clone()) {
                shared.notifier().on_service_found(&record);
            } else if changed {
                shared.notifier().on_service_updated(&record);
            }
        }
    }

    fn withdraw(&mut self, instance: &ServiceInstance) {
        log::debug!("{} withdrawn", instance);
        if let Some(resolution) = self.tracked.get_mut(instance) {
            if resolution.on_goodbye() {
                log::debug!("resolution of {} aborted", instance);
            }
        }
        self.untrack(instance);
        self.complete(instance, Err(Error::ServiceWithdrawn));
        self.cache.remove(instance);
        self.notify_removed(instance);
    }

    fn notify_removed(&mut self, instance: &ServiceInstance) {
        for sub in &mut self.subscribers {
            if !sub.delivered.remove(instance) {
                continue;
            }
            if let Some(shared) = sub.live() {
                shared.notifier().on_service_removed(instance);
            }
        }
    }

    fn report_type_error(&self, service_type: &ServiceType, kind: ErrorKind, detail: &str) {
        for sub in &self.subscribers {
            if sub.service_type != *service_type {
                continue;
            }
            if let Some(shared) = sub.live() {
                shared.notifier().on_error(kind, detail);
            }
        }
    }

    /// Reports an error to every active subscription.
    pub(crate) fn report_error(&self, kind: ErrorKind, detail: &str) {
        for shared in self.subscribers.iter().filter_map(Subscriber::live) {
            shared.notifier().on_error(kind, detail);
        }
    }

    pub(crate) fn handle_packet(&mut self, packet: &[u8], now: Instant) {
        let msg = match Message::decode(packet) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("dropping malformed packet: {}", e);
                return;
            }
        };
        let h = msg.header();
        if !h.is_response() {
            return;
        }
        if h.opcode() != Opcode::QUERY || h.rcode() != RCode::NO_ERROR {
            log::debug!("ignoring response with opcode {} and rcode {}", h.opcode(), h.rcode());
            return;
        }
        log::trace!("response: {}", msg);

        let mut touched: Vec<ServiceInstance> = Vec::new();
        let records = || msg.data_records().filter(|rr| rr.record_class().matches(Class::IN));

        for rr in records() {
            let Record::PTR(ptr) = rr.data() else {
                continue;
            };
            let Some(service_type) = ServiceType::from_domain_name(rr.name(), &self.domain) else {
                continue;
            };
            if !self.is_browsed(&service_type) {
                continue;
            }
            let Some(instance) = ServiceInstance::from_domain_name(ptr.ptrdname(), &self.domain)
                .filter(|instance| *instance.service_type() == service_type)
            else {
                log::trace!("ignoring PTR to {}", ptr.ptrdname());
                continue;
            };

            if rr.time_to_live() == 0 {
                touched.retain(|i| *i != instance);
                self.withdraw(&instance);
                continue;
            }
            let resolution = self
                .tracked
                .entry(instance.clone())
                .or_insert_with(|| Resolution::new(instance.clone()));
            resolution.on_ptr(rr.time_to_live(), now);
            if matches!(resolution.state(), ResolveState::Idle | ResolveState::Failed(_)) {
                let transition = resolution.start();
                self.apply(&instance, transition, now);
            }
            if !touched.contains(&instance) {
                touched.push(instance);
            }
        }

        for rr in records() {
            if !matches!(rr.data(), Record::SRV(_) | Record::TXT(_)) {
                continue;
            }
            let Some(instance) = ServiceInstance::from_domain_name(rr.name(), &self.domain) else {
                continue;
            };
            if rr.time_to_live() == 0 {
                // A TXT goodbye alone does not withdraw the instance.
                let known = self.tracked.contains_key(&instance)
                    || self.cache.reader().contains(&instance);
                if matches!(rr.data(), Record::SRV(_)) && known {
                    touched.retain(|i| *i != instance);
                    self.withdraw(&instance);
                }
                continue;
            }
            let Some(resolution) = self.tracked.get_mut(&instance) else {
                continue;
            };
            match rr.data() {
                Record::SRV(srv) => {
                    resolution.on_srv(srv.target().clone(), srv.port(), rr.time_to_live())
                }
                Record::TXT(txt) => {
                    resolution.on_txt(TxtRecords::from_txt(txt), rr.time_to_live())
                }
                _ => {}
            }
            if !touched.contains(&instance) {
                touched.push(instance);
            }
        }

        let mut flushed = HashSet::new();
        let mut touched_hosts = HashSet::new();
        for rr in records() {
            let addr = match rr.data() {
                Record::A(a) => IpAddr::V4(a.addr()),
                Record::AAAA(aaaa) => IpAddr::V6(aaaa.addr()),
                _ => continue,
            };
            let host = rr.name().to_lowercase();
            let is_target = self
                .tracked
                .values()
                .any(|r| r.host().is_some_and(|h| h.eq_ignore_case(&host)));
            if !is_target {
                continue;
            }

            let entry = self.hosts.entry(host.clone()).or_default();
            // Cache-flush replaces the host's addresses of the same family, once per packet.
            if rr.is_cache_flush() && flushed.insert((host.clone(), addr.is_ipv4())) {
                entry.retain(|a, _| a.is_ipv4() != addr.is_ipv4());
            }
            if rr.time_to_live() == 0 {
                entry.remove(&addr);
            } else {
                let ttl = rr.time_to_live();
                entry.insert(
                    addr,
                    HostAddress {
                        ttl,
                        expires_at: now + Duration::from_secs(ttl.into()),
                    },
                );
            }
            touched_hosts.insert(host);
        }
        for (instance, resolution) in &self.tracked {
            let uses_host = resolution
                .host()
                .is_some_and(|h| touched_hosts.contains(&h.to_lowercase()));
            if uses_host && !touched.contains(instance) {
                touched.push(instance.clone());
            }
        }

        for instance in touched {
            self.evaluate(&instance, now);
        }
    }

    /// Runs everything that is due at `now`: resolve deadlines, cache expiry and query timers.
    pub(crate) fn handle_timers(&mut self, now: Instant) {
        self.prune();

        let (expired, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| w.deadline <= now);
        self.waiters = pending;
        for waiter in expired {
            log::warn!("resolving {} timed out", waiter.instance);
            let instance = waiter.instance.clone();
            (waiter.reply)(Err(Error::ResolutionTimeout));
            if !self.is_wanted(&instance) {
                self.untrack(&instance);
            }
        }

        for record in self.cache.expire_tick(now) {
            self.notify_removed(record.instance());
            self.untrack(record.instance());
        }

        self.expire_pointers(now);
        self.purge_hosts(now);

        for fired in self.scheduler.poll(now) {
            match fired {
                Fired::Send {
                    target,
                    kind,
                    attempt,
                } => self.send_query(&target, kind, attempt, now),
                Fired::Exhausted { target, kind } => self.exhausted(target, kind),
            }
        }
    }

    /// Forgets browsed instances whose PTR record expired without being refreshed.
    fn expire_pointers(&mut self, now: Instant) {
        let expired: Vec<_> = self
            .tracked
            .iter()
            .filter(|(_, resolution)| resolution.is_ptr_expired(now))
            .map(|(instance, _)| instance.clone())
            .collect();
        for instance in expired {
            log::debug!("PTR record of {} expired", instance);
            self.cache.remove(&instance);
            self.notify_removed(&instance);
            if !self.has_waiters(&instance) {
                self.untrack(&instance);
            } else if let Some(resolution) = self.tracked.get_mut(&instance) {
                resolution.clear_ptr();
            }
        }
    }

    fn purge_hosts(&mut self, now: Instant) {
        let targets: HashSet<DomainName> = self
            .tracked
            .values()
            .filter_map(|r| r.host().map(DomainName::to_lowercase))
            .collect();
        self.hosts.retain(|host, addrs| {
            addrs.retain(|_, a| a.expires_at > now);
            !addrs.is_empty() && targets.contains(host)
        });
    }

    fn exhausted(&mut self, target: QueryTarget, kind: QueryKind) {
        let QueryTarget::Instance(instance) = target else {
            return;
        };
        let Some(resolution) = self.tracked.get_mut(&instance) else {
            return;
        };
        if !resolution.on_timeout(kind) {
            return;
        }
        log::warn!("no answer to {:?} query for {}", kind, instance);
        self.scheduler.cancel(&instance);
        self.complete(&instance, Err(Error::ResolutionTimeout));
        self.report_type_error(
            instance.service_type(),
            ErrorKind::ResolutionTimeout,
            &format!("no answer to {kind:?} query for {instance}"),
        );
        if !self.is_browsed(instance.service_type()) {
            self.tracked.remove(&instance);
        }
    }

    fn send_query(&mut self, target: &QueryTarget, kind: QueryKind, attempt: u32, now: Instant) {
        let mut msg = Message::query();
        match (target, kind) {
            (QueryTarget::Browse(service_type), QueryKind::Ptr) => {
                let name = service_type.to_domain_name(&self.domain);
                msg.add_question(Question::new(name.clone()).ty(RecordType::PTR));
                // Known-answer suppression (RFC 6762, section 7.1). An instance is listed only
                // while both its PTR record and its cached record are less than half expired.
                let mut known: Vec<_> = self
                    .tracked
                    .iter()
                    .filter(|(instance, _)| instance.service_type() == service_type)
                    .filter_map(|(instance, resolution)| {
                        let ptr = resolution.ptr()?;
                        let record = self.cache.get(instance)?;
                        let left = record.expires_at().saturating_duration_since(now);
                        let fresh = left.as_secs() > u64::from(record.ttl() / 2);
                        let remaining = ptr.remaining(now);
                        (fresh && remaining > ptr.ttl / 2).then(|| (instance.clone(), remaining))
                    })
                    .collect();
                known.sort();
                for (instance, remaining) in known {
                    let ptr = PTR::new(instance.to_domain_name());
                    msg.add_answer(ResourceRecord::new(name.clone(), ptr).ttl(remaining));
                }
            }
            (QueryTarget::Instance(instance), QueryKind::Srv) => {
                msg.add_question(Question::new(instance.to_domain_name()).ty(RecordType::SRV));
            }
            (QueryTarget::Instance(instance), QueryKind::Txt) => {
                msg.add_question(Question::new(instance.to_domain_name()).ty(RecordType::TXT));
            }
            (QueryTarget::Instance(instance), QueryKind::Address) => {
                let Some(host) = self.tracked.get(instance).and_then(Resolution::host) else {
                    return;
                };
                msg.add_question(Question::new(host.clone()).ty(RecordType::A))
                    .add_question(Question::new(host.clone()).ty(RecordType::AAAA));
            }
            _ => {
                log::debug!("no query for {:?} {:?}", kind, target);
                return;
            }
        }

        log::debug!("sending {:?} query for {:?} (attempt {})", kind, target, attempt);
        match msg.encode() {
            Ok(packet) => self.outgoing.push(packet),
            Err(e) => log::warn!("failed to encode query: {}", e),
        }
    }

    /// Returns the earliest time [`EngineState::handle_timers`] has work to do.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        [
            self.scheduler.next_deadline(),
            self.cache.next_expiry(),
            self.waiters.iter().map(|w| w.deadline).min(),
            self.tracked
                .values()
                .filter_map(|r| r.ptr().map(|ptr| ptr.expires_at))
                .min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub(crate) fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outgoing)
    }

    /// Fails all pending resolutions and ends all subscriptions.
    pub(crate) fn shutdown(&mut self) {
        for waiter in std::mem::take(&mut self.waiters) {
            (waiter.reply)(Err(Error::EngineStopped));
        }
        for sub in std::mem::take(&mut self.subscribers) {
            if let Some(shared) = sub.live() {
                shared.notifier().on_browse_stopped(&sub.service_type);
            }
        }
        self.tracked.clear();
    }
}

/// Returns the unexpired addresses of a host and the shortest of their TTLs.
fn host_addresses(
    addrs: Option<&BTreeMap<IpAddr, HostAddress>>,
    now: Instant,
) -> (BTreeSet<IpAddr>, u32) {
    let mut set = BTreeSet::new();
    let mut ttl = u32::MAX;
    for (addr, a) in addrs.into_iter().flatten() {
        if a.expires_at > now {
            set.insert(*addr);
            ttl = ttl.min(a.ttl);
        }
    }
    (set, ttl)
}

#[cfg(test)]
mod tests {
    use std::{
        net::Ipv4Addr,
        sync::{mpsc, Mutex},
    };

    use super::*;
    use crate::{
        engine::HostNotifier,
        packet::{A, SRV, TXT},
        service::advertising::{InstanceDetails, Responder},
    };

    const SEC: Duration = Duration::from_secs(1);

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl HostNotifier for Recorder {
        fn on_service_found(&self, record: &ServiceRecord) {
            self.push(format!("found {} port={}", record.instance(), record.port()));
        }

        fn on_service_updated(&self, record: &ServiceRecord) {
            self.push(format!("updated {} port={}", record.instance(), record.port()));
        }

        fn on_service_removed(&self, instance: &ServiceInstance) {
            self.push(format!("removed {instance}"));
        }

        fn on_error(&self, kind: ErrorKind, _detail: &str) {
            self.push(format!("error {kind:?}"));
        }

        fn on_browse_stopped(&self, service_type: &ServiceType) {
            self.push(format!("stopped {service_type}"));
        }
    }

    fn domain() -> DomainName {
        DomainName::from_str("local").unwrap()
    }

    fn state() -> EngineState {
        let config = EngineConfig::new().jitter(0.0).rng_seed(1);
        EngineState::new(&config, RecordCache::new())
    }

    fn ipp() -> ServiceType {
        "_ipp._tcp".parse().unwrap()
    }

    fn printer() -> ServiceInstance {
        ServiceInstance::new("printer".parse().unwrap(), ipp(), domain())
    }

    fn host() -> DomainName {
        DomainName::from_str("printer.local").unwrap()
    }

    fn responder(port: u16) -> Responder {
        let mut details = InstanceDetails::new(host(), port);
        details.add_address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40)));
        details.txt_records_mut().insert("product", "LaserX");
        let mut responder = Responder::new(domain());
        responder.register(printer(), details);
        responder
    }

    fn announcement(port: u16) -> Vec<u8> {
        responder(port).announcement(&printer()).unwrap().encode().unwrap()
    }

    fn response(records: impl IntoIterator<Item = ResourceRecord>) -> Vec<u8> {
        let mut msg = Message::response();
        for rr in records {
            msg.add_answer(rr);
        }
        msg.encode().unwrap()
    }

    fn subscribe(
        state: &mut EngineState,
        id: u64,
        now: Instant,
    ) -> (Arc<SubscriptionShared>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let shared = Arc::new(SubscriptionShared::new(id, ipp(), recorder.clone()));
        state.browse(shared.clone(), now);
        (shared, recorder)
    }

    fn resolve(
        state: &mut EngineState,
        deadline: Instant,
        force: bool,
        now: Instant,
    ) -> mpsc::Receiver<Result<ServiceRecord, Error>> {
        let (tx, rx) = mpsc::channel();
        let reply: Reply = Box::new(move |res| {
            tx.send(res).ok();
        });
        state.resolve(printer(), deadline, force, reply, now);
        rx
    }

    fn questions(packets: &[Vec<u8>]) -> Vec<String> {
        packets
            .iter()
            .flat_map(|p| Message::decode(p).unwrap().questions().to_vec())
            .map(|q| format!("{} {:?}", q.name(), q.qtype()))
            .collect()
    }

    #[test]
    fn announcement_lifecycle() {
        let now = Instant::now();
        let mut state = state();
        let (_sub, events) = subscribe(&mut state, 0, now);
        state.handle_timers(now);
        assert_eq!(questions(&state.take_outgoing()), ["_ipp._tcp.local. PTR"]);

        state.handle_packet(&announcement(631), now);
        assert_eq!(events.take(), ["found printer._ipp._tcp.local. port=631"]);
        // Everything arrived at once, so nothing needs to be asked.
        state.handle_timers(now);
        assert!(state.take_outgoing().is_empty());

        let rec = state.cache.get(&printer()).unwrap();
        assert_eq!(rec.addresses().len(), 1);
        assert_eq!(rec.ttl(), 120);

        // Refreshes without changes are silent.
        state.handle_packet(&announcement(631), now + SEC);
        assert!(events.take().is_empty());

        state.handle_packet(&announcement(632), now + SEC);
        assert_eq!(events.take(), ["updated printer._ipp._tcp.local. port=632"]);

        let goodbye = responder(632).goodbye(&printer()).unwrap().encode().unwrap();
        state.handle_packet(&goodbye, now + SEC);
        state.handle_packet(&goodbye, now + SEC);
        assert_eq!(events.take(), ["removed printer._ipp._tcp.local."]);
        assert!(state.cache.is_empty());
        assert!(state.tracked.is_empty());
    }

    #[test]
    fn records_in_separate_packets() {
        let now = Instant::now();
        let mut state = state();
        let rx = resolve(&mut state, now + 5 * SEC, false, now);
        state.handle_timers(now);
        assert_eq!(questions(&state.take_outgoing()), ["printer._ipp._tcp.local. SRV"]);

        let name = printer().to_domain_name();
        let srv = SRV::new(0, 0, 631, host());
        state.handle_packet(&response([ResourceRecord::new(name.clone(), srv).ttl(120)]), now);
        state.handle_timers(now);
        assert_eq!(
            questions(&state.take_outgoing()),
            [
                "printer._ipp._tcp.local. TXT",
                "printer.local. A",
                "printer.local. AAAA",
            ]
        );
        assert_eq!(state.tracked[&printer()].state(), ResolveState::QueryingTxt);

        let txt = TXT::new(["product=LaserX"]).unwrap();
        state.handle_packet(&response([ResourceRecord::new(name, txt).ttl(4500)]), now);
        assert!(rx.try_recv().is_err());
        let a = A::new(Ipv4Addr::new(192, 168, 1, 40));
        state.handle_packet(&response([ResourceRecord::new(host(), a).ttl(60)]), now);

        let rec = rx.try_recv().unwrap().unwrap();
        assert_eq!(rec.port(), 631);
        assert_eq!(rec.ttl(), 60);
        assert_eq!(rec.txt_records().to_string(), "product=LaserX");
        // Not browsed, so nothing stays tracked once the result is delivered.
        assert!(state.tracked.is_empty());
        assert!(state.scheduler.is_empty());
        assert!(state.cache.get(&printer()).is_some());
    }

    #[test]
    fn resolve_deadline() {
        let now = Instant::now();
        let mut state = state();
        let rx = resolve(&mut state, now + 2 * SEC, false, now);
        state.handle_timers(now + SEC);
        assert!(rx.try_recv().is_err());
        assert_eq!(state.next_deadline(), Some(now + 2 * SEC));

        state.handle_timers(now + 2 * SEC);
        assert_eq!(rx.try_recv().unwrap().unwrap_err(), Error::ResolutionTimeout);
        assert!(state.tracked.is_empty());
        assert!(state.scheduler.is_empty());
    }

    #[test]
    fn unanswered_queries_time_out() {
        let now = Instant::now();
        let mut state = state();
        let (_sub, events) = subscribe(&mut state, 0, now);
        let rx = resolve(&mut state, now + 60 * SEC, false, now);

        let mut t = now;
        while t < now + 10 * SEC {
            state.handle_timers(t);
            state.take_outgoing();
            t = state.next_deadline().unwrap();
        }
        assert_eq!(events.take(), ["error ResolutionTimeout"]);
        assert_eq!(rx.try_recv().unwrap().unwrap_err(), Error::ResolutionTimeout);
        assert_eq!(
            state.tracked[&printer()].state(),
            ResolveState::Failed(Error::ResolutionTimeout)
        );

        // A later announcement still gets through.
        state.handle_packet(&announcement(631), t);
        assert_eq!(events.take(), ["found printer._ipp._tcp.local. port=631"]);
    }

    fn ptr(instance: &str, ttl: u32) -> ResourceRecord {
        let name = DomainName::from_str(instance).unwrap();
        ResourceRecord::new(ipp().to_domain_name(&domain()), PTR::new(name)).ttl(ttl)
    }

    fn sent_query(state: &mut EngineState) -> Message {
        let packets = state.take_outgoing();
        assert_eq!(packets.len(), 1);
        Message::decode(&packets[0]).unwrap()
    }

    #[test]
    fn unresolved_pointer_expires() {
        let now = Instant::now();
        let mut state = state();
        let (_sub, events) = subscribe(&mut state, 0, now);
        state.handle_packet(&response([ptr("ghost._ipp._tcp.local", 1)]), now);
        assert_eq!(state.tracked.len(), 1);
        assert_eq!(state.next_deadline(), Some(now));

        let mut t = now;
        while t < now + 600 * SEC {
            state.handle_timers(t);
            state.take_outgoing();
            t = state.next_deadline().unwrap();
        }
        assert!(state.tracked.is_empty());
        assert_eq!(state.scheduler.len(), 1);
        assert!(events.take().is_empty());
    }

    #[test]
    fn pointer_ttl_bounds_lifetime() {
        let now = Instant::now();
        let mut state = state();
        let (_sub, events) = subscribe(&mut state, 0, now);
        let name = printer().to_domain_name();
        let a = A::new(Ipv4Addr::new(192, 168, 1, 40));
        state.handle_packet(
            &response([
                ptr("printer._ipp._tcp.local", 10),
                ResourceRecord::new(name.clone(), SRV::new(0, 0, 631, host())).ttl(120),
                ResourceRecord::new(name, TXT::new(["product=LaserX"]).unwrap()).ttl(4500),
                ResourceRecord::new(host(), a).ttl(120),
            ]),
            now,
        );
        assert_eq!(events.take(), ["found printer._ipp._tcp.local. port=631"]);
        assert_eq!(state.cache.get(&printer()).unwrap().ttl(), 10);

        state.handle_timers(now + 9 * SEC);
        assert!(events.take().is_empty());
        state.handle_timers(now + 11 * SEC);
        assert_eq!(events.take(), ["removed printer._ipp._tcp.local."]);
        assert!(state.cache.is_empty());
        assert!(state.tracked.is_empty());
    }

    #[test]
    fn known_answers_carry_pointer_ttl() {
        let now = Instant::now();
        let mut state = state();
        let (_sub, _events) = subscribe(&mut state, 0, now);
        state.handle_timers(now);
        assert!(sent_query(&mut state).answers().is_empty());
        state.handle_packet(&announcement(631), now);

        state.handle_timers(now + SEC);
        let query = sent_query(&mut state);
        assert_eq!(query.answers().len(), 1);
        assert_eq!(query.answers()[0].time_to_live(), 4499);
        assert!(responder(631).answer(&query).is_none());

        // Once the cached record is half expired, the full answer is asked for again.
        state.handle_timers(now + 70 * SEC);
        let query = sent_query(&mut state);
        assert!(query.answers().is_empty());
        assert!(responder(631).answer(&query).is_some());
    }

    #[test]
    fn withdrawn_while_resolving() {
        let now = Instant::now();
        let mut state = state();
        let rx = resolve(&mut state, now + 5 * SEC, false, now);
        let srv = SRV::new(0, 0, 631, host());
        let goodbye = ResourceRecord::new(printer().to_domain_name(), srv).ttl(0);
        state.handle_packet(&response([goodbye]), now);
        assert_eq!(rx.try_recv().unwrap().unwrap_err(), Error::ServiceWithdrawn);
        assert!(state.scheduler.is_empty());
    }

    #[test]
    fn cached_and_forced_resolve() {
        let now = Instant::now();
        let mut state = state();
        let (_sub, _events) = subscribe(&mut state, 0, now);
        state.handle_packet(&announcement(631), now);
        state.handle_timers(now);
        state.take_outgoing();

        let rx = resolve(&mut state, now + 5 * SEC, false, now);
        assert_eq!(rx.try_recv().unwrap().unwrap().port(), 631);
        state.handle_timers(now);
        assert!(state.take_outgoing().is_empty());

        let rx = resolve(&mut state, now + 5 * SEC, true, now);
        assert!(rx.try_recv().is_err());
        state.handle_timers(now);
        assert_eq!(questions(&state.take_outgoing()), ["printer._ipp._tcp.local. SRV"]);
    }

    #[test]
    fn cache_expiry_removes() {
        let now = Instant::now();
        let mut state = state();
        let (_sub, events) = subscribe(&mut state, 0, now);
        state.handle_packet(&announcement(631), now);
        assert_eq!(events.take().len(), 1);

        state.handle_timers(now + 119 * SEC);
        assert!(events.take().is_empty());
        state.handle_timers(now + 120 * SEC);
        assert_eq!(events.take(), ["removed printer._ipp._tcp.local."]);
        assert!(state.tracked.is_empty());
    }

    #[test]
    fn browse_delivers_cached_records() {
        let now = Instant::now();
        let mut state = state();
        let (_first, _) = subscribe(&mut state, 0, now);
        state.handle_packet(&announcement(631), now);

        let (_second, events) = subscribe(&mut state, 1, now);
        assert_eq!(events.take(), ["found printer._ipp._tcp.local. port=631"]);
    }

    #[test]
    fn cancel_and_drop_subscriptions() {
        let now = Instant::now();
        let mut state = state();
        let (_cancelled, first) = subscribe(&mut state, 0, now);
        let (second_sub, second) = subscribe(&mut state, 1, now);

        state.cancel_browse(0);
        state.cancel_browse(0);
        assert_eq!(first.take(), ["stopped _ipp._tcp"]);

        state.handle_packet(&announcement(631), now);
        assert!(first.take().is_empty());
        assert_eq!(second.take().len(), 1);

        drop(second_sub);
        state.handle_timers(now);
        let browse = QueryTarget::Browse(ipp());
        assert!(!state.scheduler.is_pending(&browse, QueryKind::Ptr));
        assert!(state.tracked.is_empty());
        // The cached record outlives the subscriptions.
        assert!(state.cache.get(&printer()).is_some());
    }

    #[test]
    fn malformed_packets_are_ignored() {
        let now = Instant::now();
        let mut state = state();
        let (_sub, events) = subscribe(&mut state, 0, now);
        let packet = announcement(631);
        state.handle_packet(&[0xff; 5], now);
        state.handle_packet(&packet[..packet.len() - 3], now);
        assert!(events.take().is_empty());
        state.handle_packet(&packet, now);
        assert_eq!(events.take().len(), 1);
    }

    #[test]
    fn cache_flush_replaces_addresses() {
        let now = Instant::now();
        let mut state = state();
        let (_sub, events) = subscribe(&mut state, 0, now);
        state.handle_packet(&announcement(631), now);
        events.take();

        let addr = |last| A::new(Ipv4Addr::new(192, 168, 1, last));
        let flush = ResourceRecord::new(host(), addr(41)).ttl(120).cache_flush(true);
        state.handle_packet(&response([flush]), now);
        assert_eq!(events.take(), ["updated printer._ipp._tcp.local. port=631"]);
        let rec = state.cache.get(&printer()).unwrap();
        let addrs: Vec<_> = rec.addresses().iter().map(|a| a.to_string()).collect();
        assert_eq!(addrs, ["192.168.1.41"]);

        let shared = ResourceRecord::new(host(), addr(42)).ttl(120);
        state.handle_packet(&response([shared]), now);
        assert_eq!(events.take().len(), 1);
        assert_eq!(state.cache.get(&printer()).unwrap().addresses().len(), 2);
    }
}
