//! TTL-bound store of resolved service records.
//!
//! The event loop is the only writer. Other threads read through a [`CacheReader`], which hands
//! out immutable snapshots; every mutation publishes a new snapshot, so readers never observe a
//! half-applied update.

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
    time::Instant,
};

use crate::service::{ServiceInstance, ServiceRecord, ServiceType};

type Snapshot = BTreeMap<ServiceInstance, ServiceRecord>;

/// Writer half of the record cache. Holds at most one record per [`ServiceInstance`].
#[derive(Debug, Default)]
pub struct RecordCache {
    reader: CacheReader,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a reader that observes every future mutation of this cache.
    pub fn reader(&self) -> CacheReader {
        self.reader.clone()
    }

    fn modify<R>(&mut self, f: impl FnOnce(&mut Snapshot) -> R) -> R {
        let mut current = self
            .reader
            .shared
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Clones the map only if a reader still holds the previous snapshot.
        f(Arc::make_mut(&mut current))
    }

    /// Inserts `record`, replacing any record for the same instance.
    ///
    /// Returns `true` if the instance was not cached before.
    pub fn put(&mut self, record: ServiceRecord) -> bool {
        log::trace!("cache put: {}", record);
        let instance = record.instance().clone();
        self.modify(|map| map.insert(instance, record).is_none())
    }

    pub fn remove(&mut self, instance: &ServiceInstance) -> Option<ServiceRecord> {
        if !self.reader.contains(instance) {
            return None;
        }
        log::trace!("cache remove: {}", instance);
        self.modify(|map| map.remove(instance))
    }

    /// Removes and returns every record whose TTL has elapsed at `now`.
    pub fn expire_tick(&mut self, now: Instant) -> Vec<ServiceRecord> {
        if !self.reader.snapshot().values().any(|rec| rec.is_expired(now)) {
            return Vec::new();
        }
        let expired = self.modify(|map| {
            let (expired, live) = std::mem::take(map)
                .into_iter()
                .partition::<Snapshot, _>(|(_, rec)| rec.is_expired(now));
            *map = live;
            expired
        });
        for instance in expired.keys() {
            log::debug!("cache entry expired: {}", instance);
        }
        expired.into_values().collect()
    }

    /// Returns the earliest time at which a record expires.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.reader
            .snapshot()
            .values()
            .map(ServiceRecord::expires_at)
            .min()
    }

    pub fn get(&self, instance: &ServiceInstance) -> Option<ServiceRecord> {
        self.reader.get(instance)
    }

    pub fn list(&self, service_type: &ServiceType) -> Vec<ServiceRecord> {
        self.reader.list(service_type)
    }

    pub fn len(&self) -> usize {
        self.reader.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only, thread-safe view of a [`RecordCache`].
#[derive(Debug, Clone, Default)]
pub struct CacheReader {
    shared: Arc<RwLock<Arc<Snapshot>>>,
}

impl CacheReader {
    /// Returns the current contents. The snapshot is not affected by later mutations.
    pub fn snapshot(&self) -> Arc<BTreeMap<ServiceInstance, ServiceRecord>> {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, instance: &ServiceInstance) -> Option<ServiceRecord> {
        self.snapshot().get(instance).cloned()
    }

    pub fn contains(&self, instance: &ServiceInstance) -> bool {
        self.snapshot().contains_key(instance)
    }

    /// Lists all cached records of `service_type`, ordered by instance.
    pub fn list(&self, service_type: &ServiceType) -> Vec<ServiceRecord> {
        self.snapshot()
            .values()
            .filter(|rec| rec.instance().service_type() == service_type)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::name::DomainName;

    fn instance(name: &str) -> ServiceInstance {
        ServiceInstance::from_domain_name(
            &DomainName::from_str(name).unwrap(),
            &DomainName::from_str("local").unwrap(),
        )
        .unwrap()
    }

    fn record(name: &str, port: u16, ttl: u32, at: Instant) -> ServiceRecord {
        ServiceRecord::new(instance(name), DomainName::from_str("host.local").unwrap(), port, at)
            .with_ttl(ttl)
    }

    #[test]
    fn put_replaces() {
        let now = Instant::now();
        let mut cache = RecordCache::new();
        assert!(cache.put(record("a._http._tcp.local", 80, 120, now)));
        assert!(!cache.put(record("A._HTTP._tcp.local", 8080, 120, now)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&instance("a._http._tcp.local")).unwrap().port(), 8080);

        assert!(cache.remove(&instance("a._http._tcp.local")).is_some());
        assert!(cache.remove(&instance("a._http._tcp.local")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn list_by_type() {
        let now = Instant::now();
        let mut cache = RecordCache::new();
        cache.put(record("b._http._tcp.local", 80, 120, now));
        cache.put(record("a._http._tcp.local", 80, 120, now));
        cache.put(record("a._ipp._tcp.local", 631, 120, now));

        let http: ServiceType = "_HTTP._tcp".parse().unwrap();
        let names: Vec<_> = cache
            .list(&http)
            .iter()
            .map(|rec| rec.instance().to_string())
            .collect();
        assert_eq!(names, ["a._http._tcp.local.", "b._http._tcp.local."]);
    }

    #[test]
    fn expiry() {
        let now = Instant::now();
        let mut cache = RecordCache::new();
        cache.put(record("short._http._tcp.local", 80, 1, now));
        cache.put(record("long._http._tcp.local", 80, 10, now));
        assert_eq!(cache.next_expiry(), Some(now + Duration::from_secs(1)));

        assert!(cache.expire_tick(now).is_empty());
        let expired = cache.expire_tick(now + Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].instance(), &instance("short._http._tcp.local"));
        assert!(cache.get(&instance("short._http._tcp.local")).is_none());
        assert_eq!(cache.next_expiry(), Some(now + Duration::from_secs(10)));

        assert_eq!(cache.expire_tick(now + Duration::from_secs(60)).len(), 1);
        assert_eq!(cache.next_expiry(), None);
    }

    #[test]
    fn snapshots_are_isolated() {
        let now = Instant::now();
        let mut cache = RecordCache::new();
        let reader = cache.reader();
        cache.put(record("a._http._tcp.local", 80, 120, now));
        let before = reader.snapshot();
        cache.put(record("a._http._tcp.local", 81, 120, now));
        cache.put(record("b._http._tcp.local", 80, 120, now));

        assert_eq!(before.len(), 1);
        assert_eq!(before.values().next().unwrap().port(), 80);
        assert_eq!(reader.snapshot().len(), 2);
        assert_eq!(reader.get(&instance("a._http._tcp.local")).unwrap().port(), 81);
    }

    #[test]
    fn concurrent_readers() {
        let now = Instant::now();
        let mut cache = RecordCache::new();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reader = cache.reader();
                thread::spawn(move || {
                    // Every snapshot observed is internally consistent.
                    for _ in 0..1000 {
                        let snap = reader.snapshot();
                        let ports: Vec<_> = snap.values().map(|rec| rec.port()).collect();
                        assert!(ports.windows(2).all(|w| w[0] == w[1]), "{ports:?}");
                    }
                })
            })
            .collect();
        for port in 0..200 {
            cache.modify(|map| {
                for name in ["a._http._tcp.local", "b._http._tcp.local"] {
                    map.insert(instance(name), record(name, port, 120, now));
                }
            });
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
