//! Timed retransmission of mDNS queries.
//!
//! Every outstanding query has a fire time. Firing a query without having received an answer
//! reschedules it with exponential back-off (RFC 6762, section 5.2) until it has been sent
//! `max_attempts` times; browse queries are continuous and keep going at the maximum interval
//! instead.

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::service::{ServiceInstance, ServiceType};

/// What a query is asking about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryTarget {
    /// PTR enumeration of all instances of a type.
    Browse(ServiceType),
    /// Details of a single instance.
    Instance(ServiceInstance),
}

impl QueryTarget {
    pub fn instance(&self) -> Option<&ServiceInstance> {
        match self {
            QueryTarget::Browse(_) => None,
            QueryTarget::Instance(instance) => Some(instance),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryKind {
    Ptr,
    Srv,
    Txt,
    /// A and AAAA for the SRV target host, sent in one message.
    Address,
}

type QueryKey = (QueryTarget, QueryKind);

/// A query waiting to be (re)transmitted.
#[derive(Debug, Clone)]
struct PendingQuery {
    target: QueryTarget,
    /// Number of transmissions so far.
    attempt: u32,
    next_fire: Instant,
    /// Nominal interval before jitter; doubles on every transmission.
    interval: Duration,
    last_delay: Duration,
    seq: u64,
}

impl PendingQuery {
    fn is_continuous(&self) -> bool {
        matches!(self.target, QueryTarget::Browse(_))
    }
}

/// Outcome of a fired timer, returned by [`QueryScheduler::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fired {
    /// The query must be transmitted now; `attempt` counts from 1.
    Send {
        target: QueryTarget,
        kind: QueryKind,
        attempt: u32,
    },
    /// The query went unanswered `max_attempts` times and has been dropped.
    Exhausted { target: QueryTarget, kind: QueryKind },
}

/// Jittered exponential back-off.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    jitter: f64,
    rng: StdRng,
}

impl Backoff {
    /// Creates a back-off starting at `initial` and doubling up to `cap`, with every delay
    /// randomized by up to `±jitter` (a fraction, e.g. `0.1`).
    pub fn new(initial: Duration, cap: Duration, jitter: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            initial: initial.min(cap),
            cap,
            jitter: jitter.clamp(0.0, 1.0),
            rng,
        }
    }

    #[inline]
    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Returns the jittered delay for nominal `interval`.
    ///
    /// The result never exceeds the cap and is never shorter than `prev`, so successive delays
    /// of one query are non-decreasing.
    pub fn delay(&mut self, interval: Duration, prev: Duration) -> Duration {
        let factor = if self.jitter > 0.0 {
            self.rng.gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        interval.mul_f64(factor).min(self.cap).max(prev)
    }

    /// Returns the nominal interval following `interval`.
    pub fn next_interval(&self, interval: Duration) -> Duration {
        interval.saturating_mul(2).min(self.cap)
    }
}

/// Ordered set of pending queries.
#[derive(Debug)]
pub struct QueryScheduler {
    queue: BTreeMap<(Instant, u64), QueryKey>,
    pending: HashMap<QueryKey, PendingQuery>,
    backoff: Backoff,
    max_attempts: u32,
    next_seq: u64,
}

impl QueryScheduler {
    pub fn new(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            queue: BTreeMap::new(),
            pending: HashMap::new(),
            backoff,
            max_attempts: max_attempts.max(1),
            next_seq: 0,
        }
    }

    /// Schedules a query to fire immediately, unless it is already pending.
    pub fn schedule_query(&mut self, target: QueryTarget, kind: QueryKind, now: Instant) {
        let key = (target, kind);
        if self.pending.contains_key(&key) {
            return;
        }
        log::trace!("scheduling {:?} query for {:?}", key.1, key.0);
        let seq = self.next_seq;
        self.next_seq += 1;
        let query = PendingQuery {
            target: key.0.clone(),
            attempt: 0,
            next_fire: now,
            interval: self.backoff.initial(),
            last_delay: Duration::ZERO,
            seq,
        };
        self.queue.insert((now, seq), key.clone());
        self.pending.insert(key, query);
    }

    pub fn is_pending(&self, target: &QueryTarget, kind: QueryKind) -> bool {
        self.pending.contains_key(&(target.clone(), kind))
    }

    /// Fires every query that is due at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<Fired> {
        let mut fired = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            let Some(query) = self.pending.get_mut(&key) else {
                continue;
            };

            if !query.is_continuous() && query.attempt >= self.max_attempts {
                log::debug!(
                    "{:?} query for {:?} unanswered after {} attempts",
                    key.1,
                    key.0,
                    query.attempt
                );
                self.pending.remove(&key);
                fired.push(Fired::Exhausted {
                    target: key.0,
                    kind: key.1,
                });
                continue;
            }

            query.attempt += 1;
            let delay = self.backoff.delay(query.interval, query.last_delay);
            query.interval = self.backoff.next_interval(query.interval);
            query.last_delay = delay;
            query.next_fire = now + delay;
            self.queue.insert((query.next_fire, query.seq), key.clone());
            fired.push(Fired::Send {
                target: key.0,
                kind: key.1,
                attempt: query.attempt,
            });
        }
        fired
    }

    fn remove(&mut self, key: &QueryKey) -> bool {
        match self.pending.remove(key) {
            Some(query) => {
                self.queue.remove(&(query.next_fire, query.seq));
                true
            }
            None => false,
        }
    }

    /// Removes an answered query. Returns whether it was pending.
    pub fn answer(&mut self, target: &QueryTarget, kind: QueryKind) -> bool {
        self.remove(&(target.clone(), kind))
    }

    /// Removes all pending queries of an instance.
    pub fn cancel(&mut self, instance: &ServiceInstance) {
        self.cancel_target(&QueryTarget::Instance(instance.clone()));
    }

    /// Removes all pending queries for `target`.
    pub fn cancel_target(&mut self, target: &QueryTarget) {
        for kind in [QueryKind::Ptr, QueryKind::Srv, QueryKind::Txt, QueryKind::Address] {
            self.remove(&(target.clone(), kind));
        }
    }

    /// Returns the fire time of the earliest pending query.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
