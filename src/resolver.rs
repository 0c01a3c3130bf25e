//! Per-instance resolution state machine.
//!
//! A [`Resolution`] collects the SRV, TXT and address records of one [`ServiceInstance`] and
//! tells the engine which queries are still needed. It performs no I/O and keeps no timers; the
//! engine feeds it records and scheduler outcomes.

use std::{
    collections::BTreeSet,
    net::IpAddr,
    time::{Duration, Instant},
};

use crate::{
    name::DomainName,
    scheduler::QueryKind,
    service::{ServiceInstance, ServiceRecord, TxtRecords},
    Error,
};

/// Progress of a [`Resolution`].
///
/// After the SRV record is known, the TXT and address queries run concurrently; the state names
/// the earliest requirement that is still unmet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    Idle,
    QueryingSrv,
    QueryingTxt,
    QueryingAddress,
    Resolved,
    Failed(Error),
}

impl ResolveState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResolveState::Resolved | ResolveState::Failed(_))
    }
}

#[derive(Debug, Clone)]
struct Srv {
    host: DomainName,
    port: u16,
    ttl: u32,
}

/// Queries to add and remove after a state change, see [`Resolution::advance`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transition {
    pub wanted: Vec<QueryKind>,
    pub satisfied: Vec<QueryKind>,
}

/// The PTR record naming an instance in a browse response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pointer {
    pub ttl: u32,
    pub expires_at: Instant,
}

impl Pointer {
    /// Returns the TTL left at `now`, in whole seconds.
    pub fn remaining(&self, now: Instant) -> u32 {
        let secs = self.expires_at.saturating_duration_since(now).as_secs();
        u32::try_from(secs).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    instance: ServiceInstance,
    state: ResolveState,
    ptr: Option<Pointer>,
    srv: Option<Srv>,
    txt: Option<(TxtRecords, u32)>,
    addresses: Option<(BTreeSet<IpAddr>, u32)>,
}

impl Resolution {
    pub fn new(instance: ServiceInstance) -> Self {
        Self {
            instance,
            state: ResolveState::Idle,
            ptr: None,
            srv: None,
            txt: None,
            addresses: None,
        }
    }

    #[inline]
    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    #[inline]
    pub fn state(&self) -> ResolveState {
        self.state
    }

    /// Returns the SRV target, once known. Address queries are sent for this name.
    pub fn host(&self) -> Option<&DomainName> {
        self.srv.as_ref().map(|srv| &srv.host)
    }

    /// Returns the PTR record that led to this instance, if it was found by browsing.
    pub fn ptr(&self) -> Option<Pointer> {
        self.ptr
    }

    /// Records a (refreshed) PTR record for the instance, received at `now`.
    pub fn on_ptr(&mut self, ttl: u32, now: Instant) {
        self.ptr = Some(Pointer {
            ttl,
            expires_at: now + Duration::from_secs(ttl.into()),
        });
    }

    /// Returns whether the instance was found by browsing and its PTR record has expired.
    pub fn is_ptr_expired(&self, now: Instant) -> bool {
        self.ptr.is_some_and(|ptr| ptr.expires_at <= now)
    }

    pub fn clear_ptr(&mut self) {
        self.ptr = None;
    }

    /// Starts (or restarts after a failure) resolving.
    pub fn start(&mut self) -> Transition {
        if matches!(self.state, ResolveState::Idle | ResolveState::Failed(_)) {
            self.set_state(ResolveState::QueryingSrv);
        }
        self.advance()
    }

    /// Forgets everything learned so far and starts over, for a forced refresh.
    pub fn restart(&mut self) -> Transition {
        self.srv = None;
        self.txt = None;
        self.addresses = None;
        self.set_state(ResolveState::Idle);
        self.start()
    }

    /// Records SRV data. A changed target host invalidates the known addresses.
    pub fn on_srv(&mut self, host: DomainName, port: u16, ttl: u32) {
        if let Some(old) = &self.srv {
            if !old.host.eq_ignore_case(&host) {
                self.addresses = None;
            }
        }
        self.srv = Some(Srv { host, port, ttl });
    }

    pub fn on_txt(&mut self, txt: TxtRecords, ttl: u32) {
        self.txt = Some((txt, ttl));
    }

    /// Records the complete address set of the SRV target host.
    pub fn on_addresses(&mut self, addresses: BTreeSet<IpAddr>, ttl: u32) {
        if addresses.is_empty() {
            self.addresses = None;
        } else {
            self.addresses = Some((addresses, ttl));
        }
    }

    /// Handles a goodbye for the instance. Fails an in-progress resolution with
    /// [`Error::ServiceWithdrawn`] and returns whether it did.
    pub fn on_goodbye(&mut self) -> bool {
        self.srv = None;
        self.txt = None;
        self.addresses = None;
        if self.state.is_terminal() || self.state == ResolveState::Idle {
            return false;
        }
        self.set_state(ResolveState::Failed(Error::ServiceWithdrawn));
        true
    }

    /// Handles exhaustion of one of the queries. Fails an in-progress resolution with
    /// [`Error::ResolutionTimeout`] and returns whether it did.
    pub fn on_timeout(&mut self, kind: QueryKind) -> bool {
        if self.state.is_terminal() || self.state == ResolveState::Idle {
            return false;
        }
        log::debug!("{:?} query for {} timed out", kind, self.instance);
        self.set_state(ResolveState::Failed(Error::ResolutionTimeout));
        true
    }

    /// Recomputes the state from the data collected so far.
    ///
    /// Returns the queries that should be pending now and those that no longer need to be.
    pub fn advance(&mut self) -> Transition {
        let mut t = Transition::default();
        if matches!(self.state, ResolveState::Idle | ResolveState::Failed(_)) {
            return t;
        }

        let mut need = |kind, missing: bool| {
            if missing {
                t.wanted.push(kind);
            } else {
                t.satisfied.push(kind);
            }
        };
        need(QueryKind::Srv, self.srv.is_none());
        if self.srv.is_none() {
            self.set_state(ResolveState::QueryingSrv);
            return t;
        }
        need(QueryKind::Txt, self.txt.is_none());
        need(QueryKind::Address, self.addresses.is_none());

        let next = if self.txt.is_none() {
            ResolveState::QueryingTxt
        } else if self.addresses.is_none() {
            ResolveState::QueryingAddress
        } else {
            ResolveState::Resolved
        };
        self.set_state(next);
        t
    }

    /// Builds the service record, once resolution has completed.
    ///
    /// The record lives as long as its shortest-lived component, including the PTR record if
    /// the instance was found by browsing.
    pub fn record(&self, now: Instant) -> Option<ServiceRecord> {
        if self.state != ResolveState::Resolved {
            return None;
        }
        let srv = self.srv.as_ref()?;
        let (txt, txt_ttl) = self.txt.as_ref()?;
        let (addresses, addr_ttl) = self.addresses.as_ref()?;
        let ptr_ttl = self.ptr.map_or(u32::MAX, |ptr| ptr.remaining(now));
        Some(
            ServiceRecord::new(self.instance.clone(), srv.host.clone(), srv.port, now)
                .with_addresses(addresses.iter().copied())
                .with_txt(txt.clone())
                .with_ttl(srv.ttl.min(*txt_ttl).min(*addr_ttl).min(ptr_ttl)),
        )
    }

    fn set_state(&mut self, state: ResolveState) {
        if self.state != state {
            log::debug!("{}: {:?} -> {:?}", self.instance, self.state, state);
            self.state = state;
        }
    }
}
