use std::time::Duration;

use crate::name::{DomainName, Label};

/// Tunables of a discovery [`Engine`](super::Engine).
///
/// Retry counts, intervals and jitter bounds are defaults, not protocol requirements.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub(crate) domain: DomainName,
    pub(crate) max_query_attempts: u32,
    pub(crate) initial_query_interval: Duration,
    pub(crate) max_query_interval: Duration,
    pub(crate) jitter: f64,
    pub(crate) rng_seed: Option<u64>,
    pub(crate) max_reopen_attempts: u32,
    pub(crate) reopen_delay: Duration,
    pub(crate) socket_poll_interval: Duration,
    pub(crate) ipv6: bool,
}

impl EngineConfig {
    pub const DEFAULT_MAX_QUERY_ATTEMPTS: u32 = 3;
    pub const DEFAULT_INITIAL_QUERY_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_MAX_QUERY_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_JITTER: f64 = 0.1;
    pub const DEFAULT_MAX_REOPEN_ATTEMPTS: u32 = 5;
    pub const DEFAULT_REOPEN_DELAY: Duration = Duration::from_secs(1);
    pub const DEFAULT_SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(250);

    pub fn new() -> Self {
        Self {
            domain: DomainName::from_iter([Label::new("local")]),
            max_query_attempts: Self::DEFAULT_MAX_QUERY_ATTEMPTS,
            initial_query_interval: Self::DEFAULT_INITIAL_QUERY_INTERVAL,
            max_query_interval: Self::DEFAULT_MAX_QUERY_INTERVAL,
            jitter: Self::DEFAULT_JITTER,
            rng_seed: None,
            max_reopen_attempts: Self::DEFAULT_MAX_REOPEN_ATTEMPTS,
            reopen_delay: Self::DEFAULT_REOPEN_DELAY,
            socket_poll_interval: Self::DEFAULT_SOCKET_POLL_INTERVAL,
            ipv6: false,
        }
    }

    /// Sets the domain to browse in. Defaults to `local.`.
    pub fn domain(self, domain: DomainName) -> Self {
        Self { domain, ..self }
    }

    /// Sets how often an instance query is sent before giving up with a timeout.
    pub fn max_query_attempts(self, max_query_attempts: u32) -> Self {
        Self {
            max_query_attempts: max_query_attempts.max(1),
            ..self
        }
    }

    /// Sets the retransmission interval after the first query. It doubles with every further
    /// transmission, up to [`EngineConfig::max_query_interval`].
    pub fn initial_query_interval(self, initial_query_interval: Duration) -> Self {
        Self {
            initial_query_interval,
            ..self
        }
    }

    pub fn max_query_interval(self, max_query_interval: Duration) -> Self {
        Self {
            max_query_interval,
            ..self
        }
    }

    /// Sets the random jitter applied to retransmission intervals, as a fraction (`0.1` is ±10%).
    pub fn jitter(self, jitter: f64) -> Self {
        Self { jitter, ..self }
    }

    /// Seeds the jitter RNG, making retransmission times reproducible.
    pub fn rng_seed(self, seed: u64) -> Self {
        Self {
            rng_seed: Some(seed),
            ..self
        }
    }

    /// Sets how many consecutive failures to reopen the sockets are tolerated before the engine
    /// gives up.
    pub fn max_reopen_attempts(self, max_reopen_attempts: u32) -> Self {
        Self {
            max_reopen_attempts,
            ..self
        }
    }

    /// Sets the delay before the first reopen attempt; it doubles after every failure.
    pub fn reopen_delay(self, reopen_delay: Duration) -> Self {
        Self {
            reopen_delay,
            ..self
        }
    }

    /// Sets the read timeout of socket reader threads, which bounds how long closing takes.
    pub fn socket_poll_interval(self, socket_poll_interval: Duration) -> Self {
        Self {
            socket_poll_interval,
            ..self
        }
    }

    /// Enables an additional IPv6 socket joined to `ff02::fb`.
    pub fn ipv6(self, ipv6: bool) -> Self {
        Self { ipv6, ..self }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
