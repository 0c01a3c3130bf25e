//! DNS-SD service model: service types, named instances, and their resolved details.

use std::{
    cmp::Ordering,
    collections::BTreeSet,
    fmt,
    hash::{Hash, Hasher},
    net::IpAddr,
    str::FromStr,
    time::{Duration, Instant},
};

use crate::{
    name::{DomainName, Label},
    packet::TXT,
    Error,
};

pub mod advertising;
pub mod properties;

/// Transport protocol used by a service (`_tcp` or `_udp`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceTransport {
    /// Service uses TCP.
    TCP,
    /// Anything but TCP (UDP, SCTP, etc.).
    UDP,
}

impl ServiceTransport {
    fn as_str(&self) -> &'static str {
        match self {
            ServiceTransport::TCP => "_tcp",
            ServiceTransport::UDP => "_udp",
        }
    }

    pub fn to_label(&self) -> Label {
        Label::new(self.as_str())
    }

    fn from_label(label: &Label) -> Option<Self> {
        let bytes = label.as_bytes();
        if bytes.eq_ignore_ascii_case(b"_tcp") {
            Some(ServiceTransport::TCP)
        } else if bytes.eq_ignore_ascii_case(b"_udp") {
            Some(ServiceTransport::UDP)
        } else {
            None
        }
    }
}

/// A service type identifier like `_http._tcp`.
///
/// A service type is identified by a unique name ([`Label`]), and the [`ServiceTransport`] the
/// service can be reached with. Comparisons ignore ASCII case.
///
/// *Instances* of a service running on a specific machine are represented by [`ServiceInstance`].
#[derive(Clone)]
pub struct ServiceType {
    /// The service name, starting with an underscore.
    name: Label,
    transport: ServiceTransport,
}

impl ServiceType {
    /// Creates a service type from a service name like `_http`.
    ///
    /// Returns [`Error::InvalidServiceType`] if `name` does not follow the DNS-SD service name
    /// rules (RFC 6335, section 5.1).
    pub fn new(name: &str, transport: ServiceTransport) -> Result<Self, Error> {
        let name = Label::try_new(name).map_err(|_| Error::InvalidServiceType)?;
        if !is_valid_service_name(name.as_bytes()) {
            return Err(Error::InvalidServiceType);
        }
        Ok(Self { name, transport })
    }

    /// Parses `_service._proto`, optionally followed by `domain`.
    ///
    /// A trailing domain is only accepted if it matches `domain`.
    pub fn parse(s: &str, domain: &DomainName) -> Result<Self, Error> {
        let name: DomainName = s.parse().map_err(|_| Error::InvalidServiceType)?;
        let labels = match name.labels() {
            [_, _] => name.labels(),
            _ => name
                .strip_suffix_ignore_case(domain)
                .ok_or(Error::InvalidServiceType)?,
        };
        Self::from_labels(labels).ok_or(Error::InvalidServiceType)
    }

    fn from_labels(labels: &[Label]) -> Option<Self> {
        match labels {
            [name, transport] if is_valid_service_name(name.as_bytes()) => Some(Self {
                name: name.clone(),
                transport: ServiceTransport::from_label(transport)?,
            }),
            _ => None,
        }
    }

    /// Extracts the service type from a fully qualified `_service._proto.<domain>` name.
    pub fn from_domain_name(name: &DomainName, domain: &DomainName) -> Option<Self> {
        Self::from_labels(name.strip_suffix_ignore_case(domain)?)
    }

    #[inline]
    pub fn name(&self) -> &Label {
        &self.name
    }

    #[inline]
    pub fn transport(&self) -> ServiceTransport {
        self.transport
    }

    /// Returns the name PTR queries for this type are sent for: `_service._proto.<domain>`.
    pub fn to_domain_name(&self, domain: &DomainName) -> DomainName {
        DomainName::from_iter([self.name.clone(), self.transport.to_label()]).join(domain)
    }

    fn key(&self) -> (Label, ServiceTransport) {
        (self.name.to_lowercase(), self.transport)
    }
}

/// Checks the service name label: `_` followed by 1-15 letters, digits or hyphens, with at least
/// one letter and no leading, trailing or doubled hyphen.
fn is_valid_service_name(label: &[u8]) -> bool {
    let Some(name) = label.strip_prefix(b"_") else {
        return false;
    };
    (1..=15).contains(&name.len())
        && name.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        && name.iter().any(u8::is_ascii_alphabetic)
        && !name.starts_with(b"-")
        && !name.ends_with(b"-")
        && !name.windows(2).any(|w| w == b"--")
}

impl FromStr for ServiceType {
    type Err = Error;

    /// Parses `_service._proto`, optionally followed by `local.`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, &DomainName::from_iter([Label::new("local")]))
    }
}

impl PartialEq for ServiceType {
    fn eq(&self, other: &Self) -> bool {
        self.transport == other.transport && self.name.eq_ignore_case(&other.name)
    }
}

impl Eq for ServiceType {}

impl Hash for ServiceType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for ServiceType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.transport.as_str())
    }
}

impl fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A named instance of a [`ServiceType`] in a domain.
///
/// Equality, ordering and hashing ignore ASCII case; [`fmt::Display`] and the wire form keep the
/// original spelling.
#[derive(Clone)]
pub struct ServiceInstance {
    instance_name: Label,
    service_type: ServiceType,
    domain: DomainName,
}

impl ServiceInstance {
    /// Creates a new [`ServiceInstance`] from its components.
    ///
    /// `instance_name` can be a free-form string, typically identifying the machine the service is
    /// running on.
    pub fn new(instance_name: Label, service_type: ServiceType, domain: DomainName) -> Self {
        Self {
            instance_name,
            service_type,
            domain,
        }
    }

    /// Splits `<instance>._service._proto.<domain>`.
    ///
    /// Returns `None` if `name` is not an instance name of a valid service type in `domain`.
    pub fn from_domain_name(name: &DomainName, domain: &DomainName) -> Option<Self> {
        match name.strip_suffix_ignore_case(domain)? {
            [instance_name, service @ ..] => Some(Self {
                instance_name: instance_name.clone(),
                service_type: ServiceType::from_labels(service)?,
                domain: DomainName::from_iter(&name.labels()[1 + service.len()..]),
            }),
            [] => None,
        }
    }

    #[inline]
    pub fn instance_name(&self) -> &Label {
        &self.instance_name
    }

    #[inline]
    pub fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    #[inline]
    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    /// Returns the fully qualified name SRV and TXT records of this instance are published at.
    pub fn to_domain_name(&self) -> DomainName {
        let mut name = DomainName::from_iter([self.instance_name.clone()]);
        name.extend(&self.service_type.to_domain_name(&self.domain));
        name
    }

    fn key(&self) -> (Label, (Label, ServiceTransport), DomainName) {
        (
            self.instance_name.to_lowercase(),
            self.service_type.key(),
            self.domain.to_lowercase(),
        )
    }
}

impl PartialEq for ServiceInstance {
    fn eq(&self, other: &Self) -> bool {
        self.instance_name.eq_ignore_case(&other.instance_name)
            && self.service_type == other.service_type
            && self.domain.eq_ignore_case(&other.domain)
    }
}

impl Eq for ServiceInstance {}

impl Hash for ServiceInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for ServiceInstance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceInstance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.instance_name, self.service_type, self.domain)
    }
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// List of `key=value` records stored in a DNS-SD TXT record of a service instance.
///
/// Keys are matched ignoring ASCII case; the first occurrence of a key wins (RFC 6763, section
/// 6.4). Entries keep their original order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtRecords {
    entries: Vec<TxtRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TxtRecord {
    key: String,
    value: Option<Vec<u8>>,
}

impl TxtRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_txt(txt: &TXT) -> Self {
        let mut this = Self::new();

        for entry in txt.entries() {
            if entry.is_empty() {
                continue;
            }
            let (key, value) = match entry.iter().position(|&b| b == b'=') {
                Some(i) => (&entry[..i], Some(entry[i + 1..].to_vec())),
                // boolean flag
                None => (entry, None),
            };
            let key = match String::from_utf8(key.to_vec()) {
                Ok(key) if !key.is_empty() => key,
                Ok(_) => {
                    log::debug!("TXT entry without key: {}", entry.escape_ascii());
                    continue;
                }
                Err(e) => {
                    log::debug!("non-UTF-8 TXT key: {}", e);
                    continue;
                }
            };
            if this.position(&key).is_some() {
                log::debug!("TXT key '{}' already occupied, ignoring", key);
                continue;
            }
            this.entries.push(TxtRecord { key, value });
        }

        this
    }

    /// Encodes the entries as a [`TXT`] record.
    ///
    /// Returns [`Error::InvalidValue`] if an entry exceeds 255 bytes.
    pub fn to_txt(&self) -> Result<TXT, Error> {
        TXT::new(self.entries.iter().map(|rec| {
            let mut kv = rec.key.as_bytes().to_vec();
            if let Some(v) = &rec.value {
                kv.push(b'=');
                kv.extend_from_slice(v);
            }
            kv
        }))
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|rec| rec.key.eq_ignore_ascii_case(key))
    }

    fn set(&mut self, key: String, value: Option<Vec<u8>>) {
        match self.position(&key) {
            Some(i) => self.entries[i] = TxtRecord { key, value },
            None => self.entries.push(TxtRecord { key, value }),
        }
    }

    /// Adds or replaces a `key=value` entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.set(key.into(), Some(value.into()));
    }

    /// Adds or replaces a TXT record with no value.
    pub fn add_flag(&mut self, key: impl Into<String>) {
        self.set(key.into(), None);
    }

    /// Returns an iterator over all key-value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, TxtRecordValue<'_>)> {
        self.entries.iter().map(|rec| (rec.key.as_str(), rec.value()))
    }

    pub fn get(&self, key: &str) -> Option<TxtRecordValue<'_>> {
        self.position(key).map(|i| self.entries[i].value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TxtRecord {
    fn value(&self) -> TxtRecordValue<'_> {
        match &self.value {
            Some(v) => TxtRecordValue::Value(v),
            None => TxtRecordValue::NoValue,
        }
    }
}

impl fmt::Display for TxtRecords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rec) in self.entries.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }

            f.write_str(&rec.key)?;
            if let Some(v) = &rec.value {
                f.write_str("=")?;
                v.escape_ascii().fmt(f)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TxtRecordValue<'a> {
    NoValue,
    Value(&'a [u8]),
}

impl<'a> fmt::Debug for TxtRecordValue<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoValue => f.write_str("-"),
            Self::Value(v) => match std::str::from_utf8(v) {
                Ok(s) => s.fmt(f),
                Err(_) => v.escape_ascii().fmt(f),
            },
        }
    }
}

/// A fully resolved service instance, as stored in the record cache and handed to notifiers.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    instance: ServiceInstance,
    host: DomainName,
    port: u16,
    addresses: BTreeSet<IpAddr>,
    txt: TxtRecords,
    ttl: u32,
    received_at: Instant,
}

impl ServiceRecord {
    pub fn new(
        instance: ServiceInstance,
        host: DomainName,
        port: u16,
        received_at: Instant,
    ) -> Self {
        Self {
            instance,
            host,
            port,
            addresses: BTreeSet::new(),
            txt: TxtRecords::new(),
            ttl: 0,
            received_at,
        }
    }

    pub fn with_addresses(self, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
            ..self
        }
    }

    pub fn with_txt(self, txt: TxtRecords) -> Self {
        Self { txt, ..self }
    }

    /// Sets the lifetime in seconds, counted from the time the record was received.
    pub fn with_ttl(self, ttl: u32) -> Self {
        Self { ttl, ..self }
    }

    #[inline]
    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    /// Returns the [`DomainName`] of the host the service runs on (the SRV target).
    #[inline]
    pub fn host(&self) -> &DomainName {
        &self.host
    }

    /// Returns the port on which the service is listening.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn addresses(&self) -> &BTreeSet<IpAddr> {
        &self.addresses
    }

    #[inline]
    pub fn txt_records(&self) -> &TxtRecords {
        &self.txt
    }

    #[inline]
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    #[inline]
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn expires_at(&self) -> Instant {
        self.received_at + Duration::from_secs(self.ttl.into())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    /// Compares everything but TTL and reception time, to tell real updates from refreshes.
    pub fn content_eq(&self, other: &ServiceRecord) -> bool {
        self.instance == other.instance
            && self.host.eq_ignore_case(&other.host)
            && self.port == other.port
            && self.addresses == other.addresses
            && self.txt == other.txt
    }
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.instance, self.host, self.port)?;
        if !self.addresses.is_empty() {
            f.write_str(" [")?;
            for (i, addr) in self.addresses.iter().enumerate() {
                if i != 0 {
                    f.write_str(", ")?;
                }
                addr.fmt(f)?;
            }
            f.write_str("]")?;
        }
        if !self.txt.is_empty() {
            write!(f, " {}", self.txt)?;
        }
        Ok(())
    }
}
