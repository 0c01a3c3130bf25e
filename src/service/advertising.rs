//! Service advertising: announcing local service instances and answering queries for them.

use std::{
    collections::BTreeMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use crate::{
    hex::Hex,
    name::{DomainName, Label},
    packet::{
        Class, Message, Opcode, RCode, Record, RecordType, ResourceRecord, A, AAAA, PTR, SRV,
    },
    transport, Error, MDNS_PORT, MDNS_V4_GROUP,
};

use super::{ServiceInstance, TxtRecords};

/// TTL of records tied to a host name (SRV, A, AAAA), per RFC 6762, section 10.
pub const HOST_RECORD_TTL: u32 = 120;
/// TTL of all other records (PTR, TXT).
pub const OTHER_RECORD_TTL: u32 = 4500;

/// Describes how a [`ServiceInstance`] can be reached, and supplies service metadata.
#[derive(Debug, Clone)]
pub struct InstanceDetails {
    host: DomainName,
    port: u16,
    addresses: Vec<IpAddr>,
    txt: TxtRecords,
}

impl InstanceDetails {
    pub fn new(host: DomainName, port: u16) -> Self {
        Self {
            host,
            port,
            addresses: Vec::new(),
            txt: TxtRecords::new(),
        }
    }

    /// Returns the [`DomainName`] on which the service can be found.
    #[inline]
    pub fn host(&self) -> &DomainName {
        &self.host
    }

    /// Returns the port on which the service is listening.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Adds an address to publish for the host.
    pub fn add_address(&mut self, addr: IpAddr) {
        if !self.addresses.contains(&addr) {
            self.addresses.push(addr);
        }
    }

    #[inline]
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    #[inline]
    pub fn txt_records(&self) -> &TxtRecords {
        &self.txt
    }

    #[inline]
    pub fn txt_records_mut(&mut self) -> &mut TxtRecords {
        &mut self.txt
    }
}

/// Records published for one instance.
struct InstanceRecords {
    ptr: ResourceRecord,
    srv: ResourceRecord,
    txt: ResourceRecord,
    addrs: Vec<ResourceRecord>,
}

/// Sans-IO mDNS responder for locally registered service instances.
///
/// Produces announcement and goodbye messages and answers queries; sending them is up to the
/// caller (see [`SyncAdvertiser`]).
pub struct Responder {
    domain: DomainName,
    enumeration_name: DomainName,
    instances: BTreeMap<ServiceInstance, InstanceDetails>,
}

impl Responder {
    /// Creates a responder for instances in `domain` (typically `local.`).
    pub fn new(domain: DomainName) -> Self {
        let enumeration_name =
            DomainName::from_iter(["_services", "_dns-sd", "_udp"].map(Label::new)).join(&domain);
        Self {
            domain,
            enumeration_name,
            instances: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    /// Registers (or replaces) an instance.
    ///
    /// Call [`Responder::announcement`] afterwards to tell the network about it.
    pub fn register(&mut self, instance: ServiceInstance, details: InstanceDetails) {
        log::debug!("registering {} at {}:{}", instance, details.host(), details.port());
        self.instances.insert(instance, details);
    }

    /// Removes an instance and returns the goodbye message announcing its departure.
    pub fn unregister(&mut self, instance: &ServiceInstance) -> Option<Message> {
        let msg = self.goodbye(instance);
        self.instances.remove(instance);
        msg
    }

    pub fn instances(&self) -> impl Iterator<Item = &ServiceInstance> {
        self.instances.keys()
    }

    fn records(
        &self,
        instance: &ServiceInstance,
        details: &InstanceDetails,
    ) -> Result<InstanceRecords, Error> {
        let instance_name = instance.to_domain_name();
        let addrs = details
            .addresses
            .iter()
            .map(|addr| {
                let data: Record = match addr {
                    IpAddr::V4(ip) => A::new(*ip).into(),
                    IpAddr::V6(ip) => AAAA::new(*ip).into(),
                };
                ResourceRecord::new(details.host.clone(), data)
                    .ttl(HOST_RECORD_TTL)
                    .cache_flush(true)
            })
            .collect();
        Ok(InstanceRecords {
            ptr: ResourceRecord::new(
                instance.service_type().to_domain_name(instance.domain()),
                PTR::new(instance_name.clone()),
            )
            .ttl(OTHER_RECORD_TTL),
            srv: ResourceRecord::new(
                instance_name.clone(),
                SRV::new(0, 0, details.port, details.host.clone()),
            )
            .ttl(HOST_RECORD_TTL)
            .cache_flush(true),
            txt: ResourceRecord::new(instance_name, details.txt.to_txt()?)
                .ttl(OTHER_RECORD_TTL)
                .cache_flush(true),
            addrs,
        })
    }

    /// Builds the unsolicited announcement for a registered instance: PTR, SRV and TXT as
    /// answers, addresses as additional records.
    pub fn announcement(&self, instance: &ServiceInstance) -> Option<Message> {
        let (instance, details) = self.instances.get_key_value(instance)?;
        let records = match self.records(instance, details) {
            Ok(records) => records,
            Err(e) => {
                log::warn!("cannot announce {}: {}", instance, e);
                return None;
            }
        };
        let mut msg = Message::response();
        msg.add_answer(records.ptr)
            .add_answer(records.srv)
            .add_answer(records.txt);
        for rr in records.addrs {
            msg.add_additional(rr);
        }
        Some(msg)
    }

    /// Builds a goodbye message (all records with TTL 0) for a registered instance.
    pub fn goodbye(&self, instance: &ServiceInstance) -> Option<Message> {
        let (instance, details) = self.instances.get_key_value(instance)?;
        let records = self.records(instance, details).ok()?;
        let mut msg = Message::response();
        msg.add_answer(records.ptr.ttl(0))
            .add_answer(records.srv.ttl(0))
            .add_answer(records.txt.ttl(0));
        Some(msg)
    }

    /// Answers a query, if any of its questions concern registered instances.
    ///
    /// Answers to PTR questions carry the SRV, TXT and address records as additional records, so
    /// a single round trip resolves the instance (RFC 6763, section 12).
    pub fn answer(&self, query: &Message) -> Option<Message> {
        let h = query.header();
        if !h.is_query() || h.opcode() != Opcode::QUERY || h.rcode() != RCode::NO_ERROR {
            return None;
        }

        let mut answers = Vec::new();
        let mut additionals = Vec::new();
        for q in query.questions() {
            log::debug!("Q: {q}");
            if !q.qclass().matches(Class::IN) {
                continue;
            }

            if q.name().eq_ignore_case(&self.enumeration_name)
                && q.qtype().matches(RecordType::PTR)
            {
                for instance in self.instances.keys() {
                    let ty = instance.service_type().to_domain_name(instance.domain());
                    push_unique(
                        &mut answers,
                        ResourceRecord::new(self.enumeration_name.clone(), PTR::new(ty))
                            .ttl(OTHER_RECORD_TTL),
                    );
                }
            }

            for (instance, details) in &self.instances {
                let Ok(records) = self.records(instance, details) else {
                    continue;
                };
                if q.name().eq_ignore_case(records.ptr.name())
                    && q.qtype().matches(RecordType::PTR)
                    && !is_known_answer(query, &records.ptr)
                {
                    push_unique(&mut answers, records.ptr.clone());
                    push_unique(&mut additionals, records.srv.clone());
                    push_unique(&mut additionals, records.txt.clone());
                    additionals.extend(records.addrs.iter().cloned());
                }
                if q.name().eq_ignore_case(records.srv.name()) {
                    if q.qtype().matches(RecordType::SRV) {
                        push_unique(&mut answers, records.srv.clone());
                        additionals.extend(records.addrs.iter().cloned());
                    }
                    if q.qtype().matches(RecordType::TXT) {
                        push_unique(&mut answers, records.txt.clone());
                    }
                }
                if q.name().eq_ignore_case(details.host()) {
                    for rr in &records.addrs {
                        if q.qtype().matches(rr.record_type()) {
                            push_unique(&mut answers, rr.clone());
                        }
                    }
                }
            }
        }

        if answers.is_empty() {
            return None;
        }

        let mut resp = Message::response();
        resp.set_id(h.id());
        for rr in &answers {
            log::debug!("matches: {}", rr);
        }
        let mut seen = answers.clone();
        for rr in answers {
            resp.add_answer(rr);
        }
        for rr in additionals {
            if !seen.contains(&rr) {
                seen.push(rr.clone());
                resp.add_additional(rr);
            }
        }
        Some(resp)
    }
}

/// Returns whether the querier listed `rr` as a known answer with at least half its TTL left
/// (RFC 6762, section 7.1).
fn is_known_answer(query: &Message, rr: &ResourceRecord) -> bool {
    let Record::PTR(ptr) = rr.data() else {
        return false;
    };
    query.answers().iter().any(|known| match known.data() {
        Record::PTR(known_ptr) => {
            known.name().eq_ignore_case(rr.name())
                && known_ptr.ptrdname().eq_ignore_case(ptr.ptrdname())
                && known.time_to_live() >= rr.time_to_live() / 2
        }
        _ => false,
    })
}

fn push_unique(list: &mut Vec<ResourceRecord>, rr: ResourceRecord) {
    if !list.contains(&rr) {
        list.push(rr);
    }
}

/// mDNS service advertiser: a [`Responder`] driven by a blocking multicast socket.
pub struct SyncAdvertiser {
    sock: UdpSocket,
    responder: Responder,
}

impl SyncAdvertiser {
    /// Creates an advertiser for the `local.` domain, bound to the mDNS port on `interface`.
    pub fn new(interface: Ipv4Addr) -> io::Result<Self> {
        let sock = transport::multicast_socket_v4(interface)?;
        Ok(Self {
            sock,
            responder: Responder::new(DomainName::from_iter([Label::new("local")])),
        })
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.sock
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    /// Registers an instance and announces it on the network.
    pub fn add_instance(
        &mut self,
        instance: ServiceInstance,
        details: InstanceDetails,
    ) -> io::Result<()> {
        self.responder.register(instance.clone(), details);
        if let Some(msg) = self.responder.announcement(&instance) {
            self.send(&msg, group())?;
        }
        Ok(())
    }

    /// Unregisters an instance and sends its goodbye.
    pub fn remove_instance(&mut self, instance: &ServiceInstance) -> io::Result<()> {
        if let Some(msg) = self.responder.unregister(instance) {
            self.send(&msg, group())?;
        }
        Ok(())
    }

    /// Sends goodbye messages for every registered instance.
    pub fn shutdown(&mut self) -> io::Result<()> {
        let instances: Vec<_> = self.responder.instances().cloned().collect();
        for instance in &instances {
            self.remove_instance(instance)?;
        }
        Ok(())
    }

    fn send(&self, msg: &Message, to: SocketAddr) -> io::Result<()> {
        let bytes = msg.encode()?;
        log::trace!("send to {}: {}", to, Hex(&bytes));
        self.sock.send_to(&bytes, to)?;
        Ok(())
    }

    /// Starts listening for and responding to queries.
    ///
    /// This method will not return, except when an error occurs.
    pub fn listen(&self) -> io::Result<()> {
        let mut recv_buf = vec![0; crate::packet::MAX_MESSAGE_SIZE];
        loop {
            let (len, addr) = match self.sock.recv_from(&mut recv_buf) {
                Ok(res) => res,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            };
            let packet = &recv_buf[..len];

            log::trace!("raw recv from {}: {}", addr, Hex(packet));

            if let Err(e) = self.handle_packet(addr, packet) {
                log::debug!("failed to handle packet: {}", e);
            }
        }
    }

    fn handle_packet(&self, sender: SocketAddr, packet: &[u8]) -> io::Result<()> {
        let query = Message::decode(packet)?;
        let Some(resp) = self.responder.answer(&query) else {
            return Ok(());
        };
        // Legacy unicast resolvers (source port != 5353) and QU questions get a direct reply.
        let unicast = sender.port() != MDNS_PORT
            || query.questions().iter().any(|q| q.wants_unicast_response());
        self.send(&resp, if unicast { sender } else { group() })
    }
}

fn group() -> SocketAddr {
    (MDNS_V4_GROUP, MDNS_PORT).into()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;
    use crate::packet::Question;

    fn local() -> DomainName {
        DomainName::from_str("local").unwrap()
    }

    fn printer() -> (Responder, ServiceInstance) {
        let mut responder = Responder::new(local());
        let instance = ServiceInstance::from_domain_name(
            &DomainName::from_str("printer._http._tcp.local").unwrap(),
            &local(),
        )
        .unwrap();
        let mut details = InstanceDetails::new(DomainName::from_str("printer.local").unwrap(), 631);
        details.add_address(Ipv4Addr::new(192, 168, 1, 40).into());
        details.add_address(Ipv6Addr::LOCALHOST.into());
        details.txt_records_mut().insert("product", "LaserX");
        responder.register(instance.clone(), details);
        (responder, instance)
    }

    fn query(name: &str, ty: RecordType) -> Message {
        let mut msg = Message::query();
        msg.add_question(Question::new(DomainName::from_str(name).unwrap()).ty(ty));
        msg
    }

    #[test]
    fn announcement_and_goodbye() {
        let (mut responder, instance) = printer();
        let msg = responder.announcement(&instance).unwrap();
        assert!(msg.header().is_response());
        let types: Vec<_> = msg.answers().iter().map(|rr| rr.record_type()).collect();
        assert_eq!(types, [RecordType::PTR, RecordType::SRV, RecordType::TXT]);
        assert_eq!(msg.additionals().len(), 2);
        assert!(!msg.answers()[0].is_cache_flush());
        assert!(msg.answers()[1].is_cache_flush());

        let bye = responder.unregister(&instance).unwrap();
        assert!(bye.answers().iter().all(|rr| rr.time_to_live() == 0));
        assert!(responder.announcement(&instance).is_none());
        assert!(responder.unregister(&instance).is_none());
    }

    #[test]
    fn answers_ptr_with_additionals() {
        let (responder, _) = printer();
        let resp = responder.answer(&query("_HTTP._tcp.local", RecordType::PTR)).unwrap();
        assert_eq!(resp.answers().len(), 1);
        match resp.answers()[0].data() {
            Record::PTR(ptr) => assert_eq!(ptr.ptrdname().to_string(), "printer._http._tcp.local."),
            other => panic!("unexpected {other:?}"),
        }
        let types: Vec<_> = resp.additionals().iter().map(|rr| rr.record_type()).collect();
        assert_eq!(types, [RecordType::SRV, RecordType::TXT, RecordType::A, RecordType::AAAA]);
    }

    #[test]
    fn answers_specific_types() {
        let (responder, _) = printer();
        let resp = responder.answer(&query("printer._http._tcp.local", RecordType::ANY)).unwrap();
        assert_eq!(resp.answers().len(), 2);
        let resp = responder.answer(&query("printer.local", RecordType::A)).unwrap();
        assert_eq!(resp.answers().len(), 1);
        let resp = responder
            .answer(&query("_services._dns-sd._udp.local", RecordType::PTR))
            .unwrap();
        assert_eq!(resp.answers().len(), 1);

        assert!(responder.answer(&query("_ipp._tcp.local", RecordType::PTR)).is_none());
        assert!(responder.answer(&query("printer.local", RecordType::TXT)).is_none());

        // Responses are never answered.
        let mut bytes = query("printer.local", RecordType::A).encode().unwrap();
        bytes[2] |= 0x80;
        assert!(responder.answer(&Message::decode(&bytes).unwrap()).is_none());
    }

    #[test]
    fn known_answers_are_suppressed() {
        let (responder, instance) = printer();
        let ptr = |ttl| {
            ResourceRecord::new(
                DomainName::from_str("_http._tcp.local").unwrap(),
                PTR::new(instance.to_domain_name()),
            )
            .ttl(ttl)
        };

        let mut fresh = query("_http._tcp.local", RecordType::PTR);
        fresh.add_answer(ptr(OTHER_RECORD_TTL / 2));
        assert!(responder.answer(&fresh).is_none());

        let mut stale = query("_http._tcp.local", RecordType::PTR);
        stale.add_answer(ptr(OTHER_RECORD_TTL / 2 - 1));
        assert_eq!(responder.answer(&stale).unwrap().answers().len(), 1);
    }
}
