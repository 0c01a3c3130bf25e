//! mDNS message decoder and encoder.

#[macro_use]
mod macros;
pub mod message;
mod reader;
pub mod records;
mod writer;

use core::fmt;

use bitflags::bitflags;

pub use message::{Message, Question, ResourceRecord};
pub use records::{Record, A, AAAA, PTR, SRV, TXT};

/// Upper bound for an mDNS message, excluding IP and UDP headers (RFC 6762, section 17).
pub const MAX_MESSAGE_SIZE: usize = 9000;

wire_enum! {
    /// DNS message operation codes.
    pub enum Opcode: u8 {
        /// Query (or response to a query). The only opcode used by mDNS.
        QUERY = 0,
        IQUERY = 1,
        STATUS = 2,
        NOTIFY = 4,
        UPDATE = 5,
    }
}

wire_enum! {
    /// Server response codes.
    ///
    /// mDNS responders always send [`RCode::NO_ERROR`]; messages with any other value are ignored.
    pub enum RCode: u8 {
        NO_ERROR = 0,
        FORM_ERR = 1,
        SERV_FAIL = 2,
        NX_DOMAIN = 3,
        NOT_IMP = 4,
        REFUSED = 5,
    }
}

wire_enum! {
    /// Resource record types, plus the `ANY` query type.
    pub enum RecordType: u16 {
        A = 1,
        NS = 2,
        CNAME = 5,
        PTR = 12,
        HINFO = 13,
        TXT = 16,
        AAAA = 28,
        SRV = 33,
        OPT = 41,
        NSEC = 47,
        /// Query is for all record types.
        ANY = 255,
    }
}

impl RecordType {
    /// Returns whether a question for `self` is answered by a record of type `ty`.
    pub fn matches(&self, ty: RecordType) -> bool {
        *self == Self::ANY || *self == ty
    }
}

wire_enum! {
    /// Resource record classes.
    ///
    /// The top bit of the class field is repurposed by mDNS (cache-flush / unicast-response) and
    /// is stored separately; see [`ResourceRecord::cache_flush`] and
    /// [`Question::unicast_response`].
    pub enum Class: u16 {
        /// The Internet.
        IN = 1,
        /// Query is for all classes of resource.
        ANY = 255,
    }
}

impl Class {
    pub(crate) const TOP_BIT: u16 = 0x8000;

    pub fn matches(&self, class: Class) -> bool {
        *self == Self::ANY || *self == class
    }
}

/// Big-endian `u16` as it appears on the wire.
#[derive(Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(transparent)]
struct U16(u16);

impl U16 {
    fn get(self) -> u16 {
        u16::from_be(self.0)
    }
}

impl From<u16> for U16 {
    fn from(value: u16) -> Self {
        Self(value.to_be())
    }
}

// Bit positions in the header flags are inverted, because RFC 1035 starts counting at the MSb.
const fn be_pos(pos: u16) -> u16 {
    15 - pos
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    struct HeaderFlags: u16 {
        /// If set, the message is a response to a query. If unset, it is a query.
        const QR = 1 << be_pos(0);
        const OPCODE = Self::OPCODE_MASK;
        /// Authoritative answer. Set on every mDNS response.
        const AA = 1 << be_pos(5);
        /// Truncated. In mDNS queries this means more known answers follow in another packet.
        const TC = 1 << be_pos(6);
        const RD = 1 << be_pos(7);
        const RA = 1 << be_pos(8);
        const Z = 0b111 << be_pos(9);
        const RCODE = Self::RCODE_MASK;
    }
}

impl HeaderFlags {
    const OPCODE_POS: u16 = 11;
    const OPCODE_MASK: u16 = 0b1111 << Self::OPCODE_POS;

    const RCODE_POS: u16 = 0;
    const RCODE_MASK: u16 = 0b1111 << Self::RCODE_POS;
}

/// Message header.
///
/// The section counts are maintained by [`Message`] and can't be set directly.
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C, packed)]
pub struct Header {
    id: U16,
    flags: U16,
    qdcount: U16,
    ancount: U16,
    nscount: U16,
    arcount: U16,
}

impl Header {
    /// Header of an mDNS query. mDNS queries use ID 0.
    pub fn query() -> Self {
        Self::default()
    }

    /// Header of an mDNS response: `QR` and `AA` set, ID 0.
    pub fn response() -> Self {
        let mut h = Self::default();
        h.set_response(true);
        h.set_authority(true);
        h
    }

    fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_retain(self.flags.get())
    }

    fn modify_flags(&mut self, with: impl FnOnce(&mut HeaderFlags)) {
        let mut flags = self.flags();
        with(&mut flags);
        self.flags = flags.bits().into();
    }

    /// Returns the 16-bit message ID.
    #[inline]
    pub fn id(&self) -> u16 {
        self.id.get()
    }

    #[inline]
    pub fn set_id(&mut self, id: u16) {
        self.id = id.into();
    }

    #[inline]
    pub fn is_query(&self) -> bool {
        !self.is_response()
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.flags().contains(HeaderFlags::QR)
    }

    pub fn set_response(&mut self, is_response: bool) {
        self.modify_flags(|f| f.set(HeaderFlags::QR, is_response));
    }

    pub fn is_truncated(&self) -> bool {
        self.flags().contains(HeaderFlags::TC)
    }

    pub fn set_truncated(&mut self, trunc: bool) {
        self.modify_flags(|f| f.set(HeaderFlags::TC, trunc));
    }

    pub fn is_authority(&self) -> bool {
        self.flags().contains(HeaderFlags::AA)
    }

    pub fn set_authority(&mut self, aa: bool) {
        self.modify_flags(|f| f.set(HeaderFlags::AA, aa));
    }

    pub fn opcode(&self) -> Opcode {
        let bits = self.flags().bits();
        Opcode(((bits & HeaderFlags::OPCODE_MASK) >> HeaderFlags::OPCODE_POS) as u8)
    }

    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.modify_flags(|f| {
            let bits = (f.bits() & !HeaderFlags::OPCODE_MASK)
                | ((u16::from(opcode.0) << HeaderFlags::OPCODE_POS) & HeaderFlags::OPCODE_MASK);
            *f = HeaderFlags::from_bits_retain(bits);
        });
    }

    pub fn rcode(&self) -> RCode {
        let bits = self.flags().bits();
        RCode(((bits & HeaderFlags::RCODE_MASK) >> HeaderFlags::RCODE_POS) as u8)
    }

    pub fn set_rcode(&mut self, rcode: RCode) {
        self.modify_flags(|f| {
            let bits = (f.bits() & !HeaderFlags::RCODE_MASK)
                | ((u16::from(rcode.0) << HeaderFlags::RCODE_POS) & HeaderFlags::RCODE_MASK);
            *f = HeaderFlags::from_bits_retain(bits);
        });
    }

    pub fn question_count(&self) -> u16 {
        self.qdcount.get()
    }

    pub fn answer_count(&self) -> u16 {
        self.ancount.get()
    }

    pub fn authority_count(&self) -> u16 {
        self.nscount.get()
    }

    pub fn additional_count(&self) -> u16 {
        self.arcount.get()
    }

    fn set_counts(&mut self, qd: u16, an: u16, ns: u16, ar: u16) {
        self.qdcount = qd.into();
        self.ancount = an.into();
        self.nscount = ns.into();
        self.arcount = ar.into();
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        bytemuck::bytes_of(self) == bytemuck::bytes_of(other)
    }
}

impl Eq for Header {}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("id", &self.id())
            .field("flags", &self.flags())
            .field("qdcount", &self.question_count())
            .field("ancount", &self.answer_count())
            .field("nscount", &self.authority_count())
            .field("arcount", &self.additional_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header() {
        let mut h = Header::default();
        assert!(h.is_query());
        assert!(!h.is_authority());
        assert!(!h.is_truncated());

        assert_eq!(h.opcode(), Opcode::QUERY);
        h.set_opcode(Opcode::UPDATE);
        assert_eq!(h.opcode(), Opcode::UPDATE);
        h.set_opcode(Opcode::QUERY);
        assert_eq!(h.opcode(), Opcode::QUERY);

        assert_eq!(h.rcode(), RCode::NO_ERROR);
        h.set_rcode(RCode::REFUSED);
        assert_eq!(h.rcode(), RCode::REFUSED);
        h.set_rcode(RCode::NO_ERROR);
        assert_eq!(h.rcode(), RCode::NO_ERROR);

        let r = Header::response();
        assert!(r.is_response() && r.is_authority());
        assert_eq!(bytemuck::bytes_of(&r), &[0, 0, 0x84, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn unknown_values_are_preserved() {
        assert_eq!(format!("{:?}", RecordType(99)), "(unknown RecordType: 0x63)");
        assert_eq!(RecordType::SRV.to_string(), "SRV");
        assert!(RecordType::ANY.matches(RecordType::TXT));
        assert!(!RecordType::A.matches(RecordType::AAAA));
        assert!(Class::ANY.matches(Class::IN));
    }
}
