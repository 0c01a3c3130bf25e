//! Owned DNS messages.

use std::fmt;

use crate::{name::DomainName, Error};

use super::{
    reader::Reader, writer::Writer, Class, Header, Record, RecordType, MAX_MESSAGE_SIZE,
};

/// A question from the *Question* section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    name: DomainName,
    qtype: RecordType,
    class: Class,
    unicast_response: bool,
}

impl Question {
    /// Creates a question asking for all records ([`RecordType::ANY`]) in the internet class
    /// ([`Class::IN`]) pertaining to `name`.
    #[inline]
    pub fn new(name: DomainName) -> Self {
        Self {
            name,
            qtype: RecordType::ANY,
            class: Class::IN,
            unicast_response: false,
        }
    }

    /// Sets the resource type to query.
    #[inline]
    pub fn ty(self, qtype: RecordType) -> Self {
        Self { qtype, ..self }
    }

    #[inline]
    pub fn class(self, class: Class) -> Self {
        Self { class, ..self }
    }

    /// Sets the mDNS "QU" bit, asking responders to reply via unicast.
    #[inline]
    pub fn unicast_response(self, unicast_response: bool) -> Self {
        Self {
            unicast_response,
            ..self
        }
    }

    #[inline]
    pub fn name(&self) -> &DomainName {
        &self.name
    }

    #[inline]
    pub fn qtype(&self) -> RecordType {
        self.qtype
    }

    #[inline]
    pub fn qclass(&self) -> Class {
        self.class
    }

    #[inline]
    pub fn wants_unicast_response(&self) -> bool {
        self.unicast_response
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, Error> {
        let name = r.read_domain_name()?;
        let qtype = RecordType(r.read_u16()?);
        let raw_class = r.read_u16()?;
        Ok(Self {
            name,
            qtype,
            class: Class(raw_class & !Class::TOP_BIT),
            unicast_response: raw_class & Class::TOP_BIT != 0,
        })
    }

    fn write(&self, w: &mut Writer) {
        w.write_domain_name(&self.name);
        w.write_u16(self.qtype.0);
        let top = if self.unicast_response { Class::TOP_BIT } else { 0 };
        w.write_u16(self.class.0 | top);
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}\t{}", self.name, self.class, self.qtype)?;
        if self.unicast_response {
            f.write_str("\tQU")?;
        }
        Ok(())
    }
}

/// A resource record from the *Answer*, *Authority*, or *Additional Records* section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    name: DomainName,
    class: Class,
    cache_flush: bool,
    ttl: u32,
    data: Record,
}

impl ResourceRecord {
    /// Creates a record in class [`Class::IN`] with a TTL of 0.
    pub fn new(name: DomainName, data: impl Into<Record>) -> Self {
        Self {
            name,
            class: Class::IN,
            cache_flush: false,
            ttl: 0,
            data: data.into(),
        }
    }

    #[inline]
    pub fn class(self, class: Class) -> Self {
        Self { class, ..self }
    }

    #[inline]
    pub fn ttl(self, ttl: u32) -> Self {
        Self { ttl, ..self }
    }

    /// Sets the mDNS cache-flush bit, marking this record as the complete set for its name and
    /// type.
    #[inline]
    pub fn cache_flush(self, cache_flush: bool) -> Self {
        Self {
            cache_flush,
            ..self
        }
    }

    #[inline]
    pub fn name(&self) -> &DomainName {
        &self.name
    }

    #[inline]
    pub fn record_type(&self) -> RecordType {
        self.data.record_type()
    }

    #[inline]
    pub fn record_class(&self) -> Class {
        self.class
    }

    #[inline]
    pub fn is_cache_flush(&self) -> bool {
        self.cache_flush
    }

    /// Returns the entry's Time To Live, in seconds. A TTL of 0 marks a goodbye record.
    #[inline]
    pub fn time_to_live(&self) -> u32 {
        self.ttl
    }

    #[inline]
    pub fn data(&self) -> &Record {
        &self.data
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, Error> {
        let name = r.read_domain_name()?;
        let ty = RecordType(r.read_u16()?);
        let raw_class = r.read_u16()?;
        let ttl = r.read_u32()?;
        let rdlength = r.read_u16()?;
        let rdata = r.split_off(usize::from(rdlength))?;
        Ok(Self {
            name,
            class: Class(raw_class & !Class::TOP_BIT),
            cache_flush: raw_class & Class::TOP_BIT != 0,
            ttl,
            data: Record::decode(ty, rdata)?,
        })
    }

    fn write(&self, w: &mut Writer) {
        w.write_domain_name(&self.name);
        w.write_u16(self.record_type().0);
        let top = if self.cache_flush { Class::TOP_BIT } else { 0 };
        w.write_u16(self.class.0 | top);
        w.write_u32(self.ttl);
        let lenpos = w.pos();
        w.write_u16(0); // patched below
        self.data.encode(w);
        let rdata_len = w.pos() - lenpos - 2;
        // Oversized RDATA also makes the whole message exceed `MAX_MESSAGE_SIZE`, which
        // `Message::encode` rejects.
        w.patch_u16(lenpos, rdata_len.min(usize::from(u16::MAX)) as u16);
    }
}

impl fmt::Display for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}",
            self.name,
            self.ttl,
            self.class,
            self.record_type(),
            self.data,
        )?;
        if self.cache_flush {
            f.write_str("\t(flush)")?;
        }
        Ok(())
    }
}

/// A complete DNS message.
///
/// The section counts in the header always match the section contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    questions: Vec<Question>,
    answers: Vec<ResourceRecord>,
    authorities: Vec<ResourceRecord>,
    additionals: Vec<ResourceRecord>,
}

impl Message {
    /// Creates an empty message; section counts of `header` are reset.
    pub fn new(mut header: Header) -> Self {
        header.set_counts(0, 0, 0, 0);
        Self {
            header,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn query() -> Self {
        Self::new(Header::query())
    }

    pub fn response() -> Self {
        Self::new(Header::response())
    }

    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn set_id(&mut self, id: u16) {
        self.header.set_id(id);
    }

    pub fn add_question(&mut self, question: Question) -> &mut Self {
        self.questions.push(question);
        self.sync_counts();
        self
    }

    pub fn add_answer(&mut self, rr: ResourceRecord) -> &mut Self {
        self.answers.push(rr);
        self.sync_counts();
        self
    }

    pub fn add_authority(&mut self, rr: ResourceRecord) -> &mut Self {
        self.authorities.push(rr);
        self.sync_counts();
        self
    }

    pub fn add_additional(&mut self, rr: ResourceRecord) -> &mut Self {
        self.additionals.push(rr);
        self.sync_counts();
        self
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn answers(&self) -> &[ResourceRecord] {
        &self.answers
    }

    pub fn authorities(&self) -> &[ResourceRecord] {
        &self.authorities
    }

    pub fn additionals(&self) -> &[ResourceRecord] {
        &self.additionals
    }

    /// Iterates over the records a receiver should consider as data: *Answer* and *Additional*.
    pub fn data_records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.answers.iter().chain(&self.additionals)
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.answers.is_empty()
            && self.authorities.is_empty()
            && self.additionals.is_empty()
    }

    fn sync_counts(&mut self) {
        // Overflowing counts are caught by `encode`.
        let count = |n: usize| n.min(usize::from(u16::MAX)) as u16;
        self.header.set_counts(
            count(self.questions.len()),
            count(self.answers.len()),
            count(self.authorities.len()),
            count(self.additionals.len()),
        );
    }

    /// Encodes the message to wire format.
    ///
    /// Returns [`Error::Truncated`] if the message does not fit into [`MAX_MESSAGE_SIZE`] bytes.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut w = Writer::new();
        w.write_obj(self.header);
        for q in &self.questions {
            q.write(&mut w);
        }
        for rr in self.answers.iter().chain(&self.authorities).chain(&self.additionals) {
            rr.write(&mut w);
        }
        if w.pos() > MAX_MESSAGE_SIZE {
            return Err(Error::Truncated);
        }
        Ok(w.into_inner())
    }

    /// Decodes a message from wire format.
    ///
    /// Any malformed input results in an error; this never panics.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf);
        let header = r.read_obj::<Header>()?;

        let mut msg = Message {
            header,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        };
        for _ in 0..header.question_count() {
            msg.questions.push(Question::read(&mut r)?);
        }
        for _ in 0..header.answer_count() {
            msg.answers.push(ResourceRecord::read(&mut r)?);
        }
        for _ in 0..header.authority_count() {
            msg.authorities.push(ResourceRecord::read(&mut r)?);
        }
        for _ in 0..header.additional_count() {
            msg.additionals.push(ResourceRecord::read(&mut r)?);
        }
        if !r.buf().is_empty() {
            log::trace!("ignoring {} trailing bytes after message", r.buf().len());
        }
        Ok(msg)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        write!(
            f,
            ";; {} id={} opcode={} rcode={}",
            if h.is_response() { "response" } else { "query" },
            h.id(),
            h.opcode(),
            h.rcode(),
        )?;
        for q in &self.questions {
            write!(f, "\nQ: {}", q)?;
        }
        for rr in &self.answers {
            write!(f, "\nANS: {}", rr)?;
        }
        for rr in &self.authorities {
            write!(f, "\nAUTH: {}", rr)?;
        }
        for rr in &self.additionals {
            write!(f, "\nADDL: {}", rr)?;
        }
        Ok(())
    }
}
