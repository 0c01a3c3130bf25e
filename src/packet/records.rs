//! Resource record data.
//!
//! DNS-SD needs PTR (instance enumeration), SRV (host and port), TXT (metadata) and A/AAAA
//! (addresses). Other record types are carried as opaque bytes.

use std::{
    fmt::{self, Write as _},
    net::{Ipv4Addr, Ipv6Addr},
};

use crate::{name::DomainName, Error};

use super::{reader::Reader, writer::Writer, RecordType};

/// Trait implemented by all typed resource record data.
pub trait RecordData: Sized {
    /// The associated resource record type.
    const TYPE: RecordType;

    /// Writes the RDATA of this record.
    fn encode(&self, w: &mut RecordWriter<'_>);

    /// Decodes RDATA; `r` is limited to the RDATA of one record.
    fn decode(r: &mut RecordReader<'_>) -> Result<Self, Error>;
}

/// Encoder handed to [`RecordData::encode`].
pub struct RecordWriter<'a> {
    pub(crate) w: &'a mut Writer,
}

/// Decoder handed to [`RecordData::decode`].
pub struct RecordReader<'a> {
    pub(crate) r: Reader<'a>,
}

macro_rules! records {
    (
        $($record:ident),+ $(,)?
    ) => {
        /// Record data of a [`ResourceRecord`](super::ResourceRecord).
        #[derive(Debug, Clone, PartialEq, Eq)]
        #[non_exhaustive]
        pub enum Record {
            $( $record($record), )+
            /// A record type this library does not interpret.
            Unknown { ty: RecordType, data: Vec<u8> },
        }

        impl Record {
            pub(crate) fn decode(ty: RecordType, r: Reader<'_>) -> Result<Self, Error> {
                let r = &mut RecordReader { r };
                Ok(match ty {
                    $( RecordType::$record => Self::$record($record::decode(r)?), )+
                    _ => Self::Unknown { ty, data: r.r.buf().to_vec() },
                })
            }

            pub(crate) fn encode(&self, w: &mut Writer) {
                let w = &mut RecordWriter { w };
                match self {
                    $( Record::$record(rr) => rr.encode(w), )+
                    Record::Unknown { data, .. } => w.w.write_slice(data),
                }
            }

            pub fn record_type(&self) -> RecordType {
                match self {
                    $( Record::$record(_) => RecordType::$record, )+
                    Record::Unknown { ty, .. } => *ty,
                }
            }
        }

        $(
            impl From<$record> for Record {
                fn from(rr: $record) -> Self {
                    Self::$record(rr)
                }
            }
        )+

        impl fmt::Display for Record {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $( Record::$record(r) => r.fmt(f), )+
                    Record::Unknown { data, .. } => write!(f, "{:02x?}", data),
                }
            }
        }
    };
}

records!(A, AAAA, PTR, SRV, TXT);

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct A {
    addr: Ipv4Addr,
}

impl RecordData for A {
    const TYPE: RecordType = RecordType::A;

    fn encode(&self, w: &mut RecordWriter<'_>) {
        w.w.write_slice(&self.addr.octets())
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self, Error> {
        Ok(Self {
            addr: Ipv4Addr::from(r.r.read_array::<4>()?),
        })
    }
}

impl A {
    #[inline]
    pub fn new(addr: Ipv4Addr) -> Self {
        Self { addr }
    }

    #[inline]
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }
}

impl fmt::Display for A {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct AAAA {
    addr: Ipv6Addr,
}

impl RecordData for AAAA {
    const TYPE: RecordType = RecordType::AAAA;

    fn encode(&self, w: &mut RecordWriter<'_>) {
        w.w.write_slice(&self.addr.octets());
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self, Error> {
        Ok(Self {
            addr: Ipv6Addr::from(r.r.read_array::<16>()?),
        })
    }
}

impl AAAA {
    #[inline]
    pub fn new(addr: Ipv6Addr) -> Self {
        Self { addr }
    }

    #[inline]
    pub fn addr(&self) -> Ipv6Addr {
        self.addr
    }
}

impl fmt::Display for AAAA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

/// Pointer to another name. In DNS-SD, maps a service type to one of its instances.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PTR {
    ptrdname: DomainName,
}

impl RecordData for PTR {
    const TYPE: RecordType = RecordType::PTR;

    fn encode(&self, w: &mut RecordWriter<'_>) {
        w.w.write_domain_name(&self.ptrdname);
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self, Error> {
        Ok(Self {
            ptrdname: r.r.read_domain_name()?,
        })
    }
}

impl PTR {
    pub fn new(ptrdname: DomainName) -> Self {
        Self { ptrdname }
    }

    pub fn ptrdname(&self) -> &DomainName {
        &self.ptrdname
    }
}

impl fmt::Display for PTR {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.ptrdname.fmt(f)
    }
}

/// Text record: a list of *character strings*, interpreted as `key=value` pairs by DNS-SD.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TXT {
    // Never empty; an empty TXT record holds a single empty string on the wire.
    entries: Vec<Vec<u8>>,
}

impl RecordData for TXT {
    const TYPE: RecordType = RecordType::TXT;

    fn encode(&self, w: &mut RecordWriter<'_>) {
        for entry in &self.entries {
            w.w.write_character_string(entry);
        }
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self, Error> {
        let mut entries = Vec::new();
        while !r.r.buf().is_empty() {
            entries.push(r.r.read_character_string()?.to_vec());
        }
        if entries.is_empty() {
            // Technically invalid, but seen in the wild.
            entries.push(Vec::new());
        }
        Ok(Self { entries })
    }
}

impl TXT {
    /// Creates a [`TXT`] record from its *character strings*.
    ///
    /// Returns [`Error::InvalidValue`] if any entry is longer than 255 bytes.
    pub fn new<I, T>(entries: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<Vec<u8>>,
    {
        let mut entries: Vec<Vec<u8>> = entries.into_iter().map(Into::into).collect();
        if entries.iter().any(|e| e.len() > 255) {
            return Err(Error::InvalidValue);
        }
        if entries.is_empty() {
            entries.push(Vec::new());
        }
        Ok(Self { entries })
    }

    /// Returns an iterator over all *character string* values in this record.
    pub fn entries(&self) -> impl Iterator<Item = &'_ [u8]> {
        self.entries.iter().map(|e| &**e)
    }
}

impl fmt::Display for TXT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries().enumerate() {
            if i != 0 {
                f.write_char(' ')?;
            }
            write!(f, "\"{}\"", entry.escape_ascii())?;
        }
        Ok(())
    }
}

/// Service location: target host and port.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SRV {
    priority: u16,
    weight: u16,
    port: u16,
    target: DomainName,
}

impl RecordData for SRV {
    const TYPE: RecordType = RecordType::SRV;

    fn encode(&self, w: &mut RecordWriter<'_>) {
        w.w.write_u16(self.priority);
        w.w.write_u16(self.weight);
        w.w.write_u16(self.port);
        w.w.write_domain_name(&self.target);
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self, Error> {
        Ok(Self {
            priority: r.r.read_u16()?,
            weight: r.r.read_u16()?,
            port: r.r.read_u16()?,
            target: r.r.read_domain_name()?,
        })
    }
}

impl SRV {
    pub fn new(priority: u16, weight: u16, port: u16, target: DomainName) -> Self {
        Self {
            priority,
            weight,
            port,
            target,
        }
    }

    /// Lower values are preferred.
    #[inline]
    pub fn priority(&self) -> u16 {
        self.priority
    }

    #[inline]
    pub fn weight(&self) -> u16 {
        self.weight
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn target(&self) -> &DomainName {
        &self.target
    }
}

impl fmt::Display for SRV {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.priority, self.weight, self.port, self.target,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<R: RecordData + PartialEq + fmt::Debug>(rr: R) {
        let mut w = Writer::new();
        rr.encode(&mut RecordWriter { w: &mut w });
        let buf = w.into_inner();
        let decoded = R::decode(&mut RecordReader {
            r: Reader::new(&buf),
        })
        .unwrap();
        assert_eq!(rr, decoded);
    }

    fn domain(s: &str) -> DomainName {
        s.parse().unwrap()
    }

    #[test]
    fn typed_roundtrip() {
        roundtrip(A::new(Ipv4Addr::new(192, 168, 1, 40)));
        roundtrip(AAAA::new(Ipv6Addr::LOCALHOST));
        roundtrip(PTR::new(domain("printer._http._tcp.local")));
        roundtrip(TXT::new(["product=LaserX", "", "note"]).unwrap());
        roundtrip(SRV::new(0, 0, 631, domain("printer.local")));
    }

    #[test]
    fn txt_edge_cases() {
        assert_eq!(TXT::new(Vec::<Vec<u8>>::new()).unwrap().entries().count(), 1);
        assert_eq!(TXT::new([vec![b'x'; 256]]), Err(Error::InvalidValue));

        // Zero-length RDATA decodes to a single empty string.
        let txt = TXT::decode(&mut RecordReader { r: Reader::new(&[]) }).unwrap();
        assert_eq!(txt, TXT::new([""]).unwrap());

        // A length byte running past the RDATA is an error, not a panic.
        let err = TXT::decode(&mut RecordReader { r: Reader::new(&[4, b'a']) });
        assert_eq!(err, Err(Error::Eof));
    }

    #[test]
    fn short_address_rdata() {
        let err = A::decode(&mut RecordReader {
            r: Reader::new(&[10, 0, 0]),
        });
        assert_eq!(err, Err(Error::Eof));
    }

    #[test]
    fn display() {
        let txt = TXT::new(["a=1", "b"]).unwrap();
        assert_eq!(txt.to_string(), r#""a=1" "b""#);
        let srv = SRV::new(0, 5, 631, domain("printer.local"));
        assert_eq!(Record::from(srv).to_string(), "0 5 631 printer.local.");
    }
}
