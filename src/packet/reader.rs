use std::mem::size_of;

use bytemuck::AnyBitPattern;

use crate::{
    name::{DomainName, Label},
    Error,
};

use super::U16;

/// Upper bound on compression pointers followed while reading a single name.
///
/// Pointers must also point strictly backwards, so this is a second line against crafted
/// packets; a 9000 byte message can't legitimately need more than this.
pub(crate) const MAX_POINTER_HOPS: usize = 64;

/// Cursor over a complete DNS message.
///
/// Keeps the whole message around, since compressed names can refer to any earlier offset.
#[derive(Debug, Clone)]
pub(crate) struct Reader<'a> {
    full_buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self {
            full_buf: buf,
            pos: 0,
        }
    }

    /// Returns the unread part of the message.
    pub(crate) fn buf(&self) -> &'a [u8] {
        self.full_buf.get(self.pos..).unwrap_or(&[])
    }

    pub(crate) fn read_obj<T: AnyBitPattern>(&mut self) -> Result<T, Error> {
        let bytes = self.read_slice(size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub(crate) fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(len).ok_or(Error::Eof)?;
        match self.full_buf.get(self.pos..end) {
            Some(slice) => {
                self.pos = end;
                Ok(slice)
            }
            None => Err(Error::Eof),
        }
    }

    pub(crate) fn read_array<const LEN: usize>(&mut self) -> Result<[u8; LEN], Error> {
        let mut out = [0; LEN];
        out.copy_from_slice(self.read_slice(LEN)?);
        Ok(out)
    }

    /// Returns a reader limited to the next `len` bytes and skips them in `self`.
    ///
    /// The returned reader can still follow name pointers into earlier parts of the message.
    pub(crate) fn split_off(&mut self, len: usize) -> Result<Reader<'a>, Error> {
        let end = self.pos.checked_add(len).ok_or(Error::Eof)?;
        if end > self.full_buf.len() {
            return Err(Error::Eof);
        }
        let sub = Reader {
            full_buf: &self.full_buf[..end],
            pos: self.pos,
        };
        self.pos = end;
        Ok(sub)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, Error> {
        self.read_obj::<u8>()
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(self.read_obj::<U16>()?.get())
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// Reads a `<character-string>` value.
    pub(crate) fn read_character_string(&mut self) -> Result<&'a [u8], Error> {
        let length = self.read_u8()?;
        self.read_slice(length.into())
    }

    /// Reads a possibly compressed `<domain-name>`.
    pub(crate) fn read_domain_name(&mut self) -> Result<DomainName, Error> {
        let mut labels = Vec::new();
        let mut wire_len = 1;
        let mut hops = 0;
        // Lowest offset reached so far; every pointer must go below it.
        let mut min_pos = self.pos;
        // Position in `self` after the name, fixed at the first pointer.
        let mut end = None;
        let mut cursor = self.pos;

        loop {
            let length = *self.full_buf.get(cursor).ok_or(Error::Eof)?;
            match length & 0b1100_0000 {
                0b1100_0000 => {
                    let low = *self.full_buf.get(cursor + 1).ok_or(Error::Eof)?;
                    let ptr = usize::from(u16::from_be_bytes([length, low]) & 0x3fff);
                    if ptr >= min_pos {
                        return Err(Error::PointerLoop);
                    }
                    hops += 1;
                    if hops > MAX_POINTER_HOPS {
                        return Err(Error::PointerLoop);
                    }
                    end.get_or_insert(cursor + 2);
                    min_pos = ptr;
                    cursor = ptr;
                }
                0b0000_0000 => {
                    let length = usize::from(length);
                    cursor += 1;
                    if length == 0 {
                        break;
                    }
                    let label = self
                        .full_buf
                        .get(cursor..cursor + length)
                        .ok_or(Error::Eof)?;
                    wire_len += length + 1;
                    if wire_len > DomainName::MAX_WIRE_LEN {
                        return Err(Error::NameTooLong);
                    }
                    labels.push(Label::try_new(label)?);
                    cursor += length;
                }
                // 0b01 and 0b10 label types are reserved / obsolete.
                _ => return Err(Error::InvalidValue),
            }
        }

        self.pos = end.unwrap_or(cursor);
        DomainName::from_labels(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_name() {
        let mut r = Reader::new(&[
            7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0,
        ]);
        let name = r.read_domain_name().unwrap();
        assert_eq!(name.to_string(), "example.com.");
        assert!(r.buf().is_empty());

        let mut r = Reader::new(&[0]);
        assert_eq!(r.read_domain_name().unwrap().to_string(), ".");
    }

    #[test]
    fn domain_name_pointer() {
        let mut r = Reader::new(&[
            b'_', // never read
            3, b'c', b'o', b'm', 0, // "com."
            7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0b1100_0000, 1, // "example" + ptr to 1
            0xaa,
        ]);
        r.pos = 1;
        assert_eq!(r.read_domain_name().unwrap().to_string(), "com.");
        assert_eq!(r.read_domain_name().unwrap().to_string(), "example.com.");
        assert_eq!(r.read_u8(), Ok(0xaa));
        assert_eq!(r.read_u8(), Err(Error::Eof));
    }

    #[test]
    fn pointer_out_of_bounds() {
        let mut r = Reader::new(&[0xff, 0xff]);
        assert_eq!(r.read_domain_name(), Err(Error::PointerLoop));
    }

    #[test]
    fn pointer_loops() {
        // Pointer to itself.
        let mut r = Reader::new(&[0b1100_0000, 0]);
        assert_eq!(r.read_domain_name(), Err(Error::PointerLoop));

        // Label followed by a pointer back to the label.
        let mut r = Reader::new(&[1, b'a', 0b1100_0000, 0]);
        assert_eq!(r.read_domain_name(), Err(Error::PointerLoop));

        // Two names pointing at each other.
        let mut r = Reader::new(&[1, b'a', 0b1100_0000, 4, 1, b'b', 0b1100_0000, 0]);
        r.pos = 4;
        assert_eq!(r.read_domain_name(), Err(Error::PointerLoop));
    }

    #[test]
    fn truncated_input() {
        // Half a pointer.
        assert_eq!(Reader::new(&[0b1100_0000]).read_domain_name(), Err(Error::Eof));
        // Label longer than the remaining data.
        assert_eq!(Reader::new(&[5, b'a', b'b']).read_domain_name(), Err(Error::Eof));
        // Missing terminator.
        assert_eq!(Reader::new(&[1, b'a']).read_domain_name(), Err(Error::Eof));
        // Reserved label type.
        assert_eq!(
            Reader::new(&[0b0100_0001, b'a', 0]).read_domain_name(),
            Err(Error::InvalidValue)
        );
    }

    #[test]
    fn name_too_long_via_pointers() {
        // A chain of 63-byte labels, each pointing back to the previous one.
        let mut buf = Vec::new();
        let mut prev = None;
        for _ in 0..5 {
            let start = buf.len();
            buf.push(63);
            buf.extend_from_slice(&[b'x'; 63]);
            match prev {
                Some(p) => buf.extend_from_slice(&(0xc000u16 | p as u16).to_be_bytes()),
                None => buf.push(0),
            }
            prev = Some(start);
        }
        let mut r = Reader::new(&buf);
        r.pos = prev.unwrap();
        assert_eq!(r.read_domain_name(), Err(Error::NameTooLong));
    }
}
