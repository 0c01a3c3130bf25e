use std::collections::HashMap;

use bytemuck::NoUninit;

use crate::name::{DomainName, Label};

/// Offsets above this can't be the target of a compression pointer.
const MAX_POINTER_TARGET: usize = 0x3fff;

/// Growable message buffer with name compression.
///
/// Compression only reuses exact-case suffixes of names written earlier, so the same logical
/// message always produces the same bytes.
pub(crate) struct Writer {
    buf: Vec<u8>,
    names: HashMap<Vec<Label>, usize>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::with_capacity(512),
            names: HashMap::new(),
        }
    }

    pub(crate) fn pos(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn write_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn write_obj<T: NoUninit>(&mut self, obj: T) {
        self.write_slice(bytemuck::bytes_of(&obj))
    }

    pub(crate) fn write_u8(&mut self, b: u8) {
        self.buf.push(b);
    }

    pub(crate) fn write_u16(&mut self, v: u16) {
        self.write_slice(&v.to_be_bytes());
    }

    pub(crate) fn write_u32(&mut self, v: u32) {
        self.write_slice(&v.to_be_bytes());
    }

    /// Overwrites a previously written big-endian `u16`.
    pub(crate) fn patch_u16(&mut self, pos: usize, v: u16) {
        self.buf[pos..pos + 2].copy_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn write_domain_name(&mut self, name: &DomainName) {
        let labels = name.labels();
        for i in 0..labels.len() {
            let suffix = &labels[i..];
            if let Some(&offset) = self.names.get(suffix) {
                self.write_u16(0xc000 | offset as u16);
                return;
            }
            let here = self.pos();
            if here <= MAX_POINTER_TARGET {
                self.names.insert(suffix.to_vec(), here);
            }
            let label = suffix[0].as_bytes();
            self.write_u8(label.len() as u8);
            self.write_slice(label);
        }
        // Implicit root label at the end.
        self.write_u8(0);
    }

    /// Writes a `<character-string>`; callers guarantee `string.len() <= 255`.
    pub(crate) fn write_character_string(&mut self, string: &[u8]) {
        let len = string.len().min(255);
        self.write_u8(len as u8);
        self.write_slice(&string[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compresses_repeated_suffixes() {
        let mut w = Writer::new();
        w.write_domain_name(&DomainName::from_str("_http._tcp.local").unwrap());
        w.write_domain_name(&DomainName::from_str("printer._http._tcp.local").unwrap());
        w.write_domain_name(&DomainName::from_str("PRINTER._http._tcp.local").unwrap());
        assert_eq!(
            w.into_inner(),
            [
                &b"\x05_http\x04_tcp\x05local\x00"[..],
                b"\x07printer\xc0\x00",
                b"\x07PRINTER\xc0\x00",
            ]
            .concat()
        );
    }
}
