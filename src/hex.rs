use std::fmt;

/// Formats a byte slice as lowercase hex, for trace logging of raw packets.
///
/// Output is capped at [`Hex::MAX_BYTES`] bytes, followed by a `+N` suffix.
pub(crate) struct Hex<'a>(pub &'a [u8]);

impl<'a> Hex<'a> {
    const MAX_BYTES: usize = 512;
}

impl<'a> fmt::Display for Hex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.0[..self.0.len().min(Self::MAX_BYTES)];
        for byte in shown {
            write!(f, "{:02x}", byte)?;
        }
        if shown.len() < self.0.len() {
            write!(f, "+{}", self.0.len() - shown.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn parse(s: &str) -> Vec<u8> {
    assert!(s.is_ascii());
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();

    let mut buf = Vec::new();
    for i in (0..s.len()).step_by(2) {
        buf.push(u8::from_str_radix(&s[i..i + 2], 16).unwrap());
    }
    buf
}
