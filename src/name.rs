//! Domain names and labels.

use std::{
    fmt::{self, Write},
    slice,
    str::FromStr,
};

use crate::Error;

/// A `.`-separated component of a [`DomainName`].
///
/// Labels consist of arbitrary bytes and have a maximum length of 63 bytes. This type can only
/// represent non-empty labels, so the minimum length is 1 byte.
///
/// Equality is byte-exact; DNS comparisons that must ignore ASCII case go through
/// [`Label::eq_ignore_case`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    // Guaranteed to contain >0 and at most `Label::MAX_LEN` bytes.
    bytes: Box<[u8]>,
}

impl Label {
    /// The maximum length of a domain label.
    pub const MAX_LEN: usize = 0b0011_1111;

    /// Creates a [`Label`] from raw bytes or a string slice, panicking if the bytes are an invalid
    /// label.
    ///
    /// # Panics
    ///
    /// This function will panic if `label` is empty or contains more than [`Self::MAX_LEN`] bytes.
    pub fn new(label: impl AsRef<[u8]>) -> Self {
        let label = label.as_ref();
        Self::try_new(label)
            .unwrap_or_else(|_| panic!("`Label::new` called with invalid data: {:?}", label))
    }

    /// Creates a [`Label`] from raw bytes or a string slice, returning an error if the bytes are
    /// an invalid label.
    pub fn try_new(label: impl AsRef<[u8]>) -> Result<Self, Error> {
        let label = label.as_ref();
        if label.is_empty() {
            return Err(Error::InvalidEmptyLabel);
        }
        if label.len() > Self::MAX_LEN {
            return Err(Error::LabelTooLong);
        }

        Ok(Self {
            bytes: label.into(),
        })
    }

    /// Returns the raw bytes of this label.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the label as UTF-8, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    #[inline]
    pub fn eq_ignore_case(&self, other: &Label) -> bool {
        self.bytes.eq_ignore_ascii_case(&other.bytes)
    }

    /// Returns a copy of this label with ASCII letters lowercased.
    pub fn to_lowercase(&self) -> Label {
        Label {
            bytes: self.bytes.to_ascii_lowercase().into(),
        }
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#""{}""#, self.as_bytes().escape_ascii())
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Service instance names are free-form UTF-8, show them as such.
        match self.as_str() {
            Some(s) => f.write_str(s),
            None => self.as_bytes().escape_ascii().fmt(f),
        }
    }
}

impl FromStr for Label {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_new(s)
    }
}

/// A domain name, represented as a list of [`Label`]s.
///
/// In DNS messages, domain names are terminated by an empty label, but this type omits that
/// label.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Default)]
pub struct DomainName {
    // Does not include the trailing empty label.
    labels: Vec<Label>,
}

impl DomainName {
    /// The empty root domain `.`.
    pub const ROOT: Self = Self { labels: Vec::new() };

    /// Maximum length of a domain name in wire format, including length bytes and the root label.
    pub const MAX_WIRE_LEN: usize = 255;

    /// Parses a domain name as a string of `.`-separated labels.
    ///
    /// A trailing `.` is allowed but not required.
    pub fn from_str(s: &str) -> Result<Self, Error> {
        s.parse()
    }

    /// Creates a domain name from a list of labels, checking the total length limit.
    pub fn from_labels(labels: Vec<Label>) -> Result<Self, Error> {
        let name = Self { labels };
        if name.wire_len() > Self::MAX_WIRE_LEN {
            return Err(Error::NameTooLong);
        }
        Ok(name)
    }

    /// Returns the `.`-separated labels making up this domain name.
    ///
    /// The trailing empty label is not included.
    #[inline]
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Appends a [`Label`] to the end of this domain name.
    #[inline]
    pub fn push_label(&mut self, label: Label) {
        self.labels.push(label);
    }

    /// Returns `self` with all labels of `suffix` appended.
    pub fn join(mut self, suffix: &DomainName) -> DomainName {
        self.labels.extend(suffix.labels.iter().cloned());
        self
    }

    /// Length of this name in uncompressed wire format.
    pub fn wire_len(&self) -> usize {
        self.labels.iter().map(|l| l.as_bytes().len() + 1).sum::<usize>() + 1
    }

    /// Compares two names the way DNS does, ignoring ASCII case.
    pub fn eq_ignore_case(&self, other: &DomainName) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(&other.labels)
                .all(|(a, b)| a.eq_ignore_case(b))
    }

    /// If `self` ends with `suffix` (ignoring case), returns the leading labels.
    pub fn strip_suffix_ignore_case(&self, suffix: &DomainName) -> Option<&[Label]> {
        let split = self.labels.len().checked_sub(suffix.labels.len())?;
        let (head, tail) = self.labels.split_at(split);
        tail.iter()
            .zip(&suffix.labels)
            .all(|(a, b)| a.eq_ignore_case(b))
            .then_some(head)
    }

    /// Returns a copy of this name with every label lowercased, suitable as a map key.
    pub fn to_lowercase(&self) -> DomainName {
        DomainName {
            labels: self.labels.iter().map(Label::to_lowercase).collect(),
        }
    }
}

impl Extend<Label> for DomainName {
    fn extend<T: IntoIterator<Item = Label>>(&mut self, iter: T) {
        self.labels.extend(iter)
    }
}

impl<'a> Extend<&'a Label> for DomainName {
    fn extend<T: IntoIterator<Item = &'a Label>>(&mut self, iter: T) {
        self.labels.extend(iter.into_iter().cloned())
    }
}

impl FromIterator<Label> for DomainName {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        Self {
            labels: Vec::from_iter(iter),
        }
    }
}

impl<'a> FromIterator<&'a Label> for DomainName {
    fn from_iter<T: IntoIterator<Item = &'a Label>>(iter: T) -> Self {
        Self {
            labels: Vec::from_iter(iter.into_iter().cloned()),
        }
    }
}

impl<'a> IntoIterator for &'a DomainName {
    type Item = &'a Label;
    type IntoIter = slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.labels.iter()
    }
}

impl fmt::Debug for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return f.write_char('.');
        }
        for label in &self.labels {
            label.fmt(f)?;
            f.write_char('.')?;
        }
        Ok(())
    }
}

impl FromStr for DomainName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "." {
            // `split_terminator` returns an empty label for this, so special-case it
            return Ok(Self::ROOT);
        }

        let labels = s
            .split_terminator('.')
            .map(str::parse)
            .collect::<Result<Vec<Label>, _>>()?;
        Self::from_labels(labels)
    }
}
