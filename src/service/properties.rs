//! Plain key-value view of a [`ServiceRecord`], for handing results to a host application.

use std::collections::BTreeMap;

use super::{ServiceRecord, TxtRecordValue};

/// A single value in the map returned by [`ServiceRecord::to_properties`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    Text(String),
    Port(u16),
    /// Textual IP addresses, IPv4 before IPv6.
    Addresses(Vec<String>),
    /// TXT entries as strings; flags map to an empty string, non-UTF-8 bytes are replaced.
    Txt(BTreeMap<String, String>),
}

impl ServiceRecord {
    /// Serializes the record into the keys `name`, `fullName`, `host`, `port`, `addresses` and
    /// `txt`.
    pub fn to_properties(&self) -> BTreeMap<&'static str, Property> {
        let txt = self
            .txt_records()
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    TxtRecordValue::NoValue => String::new(),
                    TxtRecordValue::Value(v) => String::from_utf8_lossy(v).into_owned(),
                };
                (key.to_string(), value)
            })
            .collect();

        BTreeMap::from([
            (
                "name",
                Property::Text(self.instance().instance_name().to_string()),
            ),
            ("fullName", Property::Text(self.instance().to_string())),
            ("host", Property::Text(self.host().to_string())),
            ("port", Property::Port(self.port())),
            (
                "addresses",
                Property::Addresses(self.addresses().iter().map(ToString::to_string).collect()),
            ),
            ("txt", Property::Txt(txt)),
        ])
    }
}
