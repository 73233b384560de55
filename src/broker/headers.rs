//! Message headers.
//!
//! Headers keep their insertion order and permit duplicate names, matching
//! what the brokers themselves allow on the wire.

use std::str::FromStr;

/// Message id shared by every chunk of a logical message.
pub const MESSAGE_ID_HEADER: &str = "x-message-id";
/// Number of failed processing attempts carried over from a previous delivery.
pub const FAILED_ATTEMPTS_HEADER: &str = "x-failed-attempts";
/// Zero-based index of a chunk within its message.
pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
/// Declared number of chunks of the message.
pub const CHUNKS_COUNT_HEADER: &str = "x-chunk-count";
/// Set to `true` on the last chunk when the count is not known upfront.
pub const CHUNK_IS_LAST_HEADER: &str = "x-chunk-last";

/// A single header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub value: Option<String>,
}

impl MessageHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

/// Ordered header collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    headers: Vec<MessageHeader>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing header with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl ToString) {
        self.headers.push(MessageHeader::new(name, value.to_string()));
    }

    /// Builder-style variant of [`add`](Self::add).
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.add(name, value);
        self
    }

    /// Replace the first header with this name, or append it.
    pub fn add_or_replace(&mut self, name: impl Into<String>, value: impl ToString) {
        let name = name.into();
        let value = Some(value.to_string());
        match self.headers.iter_mut().find(|h| h.name == name) {
            Some(header) => header.value = value,
            None => self.headers.push(MessageHeader { name, value }),
        }
    }

    /// Remove every header with this name.
    pub fn remove(&mut self, name: &str) {
        self.headers.retain(|h| h.name != name);
    }

    /// Value of the first header with this name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .and_then(|h| h.value.as_deref())
    }

    /// Parse the first header with this name. Unparseable values read as `None`.
    pub fn get_as<T: FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageHeader> {
        self.headers.iter()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl FromIterator<MessageHeader> for MessageHeaders {
    fn from_iter<I: IntoIterator<Item = MessageHeader>>(iter: I) -> Self {
        Self {
            headers: iter.into_iter().collect(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MessageHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .map(|(k, v)| MessageHeader::new(k, v))
            .collect()
    }
}
