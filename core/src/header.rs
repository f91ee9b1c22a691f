use std::collections::BTreeMap;

/// Error code of a failed call, or the bus-level no-responders status
pub const STATUS: &'static str = "Status";
/// Human readable message paired with [STATUS]
pub const DESCRIPTION: &'static str = "Description";
/// The caller's inbox, on the first message of a streaming call
pub const REPLY_TO: &'static str = "Reply-To";
/// The server's inbox, on the handshake reply of client-streaming and bidi calls
pub const STREAM_INBOX: &'static str = "Stream-Inbox";
/// Per-direction sequence number of a stream message
pub const STREAM_SEQ: &'static str = "Stream-Seq";
/// Marks the terminal message of one stream direction
pub const STREAM_END: &'static str = "Stream-End";

/// Status value the bus uses when a request had no subscriber
pub const NO_RESPONDERS_STATUS: &'static str = "503";

pub const RESERVED: [&'static str; 6] =
    [STATUS, DESCRIPTION, REPLY_TO, STREAM_INBOX, STREAM_SEQ, STREAM_END];

/// Multi-valued message metadata. Names are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all values of `name`.
    #[inline]
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), vec![value.into()]);
    }

    #[inline]
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    /// First value of `name`
    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.first()).map(|s| s.as_str())
    }

    #[inline]
    pub fn get_all(&self, name: &str) -> &[String] {
        match self.0.get(name) {
            Some(v) => v.as_slice(),
            None => &[],
        }
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    #[inline]
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Values in `other` replace values of the same name in self.
    pub fn merge(&mut self, other: &Headers) {
        for (k, v) in other.0.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Drop every header the runtime owns on the wire.
    pub fn strip_reserved(&mut self) {
        for name in RESERVED {
            self.0.remove(name);
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut h = Headers::default();
        for (k, v) in iter {
            h.append(k, v);
        }
        h
    }
}
