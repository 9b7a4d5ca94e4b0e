//! Payload wrapper carrying routing metadata.
//!
//! Most operators move raw values; envelopes appear only where routing
//! metadata is required (bridge points into keyed routing fabrics).
//! Header keys are case-insensitive: lower-cased on insertion and on
//! lookup. The id is assigned lazily, on first access.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use indexmap::IndexMap;

/// Header key stamped on envelopes to record their origin node.
pub const ORIGIN_HEADER: &str = "x-reactor-origin";

/// Process-wide envelope id counter. Ids only need to be unique, not
/// secret or dense.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Case-insensitive, insertion-ordered header map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    entries: IndexMap<String, String>,
    read_only: bool,
}

impl Headers {
    /// An empty, mutable header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, lower-casing the key. Returns the previous
    /// value for that key, if any. Ignored on read-only snapshots.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Option<String> {
        if self.read_only {
            return None;
        }
        self.entries.insert(key.to_ascii_lowercase(), value.into())
    }

    /// Look up a header, lower-casing the key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether a header is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// An immutable snapshot of this map. Further `set` calls on the
    /// snapshot are ignored.
    pub fn read_only(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            read_only: true,
        }
    }

    /// Iterate headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A payload with routing metadata: lazily-assigned unique id, headers,
/// and an optional reply-to tag.
#[derive(Debug)]
pub struct Envelope<T> {
    payload: T,
    headers: Headers,
    reply_to: Option<String>,
    id: OnceLock<u64>,
}

impl<T> Envelope<T> {
    /// Wrap a payload with empty headers.
    pub fn wrap(payload: T) -> Self {
        Self {
            payload,
            headers: Headers::new(),
            reply_to: None,
            id: OnceLock::new(),
        }
    }

    /// Wrap a payload and set the reply-to tag.
    pub fn wrap_reply(payload: T, reply_to: impl Into<String>) -> Self {
        Self {
            reply_to: Some(reply_to.into()),
            ..Self::wrap(payload)
        }
    }

    /// The unique id of this envelope, assigned on first access.
    pub fn id(&self) -> u64 {
        *self.id.get_or_init(|| NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The wrapped payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Unwrap into the payload, discarding metadata.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// The headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable access to the headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The reply-to tag, if set.
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Stamp the origin header. Overwrites an existing origin.
    pub fn set_origin(&mut self, origin: impl Into<String>) {
        self.headers.set(ORIGIN_HEADER, origin);
    }

    /// Replace the payload, keeping id and metadata. Used by transforms
    /// that rewrite the value but must preserve routing.
    pub fn map<O>(self, f: impl FnOnce(T) -> O) -> Envelope<O> {
        Envelope {
            payload: f(self.payload),
            headers: self.headers,
            reply_to: self.reply_to,
            id: self.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_keys_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(headers.contains("Content-type"));
    }

    #[test]
    fn read_only_snapshot_ignores_writes() {
        let mut headers = Headers::new();
        headers.set("a", "1");
        let mut snapshot = headers.read_only();
        snapshot.set("b", "2");
        assert!(!snapshot.contains("b"));
        assert_eq!(snapshot.get("a"), Some("1"));
    }

    #[test]
    fn id_is_lazy_and_stable() {
        let envelope = Envelope::wrap("payload");
        let first = envelope.id();
        assert_eq!(envelope.id(), first);

        let other = Envelope::wrap("payload");
        assert_ne!(other.id(), first);
    }

    #[test]
    fn map_preserves_metadata_and_id() {
        let mut envelope = Envelope::wrap_reply(21, "replies");
        envelope.set_origin("node-7");
        let id = envelope.id();

        let doubled = envelope.map(|v| v * 2);
        assert_eq!(*doubled.payload(), 42);
        assert_eq!(doubled.id(), id);
        assert_eq!(doubled.reply_to(), Some("replies"));
        assert_eq!(doubled.headers().get(ORIGIN_HEADER), Some("node-7"));
    }
}
