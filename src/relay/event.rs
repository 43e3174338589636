//! Event records forwarded to collector agents

use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Header carrying the event's unique id
pub const ID_HEADER: &str = "guId";

/// Header carrying the event's creation time in epoch milliseconds
pub const TIMESTAMP_HEADER: &str = "timeStamp";

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Generate a process-unique, time-ordered event id
///
/// Layout: `<epoch millis>-<sequence>-<random>`, all lowercase hex.
pub fn generate_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let salt: u64 = rand::thread_rng().gen();
    format!("{:012x}-{:08x}-{:016x}", millis, seq, salt)
}

/// An event: an ordered header map plus an opaque body
///
/// The `guId` header is always present and is the event's identity in the
/// durable store. Events are immutable once handed to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl Event {
    /// Create an event with a freshly generated id
    pub fn new(headers: BTreeMap<String, String>, body: impl Into<Vec<u8>>) -> Self {
        Self::with_id(generate_id(), headers, body)
    }

    /// Create an event with an explicit id
    ///
    /// An `id` passed here overrides any `guId` already in `headers`.
    pub fn with_id(
        id: impl Into<String>,
        mut headers: BTreeMap<String, String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        headers.insert(ID_HEADER.to_string(), id.into());
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Rebuild an event from decoded parts, requiring the id header
    pub(crate) fn from_parts(headers: BTreeMap<String, String>, body: Vec<u8>) -> Option<Self> {
        headers.contains_key(ID_HEADER).then_some(Self { headers, body })
    }

    pub fn id(&self) -> &str {
        self.headers
            .get(ID_HEADER)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// The store key: the id's UTF-8 bytes
    pub fn key(&self) -> Vec<u8> {
        self.id().as_bytes().to_vec()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}
