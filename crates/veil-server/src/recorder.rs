//! Bounded in-memory ring of connection events.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

/// One recorded connection event.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub hash: String,
    pub remote: String,
    pub destination: String,
    pub kind: String,
    pub extra: Option<String>,
    /// Unix timestamp, seconds.
    pub at: u64,
}

/// Append-only event sink with a fixed capacity; the oldest entry is
/// evicted when the ring is full.
pub struct Recorder {
    capacity: usize,
    entries: Mutex<VecDeque<Record>>,
}

impl Recorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn add(
        &self,
        hash: &str,
        remote: SocketAddr,
        destination: impl ToString,
        kind: &str,
        extra: Option<String>,
    ) {
        let record = Record {
            hash: hash.to_string(),
            remote: remote.to_string(),
            destination: destination.to_string(),
            kind: kind.to_string(),
            extra,
            at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// Copy of the ring, oldest first.
    pub fn snapshot(&self) -> Vec<Record> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
