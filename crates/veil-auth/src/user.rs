//! Live user records: traffic counters and the active-IP set.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A live user record shared between the authenticator and every connection
/// attributed to the user.
///
/// Traffic counters are atomic; reads and writes happen concurrently from
/// independent connection tasks. The active-IP set is refcounted so that
/// several connections from one address occupy a single slot, and the slot
/// is released only when the last of them closes.
pub struct User {
    sent: AtomicU64,
    recv: AtomicU64,
    hash: String,
    key_share: String,
    // 0 = unlimited.
    ip_limit: usize,
    ips: Mutex<HashMap<IpAddr, usize>>,
}

impl User {
    pub fn new(key_share: impl Into<String>, hash: impl Into<String>, ip_limit: usize) -> Self {
        Self {
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
            hash: hash.into(),
            key_share: key_share.into(),
            ip_limit,
            ips: Mutex::new(HashMap::new()),
        }
    }

    /// The credential hash identifying this user.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The human-readable password.
    pub fn key_share(&self) -> &str {
        &self.key_share
    }

    pub fn add_sent_traffic(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_recv_traffic(&self, n: u64) {
        self.recv.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn recv(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }

    /// Claim a slot in the active-IP set.
    ///
    /// Returns `false` when the address is new and the set already holds
    /// `ip_limit` distinct addresses; no state is mutated in that case.
    pub fn add_ip(&self, ip: IpAddr) -> bool {
        let mut ips = self.ips.lock();
        if let Some(count) = ips.get_mut(&ip) {
            *count += 1;
            return true;
        }
        if self.ip_limit > 0 && ips.len() >= self.ip_limit {
            return false;
        }
        ips.insert(ip, 1);
        true
    }

    /// Release a slot claimed by [`add_ip`](Self::add_ip). The address
    /// leaves the set once its last connection releases it.
    pub fn remove_ip(&self, ip: IpAddr) {
        let mut ips = self.ips.lock();
        if let Some(count) = ips.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                ips.remove(&ip);
            }
        }
    }

    /// Number of distinct addresses with at least one open connection.
    pub fn active_ip_count(&self) -> usize {
        self.ips.lock().len()
    }
}
