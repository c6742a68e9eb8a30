//! Per-host bookkeeping.
//!
//! Servers dislike a client opening dozens of connections at once, so the
//! number of transfers attached to the session per canonical hostname is
//! capped. Overflow requests wait in their host's FIFO queue and are
//! promoted, oldest first, as active transfers for that host finish.
//!
//! Queues live in a registry keyed by canonical hostname and disappear
//! again once the last interest in a host is gone.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use request::RequestHandle;

/// Extracts the canonical hostname of a URL: the authority without
/// scheme, userinfo or port, lowercased.
///
/// This never fails; for a string without any URL structure it returns
/// the (lowercased) string itself, which still partitions requests
/// consistently.
pub fn canonical_hostname(url: &str) -> String {
    // Skip "scheme://", but only when it precedes the first '/'.
    let rest = match url.find("://") {
        Some(pos) if !url[..pos].contains('/') => &url[pos + 3..],
        _ => url,
    };
    // The authority ends at the first '/'.
    let authority = match rest.find('/') {
        Some(pos) => &rest[..pos],
        None => rest,
    };
    // Strip "userinfo@".
    let host_port = match authority.rfind('@') {
        Some(pos) => &authority[pos + 1..],
        None => authority,
    };
    // Strip a trailing ":port".
    let end = host_port
        .char_indices()
        .rev()
        .find(|&(_, c)| c != ':' && !c.is_ascii_digit())
        .map(|(i, c)| i + c.len_utf8());
    let host = match end {
        Some(end) => match host_port[end..].find(':') {
            Some(colon) => &host_port[..end + colon],
            None => host_port,
        },
        None => host_port,
    };
    host.to_ascii_lowercase()
}

struct QueueInner {
    // Transfers for this host currently attached to the session.
    // Invariant: 0 <= added <= max_active.
    added: u16,
    // Requests waiting for a slot, oldest first.
    queued: VecDeque<RequestHandle>,
}

/// Admission bookkeeping for one canonical hostname.
pub struct HostQueue {
    hostname: String,
    max_active: u16,
    inner: Mutex<QueueInner>,
}

impl HostQueue {
    fn new(hostname: &str, max_active: u16) -> Arc<HostQueue> {
        Arc::new(HostQueue {
            hostname: hostname.to_owned(),
            max_active,
            inner: Mutex::new(QueueInner {
                added: 0,
                queued: VecDeque::new(),
            }),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// True when this host is at its concurrency cap and new transfers
    /// must be queued instead of attached.
    pub fn throttled(&self) -> bool {
        self.inner.lock().unwrap().added >= self.max_active
    }

    /// Records that a transfer for this host was attached to the session.
    pub fn added_to_session(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.added < self.max_active);
        inner.added += 1;
    }

    /// Records that a transfer for this host left the session, and pops
    /// the oldest queued request, if any, for promotion into the freed
    /// slot.
    pub fn removed_from_session(&self) -> Option<RequestHandle> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.added > 0);
        inner.added -= 1;
        inner.queued.pop_front()
    }

    /// Appends a request to the wait queue.
    pub fn queue(&self, handle: RequestHandle) {
        self.inner.lock().unwrap().queued.push_back(handle);
    }

    /// Removes a waiting request; true when it was queued here.
    pub fn cancel(&self, handle: &RequestHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.queued.iter().position(|h| h == handle) {
            Some(pos) => {
                inner.queued.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Pops the oldest waiting request without freeing a slot. Used when
    /// draining the queues at shutdown.
    pub fn pop_queued(&self) -> Option<RequestHandle> {
        self.inner.lock().unwrap().queued.pop_front()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().unwrap().queued.len()
    }

    fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.added == 0 && inner.queued.is_empty()
    }
}

/// The per-engine registry of host queues.
pub struct HostRegistry {
    max_active_per_host: u16,
    hosts: Mutex<HashMap<String, Arc<HostQueue>>>,
}

impl HostRegistry {
    pub fn new(max_active_per_host: u16) -> Self {
        HostRegistry {
            max_active_per_host,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// The queue for `hostname`, created on first use.
    pub fn instance(&self, hostname: &str) -> Arc<HostQueue> {
        let mut hosts = self.hosts.lock().unwrap();
        hosts
            .entry(hostname.to_owned())
            .or_insert_with(|| HostQueue::new(hostname, self.max_active_per_host))
            .clone()
    }

    /// Gives up one reference to `queue`, erasing the registry entry when
    /// no other interest remains.
    pub fn release(&self, queue: Arc<HostQueue>) {
        let mut hosts = self.hosts.lock().unwrap();
        // Both tests must run under the registry lock, or instance() can
        // hand out the entry between them.
        if Arc::strong_count(&queue) == 2 && queue.is_idle() {
            hosts.remove(queue.hostname());
        }
    }

    /// Pops the oldest waiting request of some host that is below its
    /// concurrency cap. Used when a finished transfer frees capacity that
    /// its own host's queue cannot use.
    pub fn pop_eligible(&self) -> Option<RequestHandle> {
        let hosts = self.hosts.lock().unwrap();
        for queue in hosts.values() {
            if !queue.throttled() {
                if let Some(handle) = queue.pop_queued() {
                    return Some(handle);
                }
            }
        }
        None
    }

    /// Drains every wait queue, returning the abandoned requests. Queue
    /// entries for hosts with active transfers survive as empty entries
    /// until those transfers are released.
    pub fn purge(&self) -> Vec<RequestHandle> {
        let hosts = self.hosts.lock().unwrap();
        let mut purged = Vec::new();
        for queue in hosts.values() {
            while let Some(handle) = queue.pop_queued() {
                purged.push(handle);
            }
        }
        purged
    }

    /// Total number of requests waiting in host queues. Diagnostic.
    pub fn total_queued(&self) -> usize {
        let hosts = self.hosts.lock().unwrap();
        hosts.values().map(|q| q.queued_len()).sum()
    }
}
