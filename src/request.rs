//! Requests and their shared handles.
//!
//! A [`Request`] describes one logical HTTP transaction; sealing it into a
//! [`RequestHandle`] makes it shareable between the submitting thread and
//! the I/O thread. The handle carries the externally observable state, the
//! final result, the completion callback, and the published stalled-at
//! deadline for watchdog queries. The transfer's bytes never pass through
//! this layer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use host;
use policy::Policy;
use timeout::{Tick, NEVER};

/// Final result of a transfer, delivered through the completion callback.
///
/// Transport-level errors are surfaced verbatim and never retried here. A
/// low-speed abort is delivered as `TimedOut`, indistinguishable from the
/// session's own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResult {
    Ok,
    ResolveError,
    ConnectError,
    TimedOut,
    Io,
    Cancelled,
}

/// Where a request currently is. At any instant a request is in exactly
/// one of these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, no command submitted yet.
    Unsubmitted,
    /// An add command was submitted but not yet drained.
    Pending,
    /// Waiting in its hostname's per-host queue.
    HostQueued,
    /// Attached to the session.
    Active,
    /// Result available; the callback has run.
    Finished,
}

pub type Callback = Box<FnMut(TransferResult) + Send>;

/// Builder for one HTTP transaction.
pub struct Request {
    url: String,
    upload: bool,
    policy: Arc<Policy>,
    on_complete: Option<Callback>,
}

impl Request {
    pub fn new(url: &str, policy: Arc<Policy>) -> Self {
        Request {
            url: url.to_owned(),
            upload: false,
            policy,
            on_complete: None,
        }
    }

    /// Marks the request as carrying a body to upload.
    pub fn upload(mut self) -> Self {
        self.upload = true;
        self
    }

    /// Sets the completion callback, invoked exactly once by the I/O
    /// thread with the final result.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnMut(TransferResult) + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Seals the request into a shareable handle.
    pub fn handle(self) -> RequestHandle {
        let hostname = host::canonical_hostname(&self.url);
        RequestHandle(Arc::new(Inner {
            url: self.url,
            hostname,
            upload: self.upload,
            policy: self.policy,
            shared: Mutex::new(Shared {
                state: State::Unsubmitted,
                result: None,
                on_complete: self.on_complete,
            }),
            stalled_at: AtomicU64::new(NEVER),
        }))
    }
}

struct Shared {
    state: State,
    result: Option<TransferResult>,
    on_complete: Option<Callback>,
}

struct Inner {
    url: String,
    hostname: String,
    upload: bool,
    policy: Arc<Policy>,
    shared: Mutex<Shared>,
    // Published copy of the timeout record's stalled-at deadline, for
    // lock-free watchdog queries from other threads.
    stalled_at: AtomicU64,
}

/// Shared handle to one request. Clones refer to the same transaction.
#[derive(Clone)]
pub struct RequestHandle(Arc<Inner>);

impl RequestHandle {
    pub fn url(&self) -> &str {
        &self.0.url
    }

    pub fn hostname(&self) -> &str {
        &self.0.hostname
    }

    pub fn is_upload(&self) -> bool {
        self.0.upload
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.0.policy
    }

    pub fn state(&self) -> State {
        self.0.shared.lock().unwrap().state
    }

    /// The final result, once finished.
    pub fn result(&self) -> Option<TransferResult> {
        self.0.shared.lock().unwrap().result
    }

    /// The published stalled-at deadline, or [`NEVER`](::timeout::NEVER).
    pub fn stalled_at(&self) -> Tick {
        self.0.stalled_at.load(Ordering::Relaxed)
    }

    pub(crate) fn publish_stalled(&self, at: Tick) {
        self.0.stalled_at.store(at, Ordering::Relaxed);
    }

    pub(crate) fn set_state(&self, state: State) {
        self.0.shared.lock().unwrap().state = state;
    }

    /// `Unsubmitted` to `Pending` transition; false when the request was
    /// submitted before.
    pub(crate) fn mark_pending(&self) -> bool {
        let mut shared = self.0.shared.lock().unwrap();
        if shared.state == State::Unsubmitted {
            shared.state = State::Pending;
            true
        } else {
            false
        }
    }

    /// Stores the result, transitions to `Finished` and runs the
    /// completion callback. A second finish is logged and ignored.
    pub(crate) fn finish(&self, result: TransferResult) {
        let callback = {
            let mut shared = self.0.shared.lock().unwrap();
            if shared.state == State::Finished {
                warn!("request {:?} finished twice (second result {:?})", self, result);
                return;
            }
            shared.state = State::Finished;
            shared.result = Some(result);
            shared.on_complete.take()
        };
        self.publish_stalled(NEVER);
        // Run the callback outside of the state lock.
        if let Some(mut callback) = callback {
            callback(result);
        }
    }
}

impl PartialEq for RequestHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RequestHandle {}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Request {{ {} }}", self.0.url)
    }
}
