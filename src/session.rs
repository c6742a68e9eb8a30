//! The session contract.
//!
//! A [`Session`] multiplexes any number of HTTP transfers over a pool of
//! non-blocking sockets it owns. The engine never touches those sockets
//! directly; the session tells it, through the [`Mailbox`], which
//! descriptors to watch in which direction and how long the next wait may
//! block, and the engine feeds readiness back in through
//! [`socket_action`](Session::socket_action).
//!
//! Everything protocol (connecting, TLS, request/response framing,
//! redirects) happens behind this trait. The engine cares only about
//! descriptors, bytes-moved progress and final results.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;

use poll::Events;
use request::TransferResult;

/// Engine-assigned transfer identity, unique among live transfers.
pub type TransferId = u64;

/// Pseudo-descriptor passed to [`socket_action`](Session::socket_action)
/// when the session's timeout expired rather than a socket becoming
/// ready.
pub const TIMEOUT_ACTION: RawFd = -1;

/// Per-transfer parameters handed to the session. The timeouts are hard
/// upper bounds enforced by the session itself; the engine's stall
/// detection is independent of them and usually fires first.
#[derive(Debug, Clone)]
pub struct TransferOpts {
    pub url: String,
    pub upload: bool,
    /// Connect timeout in seconds, DNS grace already included.
    pub connect_timeout: u16,
    /// Hard cap on the whole transaction, in seconds.
    pub max_transaction: u16,
    /// Hard cap measured from the moment of the request, in seconds.
    pub total_timeout: u16,
}

/// What the session wants watched for one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    In,
    Out,
    InOut,
    /// Forget the socket entirely.
    Remove,
}

/// Whether a [`socket_action`](Session::socket_action) call made all the
/// progress it could.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Done,
    /// More work is immediately available; call again without waiting.
    CallAgain,
}

/// One message from the session to the engine.
#[derive(Debug)]
pub enum Notice {
    /// Watch `fd` as requested on behalf of transfer `id`.
    Watch {
        id: TransferId,
        fd: RawFd,
        interest: Interest,
    },
    /// Call [`socket_action`](Session::socket_action) with
    /// [`TIMEOUT_ACTION`] after at most `millis` ms; `-1` cancels the
    /// previous hint.
    Timeout { millis: i64 },
    /// Transfer `id` pushed `bytes` of request body to its server.
    DataSent { id: TransferId, bytes: usize },
    /// Transfer `id` got `bytes` of reply data from its server.
    DataReceived { id: TransferId, bytes: usize },
    /// Transfer `id` finished; the session already forgot it.
    Completed { id: TransferId, result: TransferResult },
}

/// Sink for session notices, drained by the engine after every session
/// call. Single-threaded by construction: both sides live on the I/O
/// thread.
pub struct Mailbox {
    notices: RefCell<VecDeque<Notice>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Mailbox {
            notices: RefCell::new(VecDeque::new()),
        }
    }

    pub fn post(&self, notice: Notice) {
        self.notices.borrow_mut().push_back(notice);
    }

    pub fn take(&self) -> Option<Notice> {
        self.notices.borrow_mut().pop_front()
    }
}

/// A multiplexing HTTP session. Driven exclusively by the I/O thread.
pub trait Session {
    /// Starts transfer `id`. Socket registrations, the next timeout and
    /// eventually the completion arrive through `mailbox`.
    fn add(&mut self, id: TransferId, opts: TransferOpts, mailbox: &Mailbox) -> io::Result<()>;

    /// Aborts transfer `id` without completing it. The session posts
    /// `Interest::Remove` for its sockets but no `Completed` notice.
    fn remove(&mut self, id: TransferId, mailbox: &Mailbox);

    /// Drives the session: `fd` became ready for `events`, or `fd` is
    /// [`TIMEOUT_ACTION`] and the timeout hint expired. On
    /// [`Step::CallAgain`] the caller repeats the call with the same
    /// arguments before doing anything else.
    fn socket_action(&mut self, fd: RawFd, events: Events, mailbox: &Mailbox) -> Step;
}
