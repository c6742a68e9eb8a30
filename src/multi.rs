//! Administration of the transfers attached to the session.
//!
//! `MultiHandle` is the I/O thread's view of everything in flight: which
//! transfer ids are live, which descriptors the session wants watched in
//! which direction, the session's timeout deadline, and one
//! [`HttpTimeout`](::timeout::HttpTimeout) record per transfer. It applies
//! the session's notices after every call into it, runs the per-host
//! admission cap, and turns low-speed and stall verdicts into aborted
//! transfers.
//!
//! Nothing here is locked: every method runs on the I/O thread.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use host::{HostQueue, HostRegistry};
use poll::{Events, MergeIterator, PollSet};
use policy::SeenHosts;
use request::{RequestHandle, State, TransferResult};
use session::{Interest, Mailbox, Notice, Session, Step, TransferId, TransferOpts, TIMEOUT_ACTION};
use timeout::{HttpTimeout, Tick, NEVER};

struct Active {
    handle: RequestHandle,
    timeout: HttpTimeout,
    host: Arc<HostQueue>,
}

struct SocketRecord {
    id: TransferId,
    events: Events,
}

/// Where [`remove`](MultiHandle::remove) found the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removed {
    /// It was attached to the session.
    Detached,
    /// It was waiting in a host queue.
    Dequeued,
    /// It was neither; nothing changed.
    NotFound,
}

pub struct MultiHandle {
    session: Box<Session>,
    // Cap on transfers attached to the session, across all hosts.
    max_connections: usize,
    mailbox: Mailbox,
    active: HashMap<TransferId, Active>,
    // Descriptors currently registered by the session.
    sockets: HashMap<RawFd, SocketRecord>,
    read_set: PollSet,
    write_set: PollSet,
    // Deadline for the next TIMEOUT_ACTION, or NEVER.
    timer: Tick,
    next_id: TransferId,
    seen: SeenHosts,
}

impl MultiHandle {
    pub fn new(session: Box<Session>, max_connections: usize) -> Self {
        MultiHandle {
            session,
            max_connections,
            mailbox: Mailbox::new(),
            active: HashMap::new(),
            sockets: HashMap::new(),
            read_set: PollSet::new(),
            write_set: PollSet::new(),
            timer: NEVER,
            next_id: 0,
            seen: SeenHosts::new(),
        }
    }

    /// The read and write poll sets, for the caller's multiplex wait.
    pub fn poll_sets(&mut self) -> (&mut PollSet, &mut PollSet) {
        (&mut self.read_set, &mut self.write_set)
    }

    /// When the session wants a [`TIMEOUT_ACTION`], or [`NEVER`].
    pub fn timer_deadline(&self) -> Tick {
        self.timer
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Attaches a request, or queues it behind its host when the host or
    /// the engine is at its cap. Adding a request that is already in
    /// flight is a no-op.
    pub fn add(&mut self, handle: RequestHandle, registry: &HostRegistry, now: Tick) {
        match handle.state() {
            State::Active | State::HostQueued | State::Finished => {
                warn!("add: {:?} was already submitted", handle);
                return;
            }
            State::Unsubmitted | State::Pending => {}
        }
        let host = registry.instance(handle.hostname());
        if host.throttled() || self.active.len() >= self.max_connections {
            debug!("{:?} deferred behind host {:?}", handle, host.hostname());
            handle.set_state(State::HostQueued);
            host.queue(handle);
            registry.release(host);
        } else {
            host.added_to_session();
            self.start(handle, host, registry);
        }
        self.apply_notices(registry, now);
    }

    /// Aborts a request wherever it currently is; on `Detached` or
    /// `Dequeued` the request finishes with `Cancelled`. Removing a
    /// request that is not in flight changes nothing.
    pub fn remove(
        &mut self,
        handle: &RequestHandle,
        registry: &HostRegistry,
        now: Tick,
    ) -> Removed {
        let id = self
            .active
            .iter()
            .find(|&(_, a)| &a.handle == handle)
            .map(|(&id, _)| id);
        let removed = match id {
            Some(id) => {
                self.session.remove(id, &self.mailbox);
                self.detach(id, TransferResult::Cancelled, registry);
                Removed::Detached
            }
            None => {
                let host = registry.instance(handle.hostname());
                let queued = host.cancel(handle);
                registry.release(host);
                if queued {
                    handle.finish(TransferResult::Cancelled);
                    Removed::Dequeued
                } else {
                    debug!("remove: {:?} is not active or queued", handle);
                    Removed::NotFound
                }
            }
        };
        self.apply_notices(registry, now);
        removed
    }

    /// Feeds one readiness event (or [`TIMEOUT_ACTION`]) to the session
    /// and applies everything it posted.
    pub fn socket_action(&mut self, fd: RawFd, events: Events, registry: &HostRegistry, now: Tick) {
        while self.session.socket_action(fd, events, &self.mailbox) == Step::CallAgain {}
        self.apply_notices(registry, now);
    }

    /// Walks both poll sets after a multiplex wait and dispatches every
    /// ready descriptor that is still registered.
    pub fn dispatch_ready(&mut self, registry: &HostRegistry, now: Tick) {
        let mut ready = Vec::new();
        {
            let mut events = MergeIterator::new(&mut self.read_set, &mut self.write_set);
            while let Some(event) = events.next() {
                ready.push(event);
            }
        }
        for (fd, events) in ready {
            // An earlier action in this batch may have dropped the socket.
            if self.sockets.contains_key(&fd) {
                self.socket_action(fd, events, registry, now);
            }
        }
    }

    /// The session's timeout deadline passed.
    pub fn timeout_expired(&mut self, registry: &HostRegistry, now: Tick) {
        self.timer = NEVER;
        self.socket_action(TIMEOUT_ACTION, Events::empty(), registry, now);
    }

    /// Aborts every transfer whose stalled-at deadline has passed.
    pub fn handle_stalls(&mut self, registry: &HostRegistry, now: Tick) {
        let stalled: Vec<TransferId> = self
            .active
            .iter()
            .filter(|&(_, a)| a.timeout.has_stalled(now))
            .map(|(&id, _)| id)
            .collect();
        for id in stalled {
            if let Some(active) = self.active.get(&id) {
                warn!(
                    "aborting stalled transfer to {:?} while {:?}",
                    active.handle.hostname(),
                    active.timeout.phase()
                );
            }
            self.abort(id, TransferResult::TimedOut, registry);
        }
        self.apply_notices(registry, now);
    }

    /// Cancels everything: first the host queues, then the attached
    /// transfers. Every affected request finishes with `Cancelled`.
    pub fn shutdown(&mut self, registry: &HostRegistry, now: Tick) {
        for handle in registry.purge() {
            handle.finish(TransferResult::Cancelled);
        }
        let ids: Vec<TransferId> = self.active.keys().cloned().collect();
        for id in ids {
            self.abort(id, TransferResult::Cancelled, registry);
        }
        self.apply_notices(registry, now);
    }

    /// Hands a request to the session. Its host slot is already claimed;
    /// when the session refuses, the request finishes with `Io` and the
    /// slot is freed again.
    fn start(&mut self, handle: RequestHandle, host: Arc<HostQueue>, registry: &HostRegistry) {
        let id = self.next_id;
        self.next_id += 1;
        let policy = handle.policy().clone();
        let opts = TransferOpts {
            url: handle.url().to_owned(),
            upload: handle.is_upload(),
            connect_timeout: policy.connect_timeout(handle.hostname(), &mut self.seen),
            max_transaction: policy.values().max_transaction,
            total_timeout: policy.values().max_total,
        };
        handle.set_state(State::Active);
        match self.session.add(id, opts, &self.mailbox) {
            Ok(()) => {
                debug!("transfer {} started: {:?}", id, handle);
                self.active.insert(
                    id,
                    Active {
                        handle,
                        timeout: HttpTimeout::new(policy),
                        host,
                    },
                );
            }
            Err(e) => {
                error!("session refused {:?}: {}", handle, e);
                handle.finish(TransferResult::Io);
                self.free_slot(host, registry);
            }
        }
    }

    /// Frees one active slot of `host` and promotes the oldest queued
    /// request into it: the host's own queue first, then any host below
    /// its cap when the freed capacity was engine-wide.
    fn free_slot(&mut self, host: Arc<HostQueue>, registry: &HostRegistry) {
        let promoted = host.removed_from_session();
        registry.release(host);
        let next = match promoted {
            Some(next) => Some(next),
            None if self.active.len() < self.max_connections => registry.pop_eligible(),
            None => None,
        };
        if let Some(next) = next {
            let host = registry.instance(next.hostname());
            host.added_to_session();
            self.start(next, host, registry);
        }
    }

    /// Aborts an attached transfer with the given result.
    fn abort(&mut self, id: TransferId, result: TransferResult, registry: &HostRegistry) {
        self.session.remove(id, &self.mailbox);
        self.detach(id, result, registry);
    }

    /// Drops the transfer from the administration, finishes its request
    /// and frees its host slot.
    fn detach(&mut self, id: TransferId, result: TransferResult, registry: &HostRegistry) {
        let mut active = match self.active.remove(&id) {
            Some(active) => active,
            None => {
                warn!("completion for unknown transfer {}", id);
                return;
            }
        };
        active
            .timeout
            .done(result, active.handle.hostname(), &mut self.seen);
        debug!("transfer {} done: {:?} {:?}", id, active.handle, result);
        active.handle.finish(result);
        self.free_slot(active.host, registry);
    }

    /// Drains the mailbox, applying every notice the session posted.
    /// Actions taken here may post further notices; the loop picks those
    /// up too.
    fn apply_notices(&mut self, registry: &HostRegistry, now: Tick) {
        while let Some(notice) = self.mailbox.take() {
            match notice {
                Notice::Watch { id, fd, interest } => self.watch(id, fd, interest, now),
                Notice::Timeout { millis } => {
                    self.timer = if millis < 0 {
                        NEVER
                    } else {
                        now + millis as u64
                    };
                }
                Notice::DataSent { id, bytes } => {
                    if self.account(id, bytes, now, true) {
                        self.abort(id, TransferResult::TimedOut, registry);
                    }
                }
                Notice::DataReceived { id, bytes } => {
                    if self.account(id, bytes, now, false) {
                        self.abort(id, TransferResult::TimedOut, registry);
                    }
                }
                Notice::Completed { id, result } => self.detach(id, result, registry),
            }
        }
    }

    /// Books transferred bytes on the transfer's timeout record; true
    /// when the transfer must be aborted as too slow.
    fn account(&mut self, id: TransferId, bytes: usize, now: Tick, sent: bool) -> bool {
        let active = match self.active.get_mut(&id) {
            Some(active) => active,
            None => {
                warn!("data notice for unknown transfer {}", id);
                return false;
            }
        };
        let abort = if sent {
            active.timeout.data_sent(bytes, now)
        } else {
            active.timeout.data_received(bytes, now)
        };
        active.handle.publish_stalled(active.timeout.stalled_at());
        abort
    }

    fn watch(&mut self, id: TransferId, fd: RawFd, interest: Interest, now: Tick) {
        let old = self
            .sockets
            .get(&fd)
            .map_or(Events::empty(), |r| r.events);
        let new = match interest {
            Interest::In => Events::IN,
            Interest::Out => Events::OUT,
            Interest::InOut => Events::IN | Events::OUT,
            Interest::Remove => Events::empty(),
        };
        // The session never says "the request body is fully sent", but
        // dropping write interest while sending and before any reply byte
        // means exactly that.
        if old.contains(Events::OUT) && !new.contains(Events::OUT) {
            if let Some(active) = self.active.get_mut(&id) {
                if active.timeout.is_uploading() {
                    active.timeout.upload_finished(now);
                    active.handle.publish_stalled(active.timeout.stalled_at());
                }
            }
        }
        if new.contains(Events::IN) && !old.contains(Events::IN) {
            self.read_set.add(fd);
        } else if old.contains(Events::IN) && !new.contains(Events::IN) {
            self.read_set.remove(fd);
        }
        if new.contains(Events::OUT) && !old.contains(Events::OUT) {
            self.write_set.add(fd);
        } else if old.contains(Events::OUT) && !new.contains(Events::OUT) {
            self.write_set.remove(fd);
        }
        if interest == Interest::Remove {
            self.sockets.remove(&fd);
        } else {
            self.sockets.insert(fd, SocketRecord { id, events: new });
        }
    }
}
