//! The engine: one dedicated I/O thread driving the session.
//!
//! The thread loops over four steps: drain the command queue, refresh the
//! poll sets, wait in `select` (holding the wake mutex, so concurrent
//! wakes are forced onto the self-pipe), then dispatch readiness or run
//! the timeout and stall work. Application threads only ever append
//! commands and wake it.

use std::cmp;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use command::{CommandQueue, Verb, Waker};
use host::HostRegistry;
use multi::MultiHandle;
use request::{RequestHandle, TransferResult};
use session::Session;
use sys;
use timeout::{Clock, Tick, NEVER};

// The wait never blocks longer than this, so stalled transfers are
// caught within a second even when the session sleeps longer.
const DEFAULT_WAIT_MS: u64 = 1000;

// Backoff ladder for a session whose timeout deadline is due immediately
// over and over: such a session would otherwise spin this thread.
const BACKOFF_ONE_MS: u32 = 100;
const BACKOFF_TEN_MS: u32 = 1000;
const BACKOFF_WARN: u32 = 10_000;

/// Engine construction knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cap on transfers attached to the session, across all hosts.
    pub max_connections: usize,
    /// Cap on concurrent transfers per canonical hostname.
    pub max_active_per_host: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_connections: 32,
            max_active_per_host: 2,
        }
    }
}

impl Config {
    fn validated(self) -> Self {
        let mut config = self;
        if config.max_connections == 0 {
            warn!("max_connections = 0 makes no sense, using 1");
            config.max_connections = 1;
        }
        if config.max_active_per_host == 0 {
            warn!("max_active_per_host = 0 makes no sense, using 1");
            config.max_active_per_host = 1;
        }
        config
    }
}

struct Shared {
    commands: CommandQueue,
    waker: Waker,
    registry: HostRegistry,
    running: AtomicBool,
    // Engine time published by the I/O thread, for watchdog queries.
    now: AtomicU64,
}

/// Handle to a running engine. Dropping it stops the I/O thread.
pub struct Engine {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Engine {
    /// Starts the I/O thread. The session factory runs on that thread,
    /// so the session itself never needs to be `Send`.
    pub fn start<F, S>(config: Config, session: F) -> io::Result<Engine>
    where
        F: FnOnce() -> S + Send + 'static,
        S: Session + 'static,
    {
        let config = config.validated();
        let shared = Arc::new(Shared {
            commands: CommandQueue::new(),
            waker: Waker::new()?,
            registry: HostRegistry::new(config.max_active_per_host),
            running: AtomicBool::new(true),
            now: AtomicU64::new(0),
        });
        let inner = shared.clone();
        let max_connections = config.max_connections;
        let thread = thread::Builder::new()
            .name("http-io".to_owned())
            .spawn(move || {
                let multi = MultiHandle::new(Box::new(session()), max_connections);
                run(&inner, multi);
            })?;
        Ok(Engine {
            shared,
            thread: Some(thread),
        })
    }

    /// Submits a request for execution. A handle may be submitted only
    /// once; a second add is ignored.
    pub fn add(&self, handle: RequestHandle) {
        if !handle.mark_pending() {
            warn!("add: {:?} was already submitted", handle);
            return;
        }
        if !self.shared.running.load(Ordering::SeqCst) {
            handle.finish(TransferResult::Cancelled);
            return;
        }
        self.submit(Verb::Add, handle);
    }

    /// Aborts a request; it finishes with `Cancelled`.
    pub fn remove(&self, handle: RequestHandle) {
        if !self.shared.running.load(Ordering::SeqCst) {
            // Shutdown already cancelled everything outstanding.
            return;
        }
        self.submit(Verb::Remove, handle);
    }

    /// Reserved. Accepted and currently ignored at drain time.
    pub fn boost(&self, handle: RequestHandle) {
        self.submit(Verb::Boost, handle);
    }

    fn submit(&self, verb: Verb, handle: RequestHandle) {
        self.shared.commands.submit(verb, handle);
        self.shared.waker.wake();
    }

    /// Engine time, as last published by the I/O thread.
    pub fn now(&self) -> Tick {
        self.shared.now.load(Ordering::Relaxed)
    }

    /// Watchdog query: true when the transfer's stalled-at deadline has
    /// passed. The I/O thread will abort it shortly; a caller seeing this
    /// repeatedly for many requests is looking at a wedged network.
    pub fn has_stalled(&self, handle: &RequestHandle) -> bool {
        handle.stalled_at() < self.now()
    }

    /// Total number of requests waiting in host queues.
    pub fn queued(&self) -> usize {
        self.shared.registry.total_queued()
    }

    /// Stops the I/O thread and waits for it. Every outstanding request
    /// finishes with `Cancelled` first.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.waker.wake();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("I/O thread panicked");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared, mut multi: MultiHandle) {
    let clock = Clock::new();
    let wake_fd = shared.waker.read_fd();
    // Consecutive waits that found the session's deadline already due.
    let mut immediate = 0u32;

    loop {
        let now = clock.now();
        shared.now.store(now, Ordering::Relaxed);

        while let Some(command) = shared.commands.pop() {
            match command.verb {
                Verb::Add => multi.add(command.handle, &shared.registry, now),
                Verb::Remove => {
                    multi.remove(&command.handle, &shared.registry, now);
                }
                Verb::Boost => debug!("boost is reserved, ignoring {:?}", command.handle),
            }
        }
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let deadline = multi.timer_deadline();
        let timeout_ms = if deadline == NEVER {
            immediate = 0;
            DEFAULT_WAIT_MS
        } else if deadline > now {
            immediate = 0;
            cmp::min(deadline - now, DEFAULT_WAIT_MS)
        } else {
            immediate = immediate.saturating_add(1);
            if immediate == BACKOFF_WARN {
                warn!(
                    "session deadline due immediately {} times in a row",
                    immediate
                );
            }
            if immediate >= BACKOFF_TEN_MS {
                10
            } else if immediate >= BACKOFF_ONE_MS {
                1
            } else {
                0
            }
        };

        let ready;
        {
            let (read, write) = multi.poll_sets();
            read.refresh();
            write.refresh();
            read.set_extra(wake_fd);
            let nfds = cmp::max(cmp::max(read.max_fd_set(), write.max_fd_set()), wake_fd) + 1;
            let res = {
                // Hold the wake mutex across the wait; wakes that cannot
                // take it go through the pipe and interrupt select.
                let mut awoken = shared.waker.lock();
                let timeout_ms = if *awoken {
                    *awoken = false;
                    0
                } else {
                    timeout_ms
                };
                sys::select(
                    nfds,
                    Some(read.snapshot_mut()),
                    Some(write.snapshot_mut()),
                    timeout_ms,
                )
            };
            ready = match res {
                Ok(n) => {
                    if read.is_set(wake_fd) {
                        if !shared.waker.drain() {
                            // Nothing can wake us anymore.
                            shared.running.store(false, Ordering::SeqCst);
                        }
                        read.clr(wake_fd);
                        n - 1
                    } else {
                        n
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("multiplex wait failed: {}", e);
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
            };
        }

        let now = clock.now();
        shared.now.store(now, Ordering::Relaxed);
        if multi.timer_deadline() <= now {
            multi.timeout_expired(&shared.registry, now);
        }
        if ready > 0 {
            multi.dispatch_ready(&shared.registry, now);
        } else {
            multi.handle_stalls(&shared.registry, now);
        }
    }

    // Commands that raced the final drain still carry live callbacks.
    while let Some(command) = shared.commands.pop() {
        if command.verb == Verb::Add {
            command.handle.finish(TransferResult::Cancelled);
        }
    }
    multi.shutdown(&shared.registry, clock.now());
    debug!("I/O thread stopped");
}
