extern crate env_logger;
extern crate qianli;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use qianli::policy::Policy;
use qianli::poll::Events;
use qianli::session::{Mailbox, Notice, Session, Step, TransferId, TransferOpts};
use qianli::{Config, Engine, Request, State, TransferResult};

/// Completes every transfer with `Ok` on the next timeout action.
struct InstantSession {
    pending: Vec<TransferId>,
}

impl Session for InstantSession {
    fn add(&mut self, id: TransferId, _opts: TransferOpts, mailbox: &Mailbox) -> io::Result<()> {
        self.pending.push(id);
        mailbox.post(Notice::Timeout { millis: 0 });
        Ok(())
    }

    fn remove(&mut self, id: TransferId, _mailbox: &Mailbox) {
        self.pending.retain(|&pending| pending != id);
    }

    fn socket_action(&mut self, _fd: RawFd, _events: Events, mailbox: &Mailbox) -> Step {
        for id in self.pending.drain(..) {
            mailbox.post(Notice::Completed {
                id,
                result: TransferResult::Ok,
            });
        }
        Step::Done
    }
}

/// Accepts transfers and then sits on them until shutdown.
struct HoldSession;

impl Session for HoldSession {
    fn add(&mut self, _id: TransferId, _opts: TransferOpts, _mailbox: &Mailbox) -> io::Result<()> {
        Ok(())
    }

    fn remove(&mut self, _id: TransferId, _mailbox: &Mailbox) {}

    fn socket_action(&mut self, _fd: RawFd, _events: Events, _mailbox: &Mailbox) -> Step {
        Step::Done
    }
}

fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let start = Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "timed out waiting for {}",
            what
        );
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn requests_complete_through_the_engine() {
    let _ = env_logger::init();
    let mut engine = Engine::start(Config::default(), || InstantSession {
        pending: Vec::new(),
    }).unwrap();
    let policy = Policy::new("test", Default::default());

    let (tx, rx) = mpsc::channel();
    let count = 20;
    let handles: Vec<_> = (0..count)
        .map(|i| {
            let tx = tx.clone();
            let handle = Request::new(&format!("http://host{}.test/asset", i), policy.clone())
                .on_complete(move |result| tx.send(result).unwrap())
                .handle();
            engine.add(handle.clone());
            handle
        })
        .collect();

    for _ in 0..count {
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, TransferResult::Ok);
    }
    for handle in &handles {
        assert_eq!(handle.state(), State::Finished);
    }
    engine.shutdown();
}

#[test]
fn submissions_from_many_threads() {
    let engine = Arc::new(
        Engine::start(Config::default(), || InstantSession {
            pending: Vec::new(),
        }).unwrap(),
    );
    let policy = Policy::new("test", Default::default());

    let (tx, rx) = mpsc::channel();
    let workers: Vec<_> = (0..4)
        .map(|t| {
            let engine = engine.clone();
            let policy = policy.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let tx = tx.clone();
                    let handle =
                        Request::new(&format!("http://t{}.test/{}", t, i), policy.clone())
                            .on_complete(move |result| tx.send(result).unwrap())
                            .handle();
                    engine.add(handle);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for _ in 0..100 {
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            TransferResult::Ok
        );
    }
}

#[test]
fn a_submission_interrupts_the_multiplex_wait() {
    let mut engine = Engine::start(Config::default(), || HoldSession).unwrap();
    let policy = Policy::new("test", Default::default());

    // With a silent session the loop would otherwise sit in its full
    // one second fallback wait; give it time to settle into that wait.
    thread::sleep(Duration::from_millis(50));

    let handle = Request::new("http://lag.test/one", policy).handle();
    let submitted = Instant::now();
    engine.add(handle.clone());
    while handle.state() != State::Active {
        assert!(
            submitted.elapsed() < Duration::from_millis(250),
            "submission waited out the fallback timeout"
        );
        thread::sleep(Duration::from_millis(1));
    }

    engine.shutdown();
    assert_eq!(handle.result(), Some(TransferResult::Cancelled));
}

#[test]
fn adds_after_shutdown_are_cancelled() {
    let mut engine = Engine::start(Config::default(), || HoldSession).unwrap();
    engine.shutdown();

    let policy = Policy::new("test", Default::default());
    let (tx, rx) = mpsc::channel();
    let handle = Request::new("http://late.test/one", policy)
        .on_complete(move |result| tx.send(result).unwrap())
        .handle();
    engine.add(handle.clone());

    assert_eq!(rx.try_recv().unwrap(), TransferResult::Cancelled);
    assert_eq!(handle.state(), State::Finished);
}

#[test]
fn host_cap_defers_overflow_and_shutdown_cancels() {
    let mut engine = Engine::start(
        Config {
            max_active_per_host: 2,
            ..Default::default()
        },
        || HoldSession,
    ).unwrap();
    let policy = Policy::new("test", Default::default());

    let (tx, rx) = mpsc::channel();
    let handles: Vec<_> = (0..5)
        .map(|i| {
            let tx = tx.clone();
            let handle = Request::new(&format!("http://farm.test/{}", i), policy.clone())
                .on_complete(move |result| tx.send(result).unwrap())
                .handle();
            engine.add(handle.clone());
            handle
        })
        .collect();

    wait_until("overflow to queue up", || engine.queued() == 3);
    let active = handles
        .iter()
        .filter(|h| h.state() == State::Active)
        .count();
    assert_eq!(active, 2);

    engine.shutdown();
    for _ in 0..5 {
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            TransferResult::Cancelled
        );
    }
    for handle in &handles {
        assert_eq!(handle.state(), State::Finished);
    }
}
