//! An engine for driving many concurrent HTTP transfers from one dedicated
//! I/O thread.
//!
//! The engine owns a non-blocking multiplexing [`Session`](session::Session)
//! and a `select()`-style readiness loop. Submitting threads hand requests
//! over through a lock-minimal command queue and a wake pipe; the I/O thread
//! admits them into the session (or defers them per host), dispatches
//! readiness events, and aborts transfers that stall below a configured
//! transfer rate.

#[macro_use]
extern crate log;

#[macro_use]
extern crate bitflags;

#[cfg(unix)]
extern crate libc;

mod sys;

pub mod poll;
pub mod policy;
pub mod timeout;
pub mod host;
pub mod request;
pub mod session;
pub mod command;
pub mod multi;
pub mod engine;

pub use engine::{Config, Engine};
pub use command::Verb;
pub use request::{Request, RequestHandle, State, TransferResult};
