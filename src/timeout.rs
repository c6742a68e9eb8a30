//! Per-transfer stall and low-speed detection.
//!
//! The session's own rate check measures the rate between two successive
//! data callbacks, which spikes wildly once data does arrive in bursts.
//! The only correct way to measure a transfer rate is to actually average
//! it: [`HttpTimeout`] keeps a ring of per-second byte buckets spanning
//! the policy's low-speed window and aborts when a full window averages
//! below the policy's rate floor.
//!
//! Every check also computes the earliest moment at which total silence
//! would certainly breach the floor, and arms a "stalled-at" deadline for
//! it. The main loop sweeps those deadlines on every wait timeout, so a
//! transfer that goes completely quiet is caught without any further I/O
//! event.
//!
//! All comparisons use a monotonic tick sampled once per multiplex-wait
//! return, never the wall clock.

use std::sync::Arc;
use std::time::Instant;

use policy::{Policy, SeenHosts};
use request::TransferResult;

/// Monotonic engine time, in milliseconds since the engine started.
pub type Tick = u64;

pub const TICKS_PER_SEC: u64 = 1000;

/// A deadline that never fires.
pub const NEVER: Tick = ::std::u64::MAX;

/// Source of [`Tick`]s. One per engine; the I/O thread samples it once
/// per `select` return.
pub struct Clock {
    base: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            base: Instant::now(),
        }
    }

    pub fn now(&self) -> Tick {
        let elapsed = self.base.elapsed();
        elapsed.as_secs() * TICKS_PER_SEC + u64::from(elapsed.subsec_nanos() / 1_000_000)
    }
}

/// Where in its life a transfer currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Uploading,
    WaitingForReply,
    Receiving,
    Done,
}

/// Timeout administration for one transfer.
pub struct HttpTimeout {
    policy: Arc<Policy>,
    // Ring of bytes transferred per second, sized to the policy window.
    // The window is sampled when the detector is (re)armed; a policy
    // change applies from the next arm on.
    window: usize,
    buckets: Vec<u32>,
    // Ring index corresponding to `last_second`.
    bucket: usize,
    // Sum of all bucket contents.
    total_bytes: u32,
    // Seconds since `low_speed_clock` at the last lowspeed() call, or -1
    // right after (re)arming.
    last_second: i64,
    // Tick at which low-speed detection (re)started.
    low_speed_clock: Tick,
    // True while a low-speed window is armed (uploading or receiving).
    low_speed_on: bool,
    // Nothing was received yet; the reply header is the first thing that
    // ever arrives.
    nothing_received_yet: bool,
    upload_done: bool,
    finished: bool,
    // Tick at which the transfer counts as stalled when nothing more is
    // transferred, or NEVER.
    stalled: Tick,
}

impl HttpTimeout {
    pub fn new(policy: Arc<Policy>) -> Self {
        HttpTimeout {
            policy,
            window: 0,
            buckets: Vec::new(),
            bucket: 0,
            total_bytes: 0,
            last_second: -1,
            low_speed_clock: 0,
            low_speed_on: false,
            nothing_received_yet: true,
            upload_done: false,
            finished: false,
            stalled: NEVER,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.finished {
            Phase::Done
        } else if !self.nothing_received_yet {
            Phase::Receiving
        } else if self.upload_done {
            Phase::WaitingForReply
        } else if self.low_speed_on {
            Phase::Uploading
        } else {
            Phase::Connecting
        }
    }

    /// Body data went out to the server. The first call is also the only
    /// way to learn that the connect succeeded; it arms the low-speed
    /// window. Returns true when the transfer should be aborted.
    pub fn data_sent(&mut self, n: usize, now: Tick) -> bool {
        if !self.low_speed_on {
            self.reset_lowspeed(now);
        }
        self.lowspeed(n, now)
    }

    /// Everything there was to send has been sent. Disarms the low-speed
    /// window and starts the reply-delay deadline.
    ///
    /// There is no explicit "upload complete" event in the session
    /// contract; this is inferred when output interest is dropped after
    /// data went out, or lazily on the first received byte for bodyless
    /// requests. Getting here twice means that inference misfired.
    pub fn upload_finished(&mut self, now: Tick) {
        debug_assert!(!self.upload_done);
        self.upload_done = true;
        self.low_speed_on = false;
        let reply_delay = u64::from(self.policy.values().reply_delay);
        self.stalled = now + reply_delay * TICKS_PER_SEC;
    }

    /// Data arrived from the server. The first byte ends the waiting
    /// phase (inferring a missed [`upload_finished`](HttpTimeout::upload_finished)
    /// for bodyless requests) and re-arms the low-speed window. Returns
    /// true when the transfer should be aborted.
    pub fn data_received(&mut self, n: usize, now: Tick) -> bool {
        if self.nothing_received_yet && n > 0 {
            if !self.upload_done {
                self.upload_finished(now);
            }
            // A redirect can reuse this record for a second upload; allow
            // upload_finished() to fire again for it.
            self.upload_done = false;
            self.nothing_received_yet = false;
            self.reset_lowspeed(now);
        }
        if self.low_speed_on {
            self.lowspeed(n, now)
        } else {
            false
        }
    }

    /// The transfer ended. On a timeout or resolve failure with nothing
    /// ever received, the hostname is reported so its next connect gets
    /// the DNS grace again. Always disarms the timers.
    pub fn done(&mut self, result: TransferResult, hostname: &str, seen: &mut SeenHosts) {
        let connect_failed = result == TransferResult::TimedOut
            || result == TransferResult::ResolveError;
        if connect_failed && self.nothing_received_yet {
            if result == TransferResult::ResolveError {
                warn!("failed to resolve hostname {:?}", hostname);
            }
            if seen.connect_timed_out(hostname) {
                debug!("re-arming DNS grace for host {:?}", hostname);
            }
        }
        self.low_speed_on = false;
        self.stalled = NEVER;
        self.finished = true;
    }

    /// True when the stalled-at deadline has passed.
    #[inline]
    pub fn has_stalled(&self, now: Tick) -> bool {
        self.stalled < now
    }

    /// The current stalled-at deadline, or [`NEVER`].
    #[inline]
    pub fn stalled_at(&self) -> Tick {
        self.stalled
    }

    /// True while data is going out and nothing came back yet: the phase
    /// in which dropped output interest means the upload finished.
    pub fn is_uploading(&self) -> bool {
        self.low_speed_on && self.nothing_received_yet && !self.upload_done
    }

    fn reset_lowspeed(&mut self, now: Tick) {
        self.low_speed_clock = now;
        self.low_speed_on = true;
        self.window = self.policy.values().low_speed_window as usize;
        if self.window > self.buckets.len() {
            self.buckets.resize(self.window, 0);
        }
        self.last_second = -1; // lowspeed() initializes the rest
        self.stalled = NEVER; // stop the reply-delay deadline
    }

    /// Accounts `bytes` transferred at `now` and returns true when the
    /// average rate over a full window dropped below the policy floor.
    fn lowspeed(&mut self, bytes: usize, now: Tick) -> bool {
        debug_assert!(now >= self.low_speed_clock);
        let second = ((now - self.low_speed_clock) / TICKS_PER_SEC) as i64;

        // Same wall second as the previous call: accumulate only.
        if second == self.last_second {
            self.total_bytes += bytes as u32;
            self.buckets[self.bucket] += bytes as u32;
            return false;
        }

        // At most once per second from here on.
        let window = self.window;
        let prev_second = self.last_second;
        self.last_second = second;

        if prev_second == -1 {
            // First call since (re)arming.
            for bucket in self.buckets.iter_mut() {
                *bucket = 0;
            }
            self.bucket = 0;
            self.total_bytes = bytes as u32;
            self.buckets[0] = bytes as u32;
            return false;
        }

        // Advance the ring, evicting every skipped second.
        let mut bucket = self.bucket;
        let mut s = prev_second;
        loop {
            bucket += 1;
            if bucket == window {
                bucket = 0;
            }
            s += 1;
            if s == second {
                break;
            }
            self.total_bytes -= self.buckets[bucket];
            self.buckets[bucket] = 0;
        }
        self.bucket = bucket;
        self.total_bytes -= self.buckets[bucket];
        self.total_bytes += bytes as u32;
        self.buckets[bucket] = bytes as u32;

        let values = self.policy.values();
        let min_total = values.low_speed_limit * window as u32;
        if second >= window as i64 && self.total_bytes < min_total {
            warn!(
                "aborting slow transfer (average rate below {} B/s over {} s)",
                values.low_speed_limit, window
            );
            return true;
        }

        // How many seconds of total silence until the abort above would
        // certainly trigger? Arm the stalled-at deadline for that moment
        // so the stall sweep catches silence between I/O events.
        let mut max_stall = 0i64;
        let mut dropped = 0u32;
        loop {
            bucket += 1;
            if bucket == window {
                bucket = 0;
            }
            max_stall += 1;
            dropped += self.buckets[bucket];
            // Once max_stall reaches the window size, dropped equals
            // total_bytes and the condition below holds.
            if second + max_stall >= window as i64 && self.total_bytes - dropped < min_total {
                break;
            }
        }
        self.stalled = now + max_stall as u64 * TICKS_PER_SEC;

        false
    }
}
