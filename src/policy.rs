//! Timeout policies for HTTP transfers.
//!
//! A policy bundles every knob of the stall/low-speed detector and of the
//! per-transfer timeouts handed to the session. Policies are shared,
//! named, and may be derived from a base policy; changing the base pushes
//! the new values down to every derivative.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

// Absolute ranges. Values outside of these make no sense operationally;
// out-of-range input is clamped with a warning rather than rejected.
const MIN_DNS_GRACE: u16 = 0;
const MAX_DNS_GRACE: u16 = 300;
const MIN_CONNECT: u16 = 1;
const MAX_CONNECT: u16 = 30;
const MIN_REPLY_DELAY: u16 = 1;
const MAX_REPLY_DELAY: u16 = 120;
const MIN_LOW_SPEED_WINDOW: u16 = 4;
const MAX_LOW_SPEED_WINDOW: u16 = 120;
const MIN_LOW_SPEED_LIMIT: u32 = 1;
const MAX_LOW_SPEED_LIMIT: u32 = 1_000_000;
const MIN_TRANSACTION: u16 = 60;
const MAX_TRANSACTION: u16 = 1200;
const MIN_TOTAL: u16 = 60;
const MAX_TOTAL: u16 = 3000;

/// The numeric knobs of one timeout policy. All times are in seconds,
/// the low-speed limit is in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyValues {
    /// Extra connect time granted the first time a hostname is contacted,
    /// to allow for a DNS lookup.
    pub dns_grace: u16,
    /// Connect timeout for subsequent connects to the same host.
    pub connect: u16,
    /// Maximum time between finishing the upload and the first reply byte.
    pub reply_delay: u16,
    /// Window over which the transfer rate is averaged.
    pub low_speed_window: u16,
    /// Rate floor; averaging below this over a full window aborts.
    pub low_speed_limit: u32,
    /// Timeout for the whole transaction, connect included.
    pub max_transaction: u16,
    /// Timeout from the moment of request, queue time included.
    pub max_total: u16,
}

impl Default for PolicyValues {
    fn default() -> Self {
        PolicyValues {
            dns_grace: 60,
            connect: 10,
            reply_delay: 60,
            low_speed_window: 30,
            low_speed_limit: 7000,
            max_transaction: 300,
            max_total: 600,
        }
    }
}

fn clamp_u16(name: &str, field: &str, v: u16, min: u16, max: u16) -> u16 {
    if v < min || v > max {
        let c = if v < min { min } else { max };
        warn!("policy {:?}: {} = {} out of [{}, {}], clamped to {}", name, field, v, min, max, c);
        c
    } else {
        v
    }
}

fn clamp_u32(name: &str, field: &str, v: u32, min: u32, max: u32) -> u32 {
    if v < min || v > max {
        let c = if v < min { min } else { max };
        warn!("policy {:?}: {} = {} out of [{}, {}], clamped to {}", name, field, v, min, max, c);
        c
    } else {
        v
    }
}

impl PolicyValues {
    fn clamped(self, name: &str) -> Self {
        PolicyValues {
            dns_grace: clamp_u16(name, "dns_grace", self.dns_grace, MIN_DNS_GRACE, MAX_DNS_GRACE),
            connect: clamp_u16(name, "connect", self.connect, MIN_CONNECT, MAX_CONNECT),
            reply_delay: clamp_u16(
                name,
                "reply_delay",
                self.reply_delay,
                MIN_REPLY_DELAY,
                MAX_REPLY_DELAY,
            ),
            low_speed_window: clamp_u16(
                name,
                "low_speed_window",
                self.low_speed_window,
                MIN_LOW_SPEED_WINDOW,
                MAX_LOW_SPEED_WINDOW,
            ),
            low_speed_limit: clamp_u32(
                name,
                "low_speed_limit",
                self.low_speed_limit,
                MIN_LOW_SPEED_LIMIT,
                MAX_LOW_SPEED_LIMIT,
            ),
            max_transaction: clamp_u16(
                name,
                "max_transaction",
                self.max_transaction,
                MIN_TRANSACTION,
                MAX_TRANSACTION,
            ),
            max_total: clamp_u16(name, "max_total", self.max_total, MIN_TOTAL, MAX_TOTAL),
        }
    }
}

/// A named, shared timeout policy.
pub struct Policy {
    name: String,
    values: Mutex<PolicyValues>,
    derived: Mutex<Vec<Arc<Policy>>>,
}

impl Policy {
    /// Creates a policy with the given values, clamped to the absolute
    /// ranges.
    pub fn new(name: &str, values: PolicyValues) -> Arc<Policy> {
        Arc::new(Policy {
            name: name.to_owned(),
            values: Mutex::new(values.clamped(name)),
            derived: Mutex::new(Vec::new()),
        })
    }

    /// Creates a policy that mirrors `base` and follows its changes.
    pub fn derive(base: &Arc<Policy>, name: &str) -> Arc<Policy> {
        let policy = Arc::new(Policy {
            name: name.to_owned(),
            values: Mutex::new(base.values()),
            derived: Mutex::new(Vec::new()),
        });
        base.derived.lock().unwrap().push(policy.clone());
        policy
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current values, by copy.
    pub fn values(&self) -> PolicyValues {
        *self.values.lock().unwrap()
    }

    /// Replaces the values (clamped) and propagates them to every policy
    /// derived from this one, recursively.
    pub fn set(&self, values: PolicyValues) {
        let values = values.clamped(&self.name);
        *self.values.lock().unwrap() = values;
        debug!("policy {:?} changed to {:?}", self.name, values);
        for derived in self.derived.lock().unwrap().iter() {
            derived.set(values);
        }
    }

    /// Connect timeout for a transfer to `hostname`: the configured
    /// connect time, plus the DNS grace the first time the host is seen.
    pub fn connect_timeout(&self, hostname: &str, seen: &mut SeenHosts) -> u16 {
        let values = self.values();
        let mut timeout = values.connect;
        if seen.first_sight(hostname) {
            timeout += values.dns_grace;
        }
        timeout
    }
}

/// Hostnames this engine has attempted to connect to.
///
/// Not shared: owned by the I/O thread. A hostname's first connect gets
/// the policy's DNS grace on top of the connect timeout; the grace is
/// consumed by that attempt regardless of its outcome. When a connect to
/// a host times out before anything was received, the host is dropped
/// from the set again, so the next attempt re-earns the grace.
pub struct SeenHosts {
    hosts: HashSet<String>,
}

impl SeenHosts {
    pub fn new() -> Self {
        SeenHosts {
            hosts: HashSet::new(),
        }
    }

    /// Marks `hostname` as seen; true when it was not seen before.
    fn first_sight(&mut self, hostname: &str) -> bool {
        self.hosts.insert(hostname.to_owned())
    }

    /// Reports a connect timeout (or resolve failure) for `hostname`;
    /// true when the host was in the set.
    pub fn connect_timed_out(&mut self, hostname: &str) -> bool {
        self.hosts.remove(hostname)
    }
}
