extern crate qianli;

use std::sync::Arc;

use qianli::policy::{Policy, PolicyValues, SeenHosts};
use qianli::request::TransferResult;
use qianli::timeout::{HttpTimeout, Phase, NEVER, TICKS_PER_SEC};

fn slow_policy() -> Arc<Policy> {
    Policy::new(
        "slow",
        PolicyValues {
            reply_delay: 2,
            low_speed_window: 4,
            low_speed_limit: 1000,
            ..Default::default()
        },
    )
}

fn sec(s: u64) -> u64 {
    s * TICKS_PER_SEC
}

#[test]
fn steady_rate_below_the_floor_aborts_after_a_full_window() {
    let mut timeout = HttpTimeout::new(slow_policy());
    // 500 B/s against a 1000 B/s floor averaged over 4 seconds.
    for s in 0..4 {
        assert!(!timeout.data_received(500, sec(s)));
    }
    assert!(timeout.data_received(500, sec(4)));
}

#[test]
fn a_fast_burst_each_window_keeps_the_transfer_alive() {
    let mut timeout = HttpTimeout::new(slow_policy());
    // 4100 bytes every 4th second averages just above the floor.
    for s in 0..40 {
        let bytes = if s % 4 == 0 { 4100 } else { 0 };
        assert!(!timeout.data_received(bytes, sec(s)), "aborted at second {}", s);
    }
}

#[test]
fn bytes_within_one_second_accumulate() {
    let mut timeout = HttpTimeout::new(slow_policy());
    assert!(!timeout.data_received(100, 0));
    for _ in 0..50 {
        assert!(!timeout.data_received(100, 500));
    }
    // 5100 bytes in the first bucket carry the transfer until that
    // bucket falls out of the window.
    for s in 1..4 {
        assert!(!timeout.data_received(0, sec(s)));
    }
    assert!(timeout.data_received(0, sec(4)));
}

#[test]
fn silence_arms_the_stalled_deadline() {
    let mut timeout = HttpTimeout::new(slow_policy());
    timeout.data_received(500, 0);
    assert!(!timeout.data_received(500, sec(1)));

    // 1000 bytes in a 4000 byte window: three more silent seconds and the
    // abort is certain.
    assert_eq!(timeout.stalled_at(), sec(4));
    assert!(!timeout.has_stalled(sec(4)));
    assert!(timeout.has_stalled(sec(4) + 1));
}

#[test]
fn upload_finished_starts_the_reply_delay() {
    let mut timeout = HttpTimeout::new(slow_policy());
    assert!(!timeout.data_sent(2000, sec(1)));
    assert_eq!(timeout.phase(), Phase::Uploading);
    assert!(timeout.is_uploading());

    timeout.upload_finished(sec(3));
    assert_eq!(timeout.phase(), Phase::WaitingForReply);
    // reply_delay is 2 seconds.
    assert_eq!(timeout.stalled_at(), sec(5));

    // The first reply byte ends the wait and re-arms rate detection.
    assert!(!timeout.data_received(300, sec(4)));
    assert_eq!(timeout.phase(), Phase::Receiving);
    assert_eq!(timeout.stalled_at(), NEVER);
}

#[test]
fn first_byte_infers_a_missed_upload_finished() {
    let mut timeout = HttpTimeout::new(slow_policy());
    // A bodyless request: no data was ever sent, the reply just arrives.
    assert!(!timeout.data_received(100, sec(2)));
    assert_eq!(timeout.phase(), Phase::Receiving);
    assert!(!timeout.is_uploading());
}

#[test]
fn connect_timeout_reports_the_host() {
    let policy = slow_policy();
    let mut seen = SeenHosts::new();
    policy.connect_timeout("farm.test", &mut seen);

    let mut timeout = HttpTimeout::new(policy.clone());
    timeout.done(TransferResult::TimedOut, "farm.test", &mut seen);
    assert_eq!(timeout.phase(), Phase::Done);

    // The host was dropped from the seen set, so the next connect gets
    // the DNS grace again.
    let values = policy.values();
    assert_eq!(
        policy.connect_timeout("farm.test", &mut seen),
        values.connect + values.dns_grace
    );
}

#[test]
fn done_after_data_does_not_reset_the_host() {
    let policy = slow_policy();
    let mut seen = SeenHosts::new();
    policy.connect_timeout("farm.test", &mut seen);

    let mut timeout = HttpTimeout::new(policy.clone());
    timeout.data_received(500, 0);
    timeout.done(TransferResult::TimedOut, "farm.test", &mut seen);

    assert_eq!(
        policy.connect_timeout("farm.test", &mut seen),
        policy.values().connect
    );
}
