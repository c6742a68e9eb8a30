extern crate qianli;

use std::collections::HashSet;
use std::os::unix::io::RawFd;

use qianli::poll::{Events, MergeIterator, PollSet, Refresh};

fn copied(set: &mut PollSet) -> Vec<RawFd> {
    let mut fds = Vec::new();
    set.reset();
    while let Some(fd) = set.get() {
        fds.push(fd);
        set.next();
    }
    fds
}

#[test]
fn refresh_of_empty_set() {
    let mut set = PollSet::new();
    let refresh = set.refresh();
    assert!(refresh.contains(Refresh::EMPTY));
    assert!(refresh.contains(Refresh::COMPLETE));
    assert_eq!(set.max_fd_set(), -1);
}

#[test]
fn refresh_copies_everything_when_it_fits() {
    let mut set = PollSet::new();
    for fd in &[3, 5, 9] {
        set.add(*fd);
    }
    let refresh = set.refresh();
    assert!(refresh.contains(Refresh::COMPLETE));
    assert!(!refresh.contains(Refresh::EMPTY));
    assert_eq!(set.max_fd_set(), 9);
    assert_eq!(copied(&mut set), vec![3, 5, 9]);
}

#[test]
fn remove_preserves_order_and_snapshot() {
    let mut set = PollSet::new();
    for fd in 0..8 {
        set.add(fd);
    }
    set.refresh();
    set.remove(3);
    // A removed descriptor is cleared from the live snapshot and never
    // visited again.
    assert!(!set.is_set(3));
    assert_eq!(copied(&mut set), vec![0, 1, 2, 4, 5, 6, 7]);
    assert!(!set.contains(3));
    assert_eq!(set.refresh(), Refresh::COMPLETE);
    assert_eq!(copied(&mut set), vec![0, 1, 2, 4, 5, 6, 7]);
}

#[test]
fn remove_recomputes_max_fd() {
    let mut set = PollSet::new();
    set.add(4);
    set.add(17);
    set.remove(17);
    set.refresh();
    assert_eq!(set.max_fd_set(), 4);
}

// With more active descriptors than select() can take, each refresh
// copies a bounded window and the window rotates, so successive
// refreshes cover the whole set and no descriptor is starved.
#[test]
fn oversized_set_rotates_without_starvation() {
    let size = qianli::poll::MAXSIZE;
    let mut set = PollSet::new();
    for fd in 0..size as RawFd {
        set.add(fd);
    }

    let mut seen = HashSet::new();
    let mut refreshes = 0;
    loop {
        let refresh = set.refresh();
        assert!(!refresh.contains(Refresh::COMPLETE));
        let window = copied(&mut set);
        // One native slot stays reserved for the wake descriptor.
        assert!(window.len() < size);
        for fd in window {
            seen.insert(fd);
        }
        refreshes += 1;
        if seen.len() == size {
            break;
        }
        assert!(refreshes < 4, "rotation failed to cover the whole set");
    }
    assert!(refreshes >= 2);
}

fn ready_events(read: &mut PollSet, write: &mut PollSet) -> Vec<(RawFd, Events)> {
    // refresh() marks every watched descriptor in the snapshot, which is
    // exactly what select() does when all of them are ready.
    read.refresh();
    write.refresh();
    let mut ready = Vec::new();
    let mut events = MergeIterator::new(read, write);
    while let Some(event) = events.next() {
        ready.push(event);
    }
    ready
}

#[test]
fn merge_emits_each_descriptor_once() {
    let mut read = PollSet::new();
    let mut write = PollSet::new();
    read.add(3);
    read.add(7);
    write.add(5);
    write.add(7);

    let ready = ready_events(&mut read, &mut write);
    assert_eq!(
        ready,
        vec![
            (3, Events::IN),
            (5, Events::OUT),
            (7, Events::IN | Events::OUT),
        ]
    );
}

#[test]
fn merge_with_one_side_empty() {
    let mut read = PollSet::new();
    let mut write = PollSet::new();
    write.add(6);
    write.add(2);

    let ready = ready_events(&mut read, &mut write);
    assert_eq!(ready, vec![(6, Events::OUT), (2, Events::OUT)]);
}

#[test]
fn merge_skips_cleared_descriptors() {
    let mut read = PollSet::new();
    read.add(3);
    read.add(5);
    read.add(8);
    read.refresh();
    read.clr(5);
    let mut write = PollSet::new();
    write.refresh();

    let mut ready = Vec::new();
    {
        let mut events = MergeIterator::new(&mut read, &mut write);
        while let Some(event) = events.next() {
            ready.push(event);
        }
    }
    assert_eq!(ready, vec![(3, Events::IN), (8, Events::IN)]);
}
