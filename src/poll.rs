//! Single-direction descriptor readiness sets for a level-triggered
//! `select()` loop, and an iterator that merges the read and write sets
//! into one stream of ready events.
//!
//! `select()`-style APIs give no cheap way to iterate only the ready
//! members of a large set, and their capacity is fixed at `FD_SETSIZE`.
//! A `PollSet` therefore keeps its own dense descriptor array (up to
//! [`MAXSIZE`]) and copies a bounded window of it into the native set on
//! every [`refresh`](PollSet::refresh), rotating the window's start so no
//! descriptor is starved when the active set outgrows the OS limit.

use std::cmp;
use std::os::unix::io::RawFd;

use sys::{self, FdSet};

/// A `PollSet` can watch at least 1024 descriptors, or `FD_SETSIZE` if
/// that is larger.
pub const MAXSIZE: usize = if_larger(1024, sys::FD_SETSIZE);

const fn if_larger(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

bitflags! {
    /// Readiness directions reported for one descriptor.
    pub struct Events: u32 {
        const IN  = 0x1;
        const OUT = 0x2;
    }
}

bitflags! {
    /// Outcome of [`PollSet::refresh`].
    pub struct Refresh: u32 {
        /// The snapshot contains no descriptors.
        const EMPTY    = 0x1;
        /// Every watched descriptor was copied into the snapshot.
        const COMPLETE = 0x2;
    }
}

/// One direction (read or write) of watched descriptors.
pub struct PollSet {
    // Watched descriptors, contiguous, in insertion order.
    fds: Vec<RawFd>,
    // Index of the first descriptor to copy on the next refresh().
    next: usize,
    // Native set passed to select(). (Re)initialized by refresh().
    snapshot: FdSet,
    // Largest watched descriptor, or -1 when there is none.
    max_fd: RawFd,
    // Largest descriptor placed in the snapshot by refresh(), or -1.
    max_fd_set: RawFd,
    // Descriptors copied into the snapshot by the last refresh().
    copied: Vec<RawFd>,
    // Iteration index into `copied`.
    iter: usize,
}

impl PollSet {
    pub fn new() -> Self {
        PollSet {
            fds: Vec::with_capacity(cmp::min(MAXSIZE, 64)),
            next: 0,
            snapshot: FdSet::new(),
            max_fd: -1,
            max_fd_set: -1,
            copied: Vec::new(),
            iter: 0,
        }
    }

    /// Starts watching `fd`. Adding a descriptor twice is a caller bug.
    pub fn add(&mut self, fd: RawFd) {
        debug_assert!(!self.fds.contains(&fd));
        assert!(self.fds.len() < MAXSIZE);
        self.fds.push(fd);
        self.max_fd = cmp::max(self.max_fd, fd);
    }

    /// Stops watching `fd`, preserving the order of the remaining
    /// descriptors.
    ///
    /// Also clears `fd` from the live snapshot, so a removed descriptor
    /// can never be reported ready later in the current iteration.
    pub fn remove(&mut self, fd: RawFd) {
        let pos = match self.fds.iter().position(|&s| s == fd) {
            Some(pos) => pos,
            None => {
                debug_assert!(false, "removing descriptor that was never added");
                return;
            }
        };
        self.fds.remove(pos);
        if self.next > pos {
            self.next -= 1;
        }
        if self.next >= self.fds.len() {
            self.next = 0;
        }
        if fd == self.max_fd {
            self.max_fd = self.fds.iter().cloned().fold(-1, cmp::max);
        }
        self.clr(fd);
    }

    /// Returns true when `fd` is currently watched.
    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.contains(&fd)
    }

    /// Returns true when `fd` is set in the live snapshot.
    #[inline]
    pub fn is_set(&self, fd: RawFd) -> bool {
        self.snapshot.is_set(fd)
    }

    /// Clears `fd` from the live snapshot.
    #[inline]
    pub fn clr(&mut self, fd: RawFd) {
        self.snapshot.clear(fd);
    }

    /// Merges an external descriptor (the wake pipe) into the snapshot.
    #[inline]
    pub(crate) fn set_extra(&mut self, fd: RawFd) {
        self.snapshot.set(fd);
    }

    /// Largest descriptor placed in the snapshot by the last refresh, or
    /// -1 when the snapshot is empty.
    #[inline]
    pub fn max_fd_set(&self) -> RawFd {
        self.max_fd_set
    }

    /// The native set, for passing to `select`.
    #[inline]
    pub(crate) fn snapshot_mut(&mut self) -> &mut FdSet {
        &mut self.snapshot
    }

    /// Copies up to `FD_SETSIZE - 1` watched descriptors into the
    /// snapshot, starting at the rotating cursor. One native slot stays
    /// reserved for the wake descriptor.
    ///
    /// When every watched descriptor fits, the cursor resets to 0; when
    /// it does not, the cursor advances past the copied window so that
    /// repeated calls cycle through the whole set.
    pub fn refresh(&mut self) -> Refresh {
        self.snapshot.zero();
        self.copied.clear();

        if self.fds.is_empty() {
            self.max_fd_set = -1;
            return Refresh::EMPTY | Refresh::COMPLETE;
        }

        debug_assert!(self.next < self.fds.len());
        if self.fds.len() >= sys::FD_SETSIZE {
            warn!(
                "More than FD_SETSIZE ({}) descriptors active!",
                sys::FD_SETSIZE
            );
            // The snapshot will hold only a window of the set; compute
            // its maximum over the window instead of using max_fd.
            let mut max = -1;
            let mut i = self.next;
            let mut count = 0;
            while count + 1 < sys::FD_SETSIZE {
                max = cmp::max(max, self.fds[i]);
                count += 1;
                i += 1;
                if i == self.fds.len() {
                    i = 0;
                }
            }
            self.max_fd_set = max;
        } else {
            self.next = 0;
            self.max_fd_set = self.max_fd;
        }

        let mut count = 0;
        let mut i = self.next;
        loop {
            count += 1;
            if count == sys::FD_SETSIZE {
                self.next = i;
                return Refresh::empty();
            }
            self.snapshot.set(self.fds[i]);
            self.copied.push(self.fds[i]);
            i += 1;
            if i == self.fds.len() {
                if self.next == 0 {
                    break;
                }
                // Only reachable when len >= FD_SETSIZE; wrap around and
                // terminate on count reaching FD_SETSIZE.
                i = 0;
            }
        }
        Refresh::COMPLETE
    }

    /// Resets the iterator over descriptors that were copied by the last
    /// [`refresh`](PollSet::refresh) and are still set in the snapshot.
    pub fn reset(&mut self) {
        self.iter = 0;
        self.skip_cleared();
    }

    /// Current descriptor, or `None` when the iteration is exhausted.
    ///
    /// Only valid after [`reset`](PollSet::reset) was called for the last
    /// [`refresh`](PollSet::refresh).
    #[inline]
    pub fn get(&self) -> Option<RawFd> {
        self.copied.get(self.iter).cloned()
    }

    /// Advances to the next still-set descriptor. Only call when the last
    /// [`get`](PollSet::get) returned a descriptor.
    pub fn next(&mut self) {
        debug_assert!(self.iter < self.copied.len());
        self.iter += 1;
        self.skip_cleared();
    }

    fn skip_cleared(&mut self) {
        while self.iter < self.copied.len() && !self.snapshot.is_set(self.copied[self.iter]) {
            self.iter += 1;
        }
    }
}

/// Walks two `PollSet`s' ready snapshots, emitting each ready descriptor
/// exactly once.
///
/// A descriptor ready in both sets yields one event with the combined
/// mask, either because both iterators are positioned on it, or through
/// the cross-set snapshot check when they are not.
pub struct MergeIterator<'a> {
    read: &'a mut PollSet,
    write: &'a mut PollSet,
}

impl<'a> MergeIterator<'a> {
    pub fn new(read: &'a mut PollSet, write: &'a mut PollSet) -> Self {
        read.reset();
        write.reset();
        MergeIterator { read, write }
    }

    pub fn next(&mut self) -> Option<(RawFd, Events)> {
        let rfd = self.read.get();
        let wfd = self.write.get();
        match (rfd, wfd) {
            (None, None) => None,
            (Some(r), Some(w)) if r == w => {
                self.read.next();
                self.write.next();
                Some((r, Events::IN | Events::OUT))
            }
            (Some(r), w) if w.map_or(true, |w| r < w) => {
                let mut events = Events::IN;
                self.read.next();
                // The write set may have this descriptor beyond its copied
                // window; still coalesce if its raw snapshot says ready.
                if w.is_some() && self.write.is_set(r) {
                    events |= Events::OUT;
                    self.write.clr(r);
                }
                Some((r, events))
            }
            (r, Some(w)) => {
                let mut events = Events::OUT;
                self.write.next();
                if r.is_some() && self.read.is_set(w) {
                    events |= Events::IN;
                    self.read.clr(w);
                }
                Some((w, events))
            }
            // All four shapes are covered above; rustc cannot see it.
            _ => unreachable!(),
        }
    }
}
