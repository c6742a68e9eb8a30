use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use libc;

pub(crate) const FD_SETSIZE: usize = libc::FD_SETSIZE as usize;

pub(crate) trait ErrRes {
    fn err_res() -> Self;
}

impl ErrRes for i32 {
    #[inline]
    fn err_res() -> Self {
        -1
    }
}

impl ErrRes for isize {
    #[inline]
    fn err_res() -> Self {
        -1
    }
}

#[inline]
pub(crate) fn cvt<V: ErrRes + PartialEq<V>>(v: V) -> io::Result<V> {
    if v != V::err_res() {
        Ok(v)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Wrapper around the native `fd_set` for `select(2)`.
pub(crate) struct FdSet {
    inner: libc::fd_set,
}

impl FdSet {
    #[inline]
    pub(crate) fn new() -> Self {
        let mut set = FdSet {
            inner: unsafe { mem::zeroed() },
        };
        set.zero();
        set
    }

    #[inline]
    pub(crate) fn zero(&mut self) {
        unsafe { libc::FD_ZERO(&mut self.inner) };
    }

    #[inline]
    pub(crate) fn set(&mut self, fd: RawFd) {
        debug_assert!(fd >= 0 && (fd as usize) < FD_SETSIZE);
        unsafe { libc::FD_SET(fd, &mut self.inner) };
    }

    #[inline]
    pub(crate) fn clear(&mut self, fd: RawFd) {
        debug_assert!(fd >= 0 && (fd as usize) < FD_SETSIZE);
        unsafe { libc::FD_CLR(fd, &mut self.inner) };
    }

    #[inline]
    pub(crate) fn is_set(&self, fd: RawFd) -> bool {
        debug_assert!(fd >= 0 && (fd as usize) < FD_SETSIZE);
        unsafe { libc::FD_ISSET(fd, &self.inner as *const _ as *mut _) }
    }

    #[inline]
    fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.inner
    }
}

/// Blocks in `select(2)` for at most `timeout_ms` milliseconds.
///
/// Returns the number of ready descriptors; 0 means the timeout expired.
pub(crate) fn select(
    nfds: i32,
    read: Option<&mut FdSet>,
    write: Option<&mut FdSet>,
    timeout_ms: u64,
) -> io::Result<usize> {
    let mut timeout = libc::timeval {
        tv_sec: (timeout_ms / 1000) as libc::time_t,
        tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
    };
    let read_ptr = read.map_or(ptr::null_mut(), |s| s.as_mut_ptr());
    let write_ptr = write.map_or(ptr::null_mut(), |s| s.as_mut_ptr());
    let res = unsafe { libc::select(nfds, read_ptr, write_ptr, ptr::null_mut(), &mut timeout) };
    Ok(cvt(res)? as usize)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL, 0) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(drop)
}

/// Creates the non-blocking self-pipe used to interrupt `select`.
///
/// Returns `(read_end, write_end)`; ownership of both descriptors moves to
/// the caller.
pub(crate) fn wake_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    for &fd in fds.iter() {
        if let Err(e) = set_nonblocking(fd) {
            close(fds[0]);
            close(fds[1]);
            return Err(e);
        }
    }
    Ok((fds[0], fds[1]))
}

#[inline]
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
    Ok(cvt(res)? as usize)
}

#[inline]
pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
    Ok(cvt(res)? as usize)
}

pub(crate) fn close(fd: RawFd) {
    let res = unsafe { libc::close(fd) };
    cvt(res)
        .map(drop)
        .unwrap_or_else(|e| error!("Failed to close fd {}: {}", fd, e));
}
