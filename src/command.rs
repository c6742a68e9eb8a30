//! The command queue between application threads and the I/O thread, and
//! the waker that interrupts the multiplex wait.
//!
//! Application threads never touch the session; they append a command and
//! wake the I/O thread, which drains the queue at the top of its loop.
//!
//! The waker avoids a syscall per wake: the I/O thread holds the wake
//! mutex for the whole multiplex wait, so a producer that manages to grab
//! it knows the I/O thread is awake and a flag is enough. Only when the
//! mutex is contended (the I/O thread is waiting, or about to) does the
//! producer write a byte into the self-pipe to interrupt `select`.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, MutexGuard};

use request::RequestHandle;
use sys;

/// What to do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Attach the request (or queue it behind its host's cap).
    Add,
    /// Abort the request wherever it is.
    Remove,
    /// Reserved for prioritization; ignored at drain time.
    Boost,
}

#[derive(Debug)]
pub struct Command {
    pub verb: Verb,
    pub handle: RequestHandle,
}

/// Multi-producer command queue, drained only by the I/O thread.
pub struct CommandQueue {
    commands: Mutex<VecDeque<Command>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        CommandQueue {
            commands: Mutex::new(VecDeque::new()),
        }
    }

    pub fn submit(&self, verb: Verb, handle: RequestHandle) {
        self.commands
            .lock()
            .unwrap()
            .push_back(Command { verb, handle });
    }

    /// Pops one command. The drainer acts on it after releasing the
    /// queue lock, so producers are never blocked behind command
    /// processing.
    pub fn pop(&self) -> Option<Command> {
        self.commands.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().unwrap().is_empty()
    }
}

/// Wakes the I/O thread out of its multiplex wait.
pub struct Waker {
    // Held (through lock()) by the I/O thread across the wait.
    flag: Mutex<bool>,
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let (read_fd, write_fd) = sys::wake_pipe()?;
        Ok(Waker {
            flag: Mutex::new(false),
            read_fd,
            write_fd,
        })
    }

    /// The pipe's read end, watched by the I/O thread alongside the
    /// session's sockets.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Producer side. Cheap when the I/O thread is awake; one pipe write
    /// when it is (about to go) waiting.
    pub fn wake(&self) {
        if let Ok(mut flag) = self.flag.try_lock() {
            *flag = true;
            return;
        }
        loop {
            match sys::write(self.write_fd, &[1]) {
                Ok(_) => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Pipe full: plenty of wake bytes pending already.
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("Failed to write to wake pipe: {}", e);
                    return;
                }
            }
        }
    }

    /// Takes the wake mutex. The I/O thread clears the flag through the
    /// guard, then keeps holding the guard across the multiplex wait so
    /// that concurrent wakes are forced onto the pipe.
    pub fn lock(&self) -> MutexGuard<bool> {
        self.flag.lock().unwrap()
    }

    /// Empties the pipe after its read end polled ready. Returns false
    /// on end of file: the write end is gone and no producer can reach
    /// the I/O thread anymore, so it must stop.
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 256];
        loop {
            match sys::read(self.read_fd, &mut buf) {
                Ok(0) => {
                    error!("Wake pipe write end closed");
                    return false;
                }
                Ok(n) if n < buf.len() => return true,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) => {
                    error!("Failed to drain wake pipe: {}", e);
                    return true;
                }
            }
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        sys::close(self.read_fd);
        sys::close(self.write_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::Waker;
    use sys;

    #[test]
    fn a_closed_wake_pipe_reads_as_stop() {
        let mut waker = Waker::new().unwrap();
        sys::close(waker.write_fd);
        waker.write_fd = -1;
        assert!(!waker.drain());
    }
}
