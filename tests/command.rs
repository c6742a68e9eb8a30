extern crate libc;
extern crate qianli;

use std::sync::Arc;
use std::thread;

use qianli::command::Waker;

fn pending_bytes(waker: &Waker) -> isize {
    let mut buf = [0u8; 8];
    unsafe {
        libc::read(
            waker.read_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    }
}

#[test]
fn wake_with_the_lock_free_sets_the_flag() {
    let waker = Waker::new().unwrap();
    waker.wake();
    let mut awoken = waker.lock();
    assert!(*awoken);
    *awoken = false;
    // No syscall was needed, so the pipe stays empty.
    drop(awoken);
    assert_eq!(pending_bytes(&waker), -1);
}

#[test]
fn wake_against_a_held_lock_goes_through_the_pipe() {
    let waker = Arc::new(Waker::new().unwrap());
    {
        let _awoken = waker.lock();
        let producer = waker.clone();
        thread::spawn(move || producer.wake()).join().unwrap();
    }
    assert_eq!(pending_bytes(&waker), 1);
    assert_eq!(pending_bytes(&waker), -1);
}

#[test]
fn drain_empties_the_pipe() {
    let waker = Arc::new(Waker::new().unwrap());
    {
        let _awoken = waker.lock();
        let producer = waker.clone();
        thread::spawn(move || {
            for _ in 0..3 {
                producer.wake();
            }
        }).join()
            .unwrap();
    }
    assert!(waker.drain());
    assert_eq!(pending_bytes(&waker), -1);
}
