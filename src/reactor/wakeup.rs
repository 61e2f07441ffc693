// src/reactor/wakeup.rs - Self-pipe wakeup channel
//
// A descriptor that becomes readable on notify() and can be cheaply drained.
// Linux gets a single eventfd serving as both ends; other unixes fall back
// to a non-blocking pipe pair. Wakeup coalescing (the `signaled` flag) is
// the loop's job, not this module's.

use std::io;
use std::os::unix::io::RawFd;

pub(crate) struct WakeChannel {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakeChannel {
    #[cfg(target_os = "linux")]
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd takes no pointers; the result is checked before use.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Both ends alias the one counter fd.
        Ok(Self {
            read_fd: fd,
            write_fd: fd,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds points to valid storage for two descriptors.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            // SAFETY: fd was just returned by pipe() and is owned here.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// The descriptor the loop polls for readability.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Make the read end readable. Best-effort and non-blocking: a full
    /// pipe already guarantees a pending wakeup.
    pub fn notify(&self) {
        let one: u64 = 1;
        // SAFETY: write on an owned fd with a valid 8-byte buffer. An
        // 8-byte write satisfies both eventfd and pipe semantics.
        let _ = unsafe {
            libc::write(
                self.write_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }

    /// Drain the read end until empty.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: read on an owned non-blocking fd into a valid buffer.
            let ret = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if ret <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakeChannel {
    fn drop(&mut self) {
        // SAFETY: descriptors are owned by this channel and closed exactly
        // once; on eventfd platforms both fields alias a single fd.
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::poller;

    #[test]
    fn test_notify_makes_readable() {
        let wake = WakeChannel::new().expect("wake channel");

        // Nothing pending: poll times out.
        let report = poller::wait(-1, wake.read_fd(), false, 10).expect("poll");
        assert!(!report.wake.readable);

        wake.notify();
        let report = poller::wait(-1, wake.read_fd(), false, 100).expect("poll");
        assert!(report.wake.readable);
    }

    #[test]
    fn test_drain_clears_pending() {
        let wake = WakeChannel::new().expect("wake channel");
        wake.notify();
        wake.notify();
        wake.drain();

        let report = poller::wait(-1, wake.read_fd(), false, 10).expect("poll");
        assert!(!report.wake.readable);
    }
}
