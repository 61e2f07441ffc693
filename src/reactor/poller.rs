// src/reactor/poller.rs - Syscall surface for the event loop
//
// Everything that touches the kernel lives here:
// - poll(2) over the socket fd and the wakeup fd
// - non-blocking sendto/recvfrom with MSG_DONTWAIT
// - host <-> network byte order conversion (nothing above this module sees
//   a network-order address)
//
// EINTR is retried; a fd of -1 in the poll set is ignored per POSIX.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

/// Readiness flags for one polled descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Readiness {
    fn from_revents(revents: libc::c_short) -> Self {
        Self {
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            error: revents & libc::POLLERR != 0,
            hangup: revents & libc::POLLHUP != 0,
        }
    }

    /// HUP or ERR on this descriptor: terminal for the loop.
    pub fn is_fatal(&self) -> bool {
        self.error || self.hangup
    }
}

/// Result of one poll wakeup.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PollReport {
    pub socket: Readiness,
    pub wake: Readiness,
}

/// Wait for events on the socket and wakeup descriptors.
///
/// `want_write` adds POLLOUT to the socket's interest set (the outbound
/// queue is non-empty). `timeout_ms` of -1 blocks indefinitely.
pub(crate) fn wait(
    socket_fd: RawFd,
    wake_fd: RawFd,
    want_write: bool,
    timeout_ms: i32,
) -> io::Result<PollReport> {
    let mut socket_events = libc::POLLIN | libc::POLLERR | libc::POLLHUP;
    if want_write {
        socket_events |= libc::POLLOUT;
    }

    let mut fds = [
        libc::pollfd {
            fd: socket_fd,
            events: socket_events,
            revents: 0,
        },
        libc::pollfd {
            fd: wake_fd,
            events: libc::POLLIN | libc::POLLERR | libc::POLLHUP,
            revents: 0,
        },
    ];

    loop {
        // SAFETY: fds points to a valid array of 2 pollfd entries living on
        // this stack frame; the kernel only writes their revents fields.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue; // EINTR - retry
            }
            return Err(err);
        }

        return Ok(PollReport {
            socket: Readiness::from_revents(fds[0].revents),
            wake: Readiness::from_revents(fds[1].revents),
        });
    }
}

/// Non-blocking datagram send. The destination is converted to network
/// byte order here and nowhere else.
pub(crate) fn send_to(fd: RawFd, buf: &[u8], ip: Ipv4Addr, port: u16) -> io::Result<usize> {
    // SAFETY: sockaddr_in is a plain C struct for which all-zeroes is a
    // valid bit pattern; the fields we need are set right after.
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(ip).to_be();

    // SAFETY: buf is a valid slice for buf.len() bytes; addr is a fully
    // initialized sockaddr_in on this stack frame with the correct length
    // passed alongside it.
    let ret = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };

    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Non-blocking datagram receive. Returns the byte count and the source
/// address in host order.
pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
    // SAFETY: see send_to; recvfrom initializes the struct on success.
    let mut from: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut from_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    // SAFETY: buf is a valid writable slice for buf.len() bytes; from and
    // from_len are valid pointers to matching storage on this stack frame.
    let ret = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
            &mut from as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut from_len,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let ip = Ipv4Addr::from(u32::from_be(from.sin_addr.s_addr));
    let port = u16::from_be(from.sin_port);
    Ok((ret as usize, SocketAddrV4::new(ip, port)))
}
