// Readiness wait over the listener, the client slots, and an optional waker.
//
// Thin wrapper around `poll(2)`. The caller passes descriptors in slot order
// and gets back which ones are readable, in the same order. Without a timeout
// the call blocks until something happens. `EINTR` is retried here so callers
// never see it.
//
// The listener is optional: while accepting is paused it is left out of the
// set (as a negative descriptor, which `poll` ignores) and the caller passes a
// timeout so the wait returns when the pause is over.
//
// A client descriptor that has been closed underneath the loop comes back as
// `POLLNVAL`, listed in `Readiness::invalid`. Hang-up and error conditions are
// reported as readable: the relay will then read, see EOF or the error, and
// free the slot through its normal path.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::trace;

/// Result of one readiness wait.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    /// A connection is waiting on the listener.
    pub listener: bool,
    /// The waker was signalled.
    pub waker: bool,
    /// Client descriptors with data, EOF, or an error pending, in input order.
    pub readable: Vec<RawFd>,
    /// Client descriptors the kernel no longer recognises, in input order.
    pub invalid: Vec<RawFd>,
}

const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR;

fn pollfd(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        // Round up so a sub-millisecond remainder doesn't become a busy poll.
        Some(t) => libc::c_int::try_from(t.as_micros().div_ceil(1000)).unwrap_or(libc::c_int::MAX),
    }
}

/// Block until the listener, the waker, or any client is ready, or until
/// `timeout` elapses (an all-empty `Readiness`).
pub fn wait(
    listener: Option<RawFd>,
    waker: Option<RawFd>,
    clients: &[RawFd],
    timeout: Option<Duration>,
) -> io::Result<Readiness> {
    let mut fds = Vec::with_capacity(clients.len() + 2);
    fds.push(pollfd(listener.unwrap_or(-1)));
    if let Some(waker) = waker {
        fds.push(pollfd(waker));
    }
    let first_client = fds.len();
    fds.extend(clients.iter().copied().map(pollfd));

    loop {
        // SAFETY: `fds` is a live, correctly sized array of `pollfd` for the
        // duration of the call.
        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
        trace!("readiness wait interrupted, retrying");
    }

    let listener_events = fds[0].revents;
    if listener_events & libc::POLLNVAL != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("listening descriptor {} is not open", fds[0].fd),
        ));
    }

    let mut readiness = Readiness {
        listener: listener_events & READ_EVENTS != 0,
        ..Readiness::default()
    };
    if waker.is_some() {
        readiness.waker = fds[1].revents & READ_EVENTS != 0;
    }
    for entry in &fds[first_client..] {
        if entry.revents & libc::POLLNVAL != 0 {
            readiness.invalid.push(entry.fd);
        } else if entry.revents & READ_EVENTS != 0 {
            readiness.readable.push(entry.fd);
        }
    }
    Ok(readiness)
}
