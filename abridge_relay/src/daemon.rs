// Detach from the controlling terminal.
//
// Classic single fork: the parent exits 0 straight away, the child becomes a
// session leader via `setsid` and carries on as the relay. Must run before any
// thread is spawned and before the listener is bound, so the socket belongs
// to the surviving process only.

use std::io;

/// Fork into the background. Returns only in the child.
pub fn daemonize() -> io::Result<()> {
    // SAFETY: called from `main` while the process is still single-threaded.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            // SAFETY: plain syscall, no memory is shared with the parent.
            if unsafe { libc::setsid() } == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
        _ => std::process::exit(0),
    }
}
