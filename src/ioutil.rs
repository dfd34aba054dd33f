//! Small raw-fd helpers shared by both binaries.
//!
//! `std::process::ChildStdin`/`ChildStdout` (and plain `Stdin`/`Stdout`)
//! don't expose `set_nonblocking` on stable, so this goes through `libc`
//! directly — the same crate `mio` itself is built on for unix raw-fd
//! registration.

use std::io;
use std::os::unix::io::RawFd;

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
