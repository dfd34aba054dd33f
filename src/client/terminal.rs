//! Raw-mode terminal handling for the operator's console (§4.5, "Operator
//! I/O"). The client needs every keystroke delivered byte-by-byte, with no
//! local echo, so it can forward them to the board and intercept the
//! escape sequence; restoring the original terminal mode on drop keeps a
//! crash or an early return from leaving the operator's shell broken.

use std::io;
use std::os::unix::io::RawFd;
use termios::{Termios, ECHO, ICANON, ISIG, IXON, TCSANOW, VMIN, VTIME};

pub struct RawModeGuard {
    fd: RawFd,
    original: Termios,
}

impl RawModeGuard {
    pub fn enable(fd: RawFd) -> io::Result<Self> {
        let original = Termios::from_fd(fd)?;
        let mut raw = original;
        raw.c_lflag &= !(ECHO | ICANON | ISIG);
        raw.c_iflag &= !IXON;
        raw.c_cc[VMIN] = 1;
        raw.c_cc[VTIME] = 0;
        termios::tcsetattr(fd, TCSANOW, &raw)?;
        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(self.fd, TCSANOW, &self.original);
    }
}
