//! Operator escape-key parser (§4.5.4).
//!
//! The operator's keystrokes pass straight through to the board's console
//! except for a two-byte escape sequence: `Ctrl-A` (0x01) followed by a
//! command byte. `a` after the prefix sends a literal `Ctrl-A` byte as
//! console data; any other unrecognized command byte is dropped silently
//! along with the prefix that introduced it. `r` triggers a hard reset.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Forward(u8),
    Quit,
    PowerOn,
    PowerOff,
    HardReset,
    StatusRequest,
    VbusOn,
    VbusOff,
    SendBreak,
    /// No byte to forward and nothing to do — e.g. mid-sequence, or an
    /// escape sequence that didn't resolve to a known command.
    None,
}

const ESCAPE_PREFIX: u8 = 0x01;

#[derive(Default)]
pub struct EscapeParser {
    pending: bool,
}

impl EscapeParser {
    pub fn new() -> Self {
        Self { pending: false }
    }

    pub fn feed(&mut self, byte: u8) -> Action {
        if self.pending {
            self.pending = false;
            return match byte {
                b'q' => Action::Quit,
                b'P' => Action::PowerOn,
                b'p' => Action::PowerOff,
                b'r' => Action::HardReset,
                b's' => Action::StatusRequest,
                b'V' => Action::VbusOn,
                b'v' => Action::VbusOff,
                b'B' => Action::SendBreak,
                b'a' => Action::Forward(ESCAPE_PREFIX),
                _ => Action::None,
            };
        }

        if byte == ESCAPE_PREFIX {
            self.pending = true;
            Action::None
        } else {
            Action::Forward(byte)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_bytes_pass_through() {
        let mut p = EscapeParser::new();
        assert_eq!(p.feed(b'x'), Action::Forward(b'x'));
    }

    #[test]
    fn quit_sequence() {
        let mut p = EscapeParser::new();
        assert_eq!(p.feed(ESCAPE_PREFIX), Action::None);
        assert_eq!(p.feed(b'q'), Action::Quit);
    }

    #[test]
    fn literal_prefix_byte_via_a() {
        let mut p = EscapeParser::new();
        assert_eq!(p.feed(ESCAPE_PREFIX), Action::None);
        assert_eq!(p.feed(b'a'), Action::Forward(ESCAPE_PREFIX));
    }

    #[test]
    fn unrecognized_command_is_silently_consumed() {
        let mut p = EscapeParser::new();
        assert_eq!(p.feed(ESCAPE_PREFIX), Action::None);
        assert_eq!(p.feed(b'z'), Action::None);
    }

    #[test]
    fn doubled_prefix_is_silently_consumed() {
        let mut p = EscapeParser::new();
        assert_eq!(p.feed(ESCAPE_PREFIX), Action::None);
        assert_eq!(p.feed(ESCAPE_PREFIX), Action::None);
    }

    #[test]
    fn parser_resets_after_each_sequence() {
        let mut p = EscapeParser::new();
        p.feed(ESCAPE_PREFIX);
        p.feed(b'q');
        assert_eq!(p.feed(b'x'), Action::Forward(b'x'));
    }
}
