//! Client-side session controller (§4.5): the boot state machine, the
//! in-band power-off detector, and the timeout/retry policy.
//!
//! Session state is a single explicit struct threaded through message
//! handlers — there are no process-wide flags. Handlers take the state
//! and the event as arguments and return the next state, rather than
//! mutating fields on a shared singleton.

use crate::frame::{Frame, MessageKind};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Which timeout most recently fired. Total timeouts are always subject
/// to the `-C` (uppercase) "never cycle on timeout" policy; inactivity
/// timeouts are not (§4.5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Inactivity,
    Total,
}

/// Why the session ended, used to compute the client's exit code (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    OperatorQuit,
    PowerOff,
    Timeout,
    /// EOF, a protocol error, or any other transport-level failure.
    Other,
}

impl Termination {
    pub fn exit_code(self, image_streamed: bool) -> i32 {
        match self {
            Termination::OperatorQuit | Termination::PowerOff => 0,
            Termination::Timeout => {
                if image_streamed {
                    110
                } else {
                    2
                }
            }
            Termination::Other => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootPhase {
    Selecting,
    Running,
}

/// What the caller must do in response to a frame just handled by
/// [`BootSession::handle_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Begin streaming the boot image (§4.5.1); the caller owns the image
    /// bytes and the outbound work queue.
    StartStreaming,
    /// Arm the one-shot 2s timer that enqueues `POWER_ON` on fire (§9).
    ArmPowerOnTimer,
}

/// Policy configured from the command line (§6).
pub struct Policy {
    pub board: String,
    pub image_path: PathBuf,
    pub total_timeout: Duration,
    pub inactivity_timeout: Option<Duration>,
    pub cycle_budget: u32,
    pub cycle_on_timeout: bool,
    pub repeat_image: bool,
}

/// The boot session's complete state (§3 "Session state").
pub struct BootSession {
    policy: Policy,
    phase: BootPhase,
    cycles_remaining: u32,
    received_power_off: bool,
    last_timeout: Option<TimeoutKind>,
    fastboot_done: bool,
    auto_power_on: bool,
    image_streamed: bool,
    tilde_run: u8,
    total_deadline: Instant,
    inactivity_deadline: Option<Instant>,
    terminated: Option<Termination>,
}

/// Number of consecutive `~` bytes that signal graceful power-off.
pub const POWER_OFF_MARKER_LEN: u8 = 20;

/// Bytes per `FASTBOOT_DOWNLOAD` chunk during image streaming (§4.5.1).
pub const IMAGE_CHUNK_SIZE: usize = 2048;

impl BootSession {
    pub fn new(policy: Policy) -> Self {
        let now = Instant::now();
        let inactivity_deadline = policy.inactivity_timeout.map(|d| now + d);
        Self {
            cycles_remaining: policy.cycle_budget,
            total_deadline: now + policy.total_timeout,
            inactivity_deadline,
            phase: BootPhase::Selecting,
            received_power_off: false,
            last_timeout: None,
            fastboot_done: false,
            auto_power_on: false,
            image_streamed: false,
            tilde_run: 0,
            terminated: None,
            policy,
        }
    }

    pub fn board(&self) -> &str {
        &self.policy.board
    }

    pub fn image_path(&self) -> &std::path::Path {
        &self.policy.image_path
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_some()
    }

    pub fn termination(&self) -> Option<Termination> {
        self.terminated
    }

    pub fn image_streamed(&self) -> bool {
        self.image_streamed
    }

    /// Earliest of the two absolute deadlines, or `None` if inactivity
    /// timeout is disabled and the total timeout can't fire yet — it
    /// always can, so this is really just `min(total, inactivity)`.
    pub fn next_deadline(&self) -> Instant {
        match self.inactivity_deadline {
            Some(d) => d.min(self.total_deadline),
            None => self.total_deadline,
        }
    }

    /// Called by the event loop's timer callback when `next_deadline()`
    /// is reached. Figures out which timeout actually elapsed (both may
    /// have, if the loop was delayed) and marks it.
    pub fn on_timeout_fired(&mut self) {
        let now = Instant::now();
        // Total timeout takes priority when both are due: it never
        // extends, so if it's due the session is over regardless.
        if self.total_deadline <= now {
            self.last_timeout = Some(TimeoutKind::Total);
        } else if matches!(self.inactivity_deadline, Some(d) if d <= now) {
            self.last_timeout = Some(TimeoutKind::Inactivity);
        }
    }

    /// Every inbound message extends the inactivity deadline (§8
    /// "Timeout idempotence"); the total deadline never moves.
    fn note_activity(&mut self) {
        if let Some(interval) = self.policy.inactivity_timeout {
            self.inactivity_deadline = Some(Instant::now() + interval);
        }
    }

    /// Operator requested quit (Ctrl-A q).
    pub fn request_quit(&mut self) {
        self.terminated = Some(Termination::OperatorQuit);
    }

    pub fn request_terminate_other(&mut self) {
        self.terminated = Some(Termination::Other);
    }

    /// Feed console bytes through the power-off marker detector (§4.5.2).
    pub fn note_console_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'~' {
                self.tilde_run += 1;
                if self.tilde_run == POWER_OFF_MARKER_LEN {
                    self.received_power_off = true;
                    self.tilde_run = 0;
                }
            } else {
                self.tilde_run = 0;
            }
        }
    }

    /// Handle one inbound frame and report what the caller must do next.
    /// The session itself never touches the work queue or the reactor —
    /// those live with the caller, which owns the image bytes and the
    /// transport.
    pub fn handle_frame(&mut self, frame: &Frame, console_out: &mut dyn Write) -> Action {
        self.note_activity();

        match frame.kind {
            MessageKind::SelectBoard | MessageKind::PowerOn => {
                self.phase = BootPhase::Running;
                Action::None
            }
            MessageKind::FastbootPresent => match frame.payload.first() {
                Some(1) => {
                    if !self.image_streamed || self.policy.repeat_image {
                        Action::StartStreaming
                    } else {
                        // The board came back up already flashed with no
                        // repeat requested: this boot attempt succeeded.
                        self.terminated = Some(Termination::OperatorQuit);
                        Action::None
                    }
                }
                Some(0) => {
                    self.fastboot_done = true;
                    Action::None
                }
                _ => Action::None,
            },
            MessageKind::Console => {
                let _ = console_out.write_all(&frame.payload);
                let _ = console_out.flush();
                self.note_console_bytes(&frame.payload);
                Action::None
            }
            MessageKind::StatusUpdate => {
                let mut line = frame.payload.clone();
                line.push(b'\n');
                let _ = console_out.write_all(&line);
                Action::None
            }
            MessageKind::PowerOff => {
                if self.auto_power_on {
                    Action::ArmPowerOnTimer
                } else {
                    Action::None
                }
            }
            _ => Action::None,
        }
    }

    pub fn mark_image_streamed(&mut self) {
        self.image_streamed = true;
    }

    pub fn mark_auto_power_on(&mut self, value: bool) {
        self.auto_power_on = value;
    }

    /// Top-of-loop retry gate (§4.5.3). Returns `Some(frame)` if a
    /// `POWER_OFF` should be enqueued to start a power cycle; sets
    /// `self.terminated` if the session should end instead.
    pub fn check_retry_gate(&mut self) -> Option<Frame> {
        if !self.received_power_off && self.last_timeout.is_none() {
            return None;
        }

        if self.received_power_off {
            if self.cycles_remaining == 0 {
                self.terminated = Some(Termination::PowerOff);
                return None;
            }
        } else if let Some(kind) = self.last_timeout {
            let vetoed = kind == TimeoutKind::Total && !self.policy.cycle_on_timeout;
            if self.cycles_remaining == 0 || vetoed {
                self.terminated = Some(Termination::Timeout);
                return None;
            }
        }

        self.cycles_remaining -= 1;
        log::info!("power cycle ({} left)", self.cycles_remaining);
        self.mark_auto_power_on(true);
        self.received_power_off = false;
        self.last_timeout = None;
        self.note_activity();
        Some(Frame::empty(MessageKind::PowerOff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn policy() -> Policy {
        Policy {
            board: "rb1".into(),
            image_path: "boot.img".into(),
            total_timeout: Duration::from_secs(600),
            inactivity_timeout: None,
            cycle_budget: 0,
            cycle_on_timeout: true,
            repeat_image: false,
        }
    }

    #[test]
    fn twenty_tildes_trigger_power_off() {
        let mut s = BootSession::new(policy());
        let mut sink = Vec::new();
        s.handle_frame(
            &Frame::new(MessageKind::Console, b"~".repeat(19)),
            &mut sink,
        );
        assert!(!s.received_power_off);
        s.handle_frame(&Frame::new(MessageKind::Console, b"~".to_vec()), &mut sink);
        assert!(s.received_power_off);
    }

    #[test]
    fn non_tilde_byte_resets_the_run() {
        let mut s = BootSession::new(policy());
        let mut bytes = b"~".repeat(19);
        bytes.push(b'x');
        bytes.extend(b"~".repeat(19));
        let mut sink = Vec::new();
        s.handle_frame(&Frame::new(MessageKind::Console, bytes), &mut sink);
        assert!(!s.received_power_off);
    }

    #[quickcheck]
    fn marker_fires_iff_run_reaches_twenty(run_len: u8, chunked: bool) -> bool {
        let n = (run_len % 40) as usize;
        let mut s = BootSession::new(policy());
        let bytes = b"~".repeat(n);
        if chunked {
            for b in &bytes {
                s.note_console_bytes(std::slice::from_ref(b));
            }
        } else {
            s.note_console_bytes(&bytes);
        }
        s.received_power_off == (n >= POWER_OFF_MARKER_LEN as usize)
    }

    #[test]
    fn retry_budget_exhausts_after_n_cycles() {
        let mut p = policy();
        p.cycle_budget = 2;
        let mut s = BootSession::new(p);

        s.received_power_off = true;
        assert!(s.check_retry_gate().is_some());
        assert!(!s.is_terminated());

        s.received_power_off = true;
        assert!(s.check_retry_gate().is_some());
        assert!(!s.is_terminated());

        s.received_power_off = true;
        assert!(s.check_retry_gate().is_none());
        assert!(s.is_terminated());
        assert_eq!(s.termination(), Some(Termination::PowerOff));
    }

    #[test]
    fn total_timeout_veto_terminates_immediately() {
        let mut p = policy();
        p.cycle_budget = 5;
        p.cycle_on_timeout = false;
        let mut s = BootSession::new(p);

        s.last_timeout = Some(TimeoutKind::Total);
        assert!(s.check_retry_gate().is_none());
        assert_eq!(s.termination(), Some(Termination::Timeout));
    }

    #[test]
    fn inactivity_timeout_is_not_vetoed_by_uppercase_policy() {
        let mut p = policy();
        p.cycle_budget = 1;
        p.cycle_on_timeout = false;
        let mut s = BootSession::new(p);

        s.last_timeout = Some(TimeoutKind::Inactivity);
        assert!(s.check_retry_gate().is_some());
        assert!(!s.is_terminated());
    }

    #[test]
    fn exit_codes_match_termination_cause() {
        assert_eq!(Termination::OperatorQuit.exit_code(false), 0);
        assert_eq!(Termination::PowerOff.exit_code(true), 0);
        assert_eq!(Termination::Timeout.exit_code(false), 2);
        assert_eq!(Termination::Timeout.exit_code(true), 110);
        assert_eq!(Termination::Other.exit_code(true), 1);
    }
}
