//! Client-side components (§2, §4.5): the boot/list/info session modes,
//! the outbound work queue, the escape-key parser, raw-mode terminal
//! handling, and the process transport that stands in for the remote
//! shell.

pub mod escape;
pub mod session;
pub mod terminal;
pub mod transport;

use crate::error::TransportError;
use crate::frame::{Frame, FrameDecoder, MessageKind};
use crate::ioutil;
use crate::reactor::{EventLoop, LoopSignal};
use crate::workqueue::{OutboundQueue, SendOutcome, WorkItem};
use escape::{Action as EscapeAction, EscapeParser};
use session::{Action as SessionAction, BootSession, Policy, IMAGE_CHUNK_SIZE};
use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::process::{ChildStdin, ChildStdout};
use std::rc::Rc;
use std::time::Duration;
use terminal::RawModeGuard;
use transport::ProcessHandle;

/// A placeholder written into a `Cell<mio::Token>` before the real token
/// (known only once the owning fd is registered) is filled in. Never
/// observed: every closure that reads the cell runs after setup.
fn unset_token() -> mio::Token {
    mio::Token(usize::MAX)
}

/// Re-request (or withdraw) write-readiness on `token` based on whatever
/// the queue holds right now. `mio` registers fds edge-triggered, so a
/// writable edge delivered once won't repeat while the pipe stays
/// writable — every push and every drain has to re-synchronize interest
/// itself rather than setting it once at startup (§4.4).
fn sync_write_interest(
    handle: &crate::reactor::Handle,
    token: Rc<Cell<mio::Token>>,
    queue: Rc<RefCell<OutboundQueue>>,
) {
    handle.defer(move |ev| {
        let want = !queue.borrow().is_empty();
        ev.set_writable_interest(token.get(), want).ok();
    });
}

/// The settling delay between a power cycle's `POWER_OFF` and its
/// follow-up `POWER_ON` (§9 — modeled as a timer, never a blocking sleep).
const POWER_CYCLE_SETTLE: Duration = Duration::from_secs(2);

/// A `WorkItem` that sends one pre-built frame and is then done.
struct OneShotFrame(Frame);

impl WorkItem for OneShotFrame {
    fn attempt_send(&mut self, out: &mut dyn Write) -> io::Result<SendOutcome> {
        write_frame(out, &self.0)
    }
}

fn write_frame(out: &mut dyn Write, frame: &Frame) -> io::Result<SendOutcome> {
    match out.write_all(&frame.encode()) {
        Ok(()) => Ok(SendOutcome::Done),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SendOutcome::WouldBlock),
        Err(e) => Err(e),
    }
}

/// A `WorkItem` that streams a boot image in 2048-byte chunks, re-enqueuing
/// itself after each one so items queued behind it (keypresses) still get
/// a turn on the same writable notification (§4.5.1).
struct ImageStream {
    data: Rc<Vec<u8>>,
    offset: usize,
    sentinel_sent: bool,
}

impl ImageStream {
    fn new(data: Rc<Vec<u8>>) -> Self {
        Self {
            data,
            offset: 0,
            sentinel_sent: false,
        }
    }
}

impl WorkItem for ImageStream {
    fn attempt_send(&mut self, out: &mut dyn Write) -> io::Result<SendOutcome> {
        if self.offset >= self.data.len() {
            if self.sentinel_sent {
                return Ok(SendOutcome::Done);
            }
            return match write_frame(out, &Frame::empty(MessageKind::FastbootDownload))? {
                SendOutcome::WouldBlock => Ok(SendOutcome::WouldBlock),
                _ => {
                    self.sentinel_sent = true;
                    Ok(SendOutcome::Done)
                }
            };
        }

        let end = (self.offset + IMAGE_CHUNK_SIZE).min(self.data.len());
        let chunk = self.data[self.offset..end].to_vec();
        match write_frame(out, &Frame::new(MessageKind::FastbootDownload, chunk))? {
            SendOutcome::WouldBlock => Ok(SendOutcome::WouldBlock),
            _ => {
                self.offset = end;
                Ok(SendOutcome::More)
            }
        }
    }
}

/// Build the process transport for this invocation: `ssh host` unless
/// `-S PATH` was given, in which case `path` is spawned directly.
pub fn connect(
    host: &str,
    server_override: Option<&str>,
) -> Result<(ProcessHandle, ChildStdin, ChildStdout), TransportError> {
    match server_override {
        Some(path) => transport::spawn_override(path),
        None => transport::spawn_ssh(host, "dutctl-serverd"),
    }
}

/// Run the `List` mode to completion: print one board name per line,
/// terminate on the empty end-of-list reply.
pub fn run_list(
    process: ProcessHandle,
    stdin: ChildStdin,
    stdout: ChildStdout,
) -> io::Result<i32> {
    run_query(process, stdin, stdout, Frame::empty(MessageKind::ListDevices), true)
}

/// Run the `Info` mode: request details for one board, print the single
/// reply, terminate.
pub fn run_info(
    process: ProcessHandle,
    stdin: ChildStdin,
    stdout: ChildStdout,
    board: &str,
) -> io::Result<i32> {
    run_query(
        process,
        stdin,
        stdout,
        Frame::new(MessageKind::BoardInfo, board.as_bytes().to_vec()),
        false,
    )
}

fn run_query(
    mut process: ProcessHandle,
    mut stdin: ChildStdin,
    mut stdout: ChildStdout,
    request: Frame,
    is_list: bool,
) -> io::Result<i32> {
    ioutil::set_nonblocking(stdin.as_raw_fd())?;
    ioutil::set_nonblocking(stdout.as_raw_fd())?;

    let mut ev = EventLoop::new()?;
    let handle = ev.handle();
    let decoder = Rc::new(RefCell::new(FrameDecoder::new(crate::ring::MIN_CAPACITY)));
    let queue = Rc::new(RefCell::new(OutboundQueue::new()));
    queue.borrow_mut().push(OneShotFrame(request.clone()));
    let exit_code = Rc::new(RefCell::new(1));
    let expect_kind = request.kind;
    let write_token_cell = Rc::new(Cell::new(unset_token()));

    let decoder_r = decoder.clone();
    let exit_r = exit_code.clone();
    ev.register_read(stdout.as_raw_fd(), move |readable, _writable| {
        if !readable {
            return LoopSignal::Continue;
        }
        if fill_from(&mut stdout, &mut decoder_r.borrow_mut()).is_err() {
            return LoopSignal::Terminate;
        }
        match decoder_r.borrow_mut().decode_all() {
            Ok(frames) => {
                for frame in frames {
                    if frame.kind != expect_kind {
                        continue;
                    }
                    if frame.payload.is_empty() {
                        *exit_r.borrow_mut() = 0;
                        return LoopSignal::Terminate;
                    }
                    let mut line = frame.payload.clone();
                    line.push(b'\n');
                    let _ = io::stdout().write_all(&line);
                    if !is_list {
                        *exit_r.borrow_mut() = 0;
                        return LoopSignal::Terminate;
                    }
                }
                LoopSignal::Continue
            }
            Err(_) => LoopSignal::Terminate,
        }
    });

    let queue_w = queue.clone();
    let handle_w = handle.clone();
    let token_w = write_token_cell.clone();
    let write_token = ev.register_read(stdin.as_raw_fd(), move |_readable, writable| {
        if !writable {
            return LoopSignal::Continue;
        }
        let result = queue_w.borrow_mut().drain(&mut stdin);
        sync_write_interest(&handle_w, token_w.clone(), queue_w.clone());
        match result {
            Ok(_) => LoopSignal::Continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => LoopSignal::Continue,
            Err(_) => LoopSignal::Terminate,
        }
    });
    write_token_cell.set(write_token);
    ev.set_writable_interest(write_token, true).ok();

    ev.run()?;
    let _ = process.wait();
    let code = *exit_code.borrow();
    Ok(code)
}

fn fill_from(stdout: &mut ChildStdout, decoder: &mut FrameDecoder) -> io::Result<()> {
    loop {
        match decoder.ring_mut().fill(stdout) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Run a full `Boot` session. Returns the process exit code (§6).
pub fn run_boot(
    mut process: ProcessHandle,
    mut stdin: ChildStdin,
    mut stdout: ChildStdout,
    policy: Policy,
) -> anyhow::Result<i32> {
    use anyhow::Context;

    let image = std::fs::read(&policy.image_path)
        .with_context(|| format!("reading boot image {}", policy.image_path.display()))?;
    let image = Rc::new(image);
    let board = policy.board.clone();

    ioutil::set_nonblocking(stdin.as_raw_fd())?;
    ioutil::set_nonblocking(stdout.as_raw_fd())?;

    let stdin_is_tty = unsafe { libc::isatty(0) } == 1;
    let _raw_guard = if stdin_is_tty {
        Some(RawModeGuard::enable(0)?)
    } else {
        None
    };

    let session = Rc::new(RefCell::new(BootSession::new(policy)));
    let decoder = Rc::new(RefCell::new(FrameDecoder::new(crate::ring::MIN_CAPACITY)));
    let queue = Rc::new(RefCell::new(OutboundQueue::new()));

    queue.borrow_mut().push(OneShotFrame(Frame::new(
        MessageKind::SelectBoard,
        board.into_bytes(),
    )));

    let mut ev = EventLoop::new()?;
    let handle = ev.handle();
    let write_token_cell = Rc::new(Cell::new(unset_token()));

    let decoder_r = decoder.clone();
    let session_r = session.clone();
    let queue_r = queue.clone();
    let image_r = image.clone();
    let handle_r = handle.clone();
    let token_r = write_token_cell.clone();
    ev.register_read(stdout.as_raw_fd(), move |readable, _writable| {
        if !readable {
            return LoopSignal::Continue;
        }
        if fill_from(&mut stdout, &mut decoder_r.borrow_mut()).is_err() {
            session_r.borrow_mut().request_terminate_other();
            return LoopSignal::Terminate;
        }
        let frames = match decoder_r.borrow_mut().decode_all() {
            Ok(f) => f,
            Err(_) => {
                session_r.borrow_mut().request_terminate_other();
                return LoopSignal::Terminate;
            }
        };

        let mut console_out = io::stdout();
        for frame in &frames {
            let action = session_r.borrow_mut().handle_frame(frame, &mut console_out);
            match action {
                SessionAction::StartStreaming => {
                    session_r.borrow_mut().mark_image_streamed();
                    queue_r.borrow_mut().push(ImageStream::new(image_r.clone()));
                }
                SessionAction::ArmPowerOnTimer => {
                    let queue_t = queue_r.clone();
                    let handle_t = handle_r.clone();
                    let token_t = token_r.clone();
                    handle_r.defer(move |ev| {
                        ev.add_timer_after(POWER_CYCLE_SETTLE, move || {
                            queue_t
                                .borrow_mut()
                                .push(OneShotFrame(Frame::empty(MessageKind::PowerOn)));
                            sync_write_interest(&handle_t, token_t.clone(), queue_t.clone());
                            LoopSignal::Continue
                        });
                    });
                }
                SessionAction::None => {}
            }
        }
        if let Some(frame) = session_r.borrow_mut().check_retry_gate() {
            queue_r.borrow_mut().push(OneShotFrame(frame));
        }
        sync_write_interest(&handle_r, token_r.clone(), queue_r.clone());
        if session_r.borrow().is_terminated() {
            return LoopSignal::Terminate;
        }
        LoopSignal::Continue
    });

    let queue_w = queue.clone();
    let handle_w = handle.clone();
    let token_w = write_token_cell.clone();
    let write_token = ev.register_read(stdin.as_raw_fd(), move |_readable, writable| {
        if !writable {
            return LoopSignal::Continue;
        }
        let result = queue_w.borrow_mut().drain(&mut stdin);
        sync_write_interest(&handle_w, token_w.clone(), queue_w.clone());
        match result {
            Ok(_) => LoopSignal::Continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => LoopSignal::Continue,
            Err(_) => LoopSignal::Terminate,
        }
    });
    write_token_cell.set(write_token);
    ev.set_writable_interest(write_token, true).ok();

    if stdin_is_tty {
        register_operator_input(
            &mut ev,
            handle.clone(),
            write_token_cell.clone(),
            session.clone(),
            queue.clone(),
        );
    }

    arm_timeout_watchdog(
        &mut ev,
        handle.clone(),
        write_token_cell.clone(),
        session.clone(),
        queue.clone(),
    );

    ev.run()?;

    let _ = process.wait();
    let termination = session
        .borrow()
        .termination()
        .unwrap_or(session::Termination::Other);
    let streamed = session.borrow().image_streamed();
    Ok(termination.exit_code(streamed))
}

fn register_operator_input(
    ev: &mut EventLoop,
    handle: crate::reactor::Handle,
    write_token: Rc<Cell<mio::Token>>,
    session: Rc<RefCell<BootSession>>,
    queue: Rc<RefCell<OutboundQueue>>,
) {
    ioutil::set_nonblocking(0).ok();
    let escape = Rc::new(RefCell::new(EscapeParser::new()));
    ev.register_read(0, move |readable, _writable| {
        if !readable {
            return LoopSignal::Continue;
        }
        let mut buf = [0u8; 256];
        let n = match io::stdin().read(&mut buf) {
            Ok(0) => return LoopSignal::Terminate,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return LoopSignal::Continue,
            Err(_) => return LoopSignal::Terminate,
        };
        for &byte in &buf[..n] {
            let action = escape.borrow_mut().feed(byte);
            let frame = match action {
                EscapeAction::Forward(b) => Some(Frame::new(MessageKind::Console, vec![b])),
                EscapeAction::Quit => {
                    session.borrow_mut().request_quit();
                    return LoopSignal::Terminate;
                }
                EscapeAction::PowerOn => Some(Frame::empty(MessageKind::PowerOn)),
                EscapeAction::PowerOff => Some(Frame::empty(MessageKind::PowerOff)),
                EscapeAction::HardReset => Some(Frame::empty(MessageKind::HardReset)),
                EscapeAction::StatusRequest => Some(Frame::empty(MessageKind::StatusUpdate)),
                EscapeAction::VbusOn => Some(Frame::empty(MessageKind::VbusOn)),
                EscapeAction::VbusOff => Some(Frame::empty(MessageKind::VbusOff)),
                EscapeAction::SendBreak => Some(Frame::empty(MessageKind::SendBreak)),
                EscapeAction::None => None,
            };
            if let Some(frame) = frame {
                queue.borrow_mut().push(OneShotFrame(frame));
            }
        }
        sync_write_interest(&handle, write_token.clone(), queue.clone());
        LoopSignal::Continue
    });
}

/// Re-arms itself against `BootSession::next_deadline()` every time it
/// fires, so it tracks the inactivity deadline sliding forward on
/// activity without the reactor needing to know about session internals.
fn arm_timeout_watchdog(
    ev: &mut EventLoop,
    handle: crate::reactor::Handle,
    write_token: Rc<Cell<mio::Token>>,
    session: Rc<RefCell<BootSession>>,
    queue: Rc<RefCell<OutboundQueue>>,
) {
    let deadline = session.borrow().next_deadline();
    ev.add_timer(deadline, move || {
        fire_timeout_watchdog(handle, write_token, session, queue)
    });
}

fn fire_timeout_watchdog(
    handle: crate::reactor::Handle,
    write_token: Rc<Cell<mio::Token>>,
    session: Rc<RefCell<BootSession>>,
    queue: Rc<RefCell<OutboundQueue>>,
) -> LoopSignal {
    let now = std::time::Instant::now();
    let deadline = session.borrow().next_deadline();
    if deadline > now {
        // Activity pushed the deadline forward since this timer was
        // armed; reschedule against the new one instead of firing early.
        let handle2 = handle.clone();
        let token2 = write_token.clone();
        let session2 = session.clone();
        let queue2 = queue.clone();
        handle.defer(move |ev| {
            ev.add_timer(deadline, move || {
                fire_timeout_watchdog(handle2, token2, session2, queue2)
            });
        });
        return LoopSignal::Continue;
    }

    {
        let mut s = session.borrow_mut();
        s.on_timeout_fired();
        if let Some(frame) = s.check_retry_gate() {
            queue.borrow_mut().push(OneShotFrame(frame));
        }
        if s.is_terminated() {
            return LoopSignal::Terminate;
        }
    }
    sync_write_interest(&handle, write_token.clone(), queue.clone());

    let next = session.borrow().next_deadline();
    let handle2 = handle.clone();
    let token2 = write_token.clone();
    let session2 = session.clone();
    let queue2 = queue.clone();
    handle.defer(move |ev| {
        ev.add_timer(next, move || {
            fire_timeout_watchdog(handle2, token2, session2, queue2)
        });
    });
    LoopSignal::Continue
}
