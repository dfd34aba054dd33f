//! `dutctl-serverd`: the host-side binary. Spawned over `ssh` (or run
//! directly by `-S` for local testing) with its stdin/stdout serving as
//! the framed transport back to the client; everything diagnostic goes to
//! stderr so it never corrupts the wire.

use anyhow::Context;
use dutctl::frame::{Frame, FrameDecoder};
use dutctl::ioutil;
use dutctl::reactor::{EventLoop, LoopSignal};
use dutctl::ring;
use dutctl::server::dispatch::Dispatcher;
use dutctl::server::flashing::NullFlasher;
use dutctl::server::registry::{self, Registry};
use dutctl::workqueue::{OneShot, OutboundQueue};
use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

/// How often the dispatcher polls the selected device for spontaneous
/// events (flashing-mode transitions, unsolicited console bytes). A real
/// driver would instead wake the reactor on its own fd; `VirtualDriver`
/// has no fd of its own to watch, so this timer stands in for it.
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn unset_token() -> mio::Token {
    mio::Token(usize::MAX)
}

/// Re-request (or withdraw) write-readiness on `token` based on whatever
/// the queue holds right now. `mio` fds are edge-triggered, so a writable
/// edge delivered once won't repeat while the pipe stays writable — every
/// enqueue and every drain has to re-synchronize interest itself rather
/// than setting it once at startup (§4.4).
fn sync_write_interest(
    handle: &dutctl::reactor::Handle,
    token: Rc<Cell<mio::Token>>,
    queue: Rc<RefCell<OutboundQueue>>,
) {
    handle.defer(move |ev| {
        let want = !queue.borrow().is_empty();
        ev.set_writable_interest(token.get(), want).ok();
    });
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let registry = Registry::load_default().context("loading board registry")?;
    let user = registry::effective_user();
    log::info!("dutctl-serverd starting for user {user}");

    let stdin = io::stdin();
    let stdout = io::stdout();
    ioutil::set_nonblocking(stdin.as_raw_fd())?;
    ioutil::set_nonblocking(stdout.as_raw_fd())?;

    let dispatcher = Rc::new(RefCell::new(Dispatcher::new(registry, user)));
    let decoder = Rc::new(RefCell::new(FrameDecoder::new(ring::MIN_CAPACITY)));
    let queue = Rc::new(RefCell::new(OutboundQueue::new()));

    let mut ev = EventLoop::new()?;
    let handle = ev.handle();
    let write_token_cell = Rc::new(Cell::new(unset_token()));

    let decoder_r = decoder.clone();
    let dispatcher_r = dispatcher.clone();
    let queue_r = queue.clone();
    let handle_r = handle.clone();
    let token_r = write_token_cell.clone();
    ev.register_read(stdin.as_raw_fd(), move |readable, _writable| {
        if !readable {
            return LoopSignal::Continue;
        }
        let mut stdin = io::stdin();
        loop {
            match decoder_r.borrow_mut().ring_mut().fill(&mut stdin) {
                Ok(0) => return LoopSignal::Terminate,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => return LoopSignal::Terminate,
            }
        }
        let frames = match decoder_r.borrow_mut().decode_all() {
            Ok(f) => f,
            Err(e) => {
                log::warn!("malformed frame from client: {e}");
                return LoopSignal::Terminate;
            }
        };
        let mut flasher = NullFlasher;
        for frame in &frames {
            let replies = dispatcher_r.borrow_mut().handle_frame(frame, &mut flasher);
            enqueue(&queue_r, replies);
        }
        sync_write_interest(&handle_r, token_r.clone(), queue_r.clone());
        if dispatcher_r.borrow().should_terminate() {
            return LoopSignal::Terminate;
        }
        LoopSignal::Continue
    });

    let queue_w = queue.clone();
    let handle_w = handle.clone();
    let token_w = write_token_cell.clone();
    let mut stdout_for_drain = io::stdout();
    let write_token = ev.register_read(stdout.as_raw_fd(), move |_readable, writable| {
        if !writable {
            return LoopSignal::Continue;
        }
        let result = queue_w.borrow_mut().drain(&mut stdout_for_drain);
        sync_write_interest(&handle_w, token_w.clone(), queue_w.clone());
        match result {
            Ok(_) => LoopSignal::Continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => LoopSignal::Continue,
            Err(_) => LoopSignal::Terminate,
        }
    });
    write_token_cell.set(write_token);
    ev.set_writable_interest(write_token, true).ok();

    arm_device_poll(
        &mut ev,
        handle,
        write_token_cell,
        dispatcher.clone(),
        queue.clone(),
    );

    ev.run()?;
    dispatcher.borrow_mut().close();
    Ok(())
}

fn enqueue(queue: &Rc<RefCell<OutboundQueue>>, frames: Vec<Frame>) {
    let mut q = queue.borrow_mut();
    for frame in frames {
        q.push(OneShot::new(frame.encode()));
    }
}

fn arm_device_poll(
    ev: &mut EventLoop,
    handle: dutctl::reactor::Handle,
    write_token: Rc<Cell<mio::Token>>,
    dispatcher: Rc<RefCell<Dispatcher>>,
    queue: Rc<RefCell<OutboundQueue>>,
) {
    ev.add_timer_after(DEVICE_POLL_INTERVAL, move || {
        let replies = dispatcher.borrow_mut().poll_device_events();
        enqueue(&queue, replies);
        sync_write_interest(&handle, write_token.clone(), queue.clone());
        let terminated = dispatcher.borrow().should_terminate();
        if terminated {
            return LoopSignal::Terminate;
        }
        let handle2 = handle.clone();
        let token2 = write_token.clone();
        let dispatcher2 = dispatcher.clone();
        let queue2 = queue.clone();
        handle.defer(move |ev| arm_device_poll(ev, handle2, token2, dispatcher2, queue2));
        LoopSignal::Continue
    });
}
