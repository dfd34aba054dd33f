//! Readiness-based, single-threaded event loop shared by the client and
//! the server (§4.3).
//!
//! Read-watches and timer-watches are callbacks registered up front;
//! `EventLoop::run` blocks for the nearer of "a watched descriptor became
//! ready" or "a timer expired", fires expired timers first (removing them
//! from the schedule before invoking them, so a callback may re-arm
//! itself without racing its own removal), then invokes ready read
//! callbacks. No callback may block, and none may re-enter the loop.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Returned by every callback to tell the loop whether to keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    Continue,
    Terminate,
}

type ReadCallback = Box<dyn FnMut(bool, bool) -> LoopSignal>;
type TimerCallback = Box<dyn FnOnce() -> LoopSignal>;

struct ReadWatch {
    fd: RawFd,
    interest: Interest,
    callback: ReadCallback,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline (and,
        // among ties, the earliest insertion) sorts first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A handle to a registered timer, usable to cancel it before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// The event loop itself.
///
/// Generic over nothing: callbacks are boxed closures that close over
/// whatever shared state (a `Rc<RefCell<...>>` session or dispatcher) they
/// need, threading an explicit context through free functions rather
/// than relying on ambient globals.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    watches: HashMap<Token, ReadWatch>,
    next_token: usize,
    schedule: BinaryHeap<TimerEntry>,
    timers: HashMap<u64, TimerCallback>,
    next_timer_id: u64,
    next_timer_seq: u64,
    quit: bool,
    pending: Rc<RefCell<VecDeque<Box<dyn FnOnce(&mut EventLoop)>>>>,
}

/// A cloneable handle that lets a callback schedule an action against the
/// loop (typically arming a new timer) without holding a direct `&mut
/// EventLoop` — callbacks only ever see their own readiness/deadline
/// arguments, never the loop itself, so they queue the action and the
/// loop applies it at the top of the next iteration.
#[derive(Clone)]
pub struct Handle {
    pending: Rc<RefCell<VecDeque<Box<dyn FnOnce(&mut EventLoop)>>>>,
}

impl Handle {
    pub fn defer(&self, action: impl FnOnce(&mut EventLoop) + 'static) {
        self.pending.borrow_mut().push_back(Box::new(action));
    }
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            watches: HashMap::new(),
            next_token: 0,
            schedule: BinaryHeap::new(),
            timers: HashMap::new(),
            next_timer_id: 0,
            next_timer_seq: 0,
            quit: false,
            pending: Rc::new(RefCell::new(VecDeque::new())),
        })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            pending: self.pending.clone(),
        }
    }

    fn apply_pending(&mut self) {
        loop {
            let action = self.pending.borrow_mut().pop_front();
            match action {
                Some(action) => action(self),
                None => break,
            }
        }
    }

    /// Register a read-watch on `fd`. The callback is invoked with
    /// `(readable, writable)` whenever either readiness flag fires.
    pub fn register_read<F>(&mut self, fd: RawFd, callback: F) -> Token
    where
        F: FnMut(bool, bool) -> LoopSignal + 'static,
    {
        let token = Token(self.next_token);
        self.next_token += 1;
        let interest = Interest::READABLE;
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
            .expect("registering a freshly-opened fd should not fail");
        self.watches.insert(
            token,
            ReadWatch {
                fd,
                interest,
                callback: Box::new(callback),
            },
        );
        token
    }

    /// Request (or withdraw) write-readiness notifications for an
    /// already-registered watch. The outbound work queue (§4.4) calls
    /// this whenever it transitions between empty and non-empty.
    pub fn set_writable_interest(&mut self, token: Token, writable: bool) -> io::Result<()> {
        let watch = self
            .watches
            .get_mut(&token)
            .expect("set_writable_interest on an unknown token");
        let interest = if writable {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        if interest != watch.interest {
            watch.interest = interest;
            self.poll
                .registry()
                .reregister(&mut SourceFd(&watch.fd), token, interest)?;
        }
        Ok(())
    }

    pub fn unregister_read(&mut self, token: Token) -> io::Result<()> {
        if let Some(watch) = self.watches.remove(&token) {
            self.poll.registry().deregister(&mut SourceFd(&watch.fd))?;
        }
        Ok(())
    }

    /// Arm a one-shot timer. Firing removes it from the schedule before
    /// the callback runs, so the callback may call `add_timer` again
    /// (e.g. to re-arm itself) without interference.
    pub fn add_timer<F>(&mut self, deadline: Instant, callback: F) -> TimerId
    where
        F: FnOnce() -> LoopSignal + 'static,
    {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let seq = self.next_timer_seq;
        self.next_timer_seq += 1;
        self.schedule.push(TimerEntry { deadline, seq, id });
        self.timers.insert(id, Box::new(callback));
        TimerId(id)
    }

    pub fn add_timer_after<F>(&mut self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() -> LoopSignal + 'static,
    {
        self.add_timer(Instant::now() + delay, callback)
    }

    /// Cancel a timer. A no-op if it already fired or was already
    /// cancelled — idempotent by construction, since firing removes the
    /// callback from `self.timers` first.
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.remove(&id.0);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.schedule.peek().map(|e| e.deadline)
    }

    /// Pop and fire every timer whose deadline has passed, in deadline
    /// order (ties broken by insertion order). Returns `Terminate` if any
    /// fired callback asked to stop.
    fn fire_expired(&mut self) -> LoopSignal {
        let now = Instant::now();
        let mut signal = LoopSignal::Continue;
        while let Some(entry) = self.schedule.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.schedule.pop().unwrap();
            // The callback may have been cancelled since it was scheduled.
            if let Some(callback) = self.timers.remove(&entry.id) {
                if callback() == LoopSignal::Terminate {
                    signal = LoopSignal::Terminate;
                }
            }
        }
        signal
    }

    /// Run until a callback asks to terminate, or a fatal I/O error
    /// escapes `Poll::poll`. Signal-interrupted waits are retried.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.quit {
            self.apply_pending();

            let timeout = self
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()));

            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if self.fire_expired() == LoopSignal::Terminate {
                self.quit = true;
                break;
            }

            // Snapshot readiness for this iteration before invoking any
            // callback, so a callback that registers a new watch doesn't
            // see it fire within the same iteration.
            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();

            for (token, readable, writable) in ready {
                let Some(watch) = self.watches.get_mut(&token) else {
                    continue; // unregistered mid-iteration
                };
                if (watch.callback)(readable, writable) == LoopSignal::Terminate {
                    self.quit = true;
                }
            }
        }
        Ok(())
    }

    pub fn request_terminate(&mut self) {
        self.quit = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::os::unix::io::AsRawFd;
    use std::rc::Rc;

    #[test]
    fn timers_fire_in_deadline_then_insertion_order() {
        let mut ev = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let now = Instant::now();
        let o1 = order.clone();
        ev.add_timer(now + Duration::from_millis(5), move || {
            o1.borrow_mut().push(1);
            LoopSignal::Continue
        });
        let o2 = order.clone();
        ev.add_timer(now + Duration::from_millis(5), move || {
            o2.borrow_mut().push(2);
            LoopSignal::Continue
        });
        let o3 = order.clone();
        ev.add_timer(now + Duration::from_millis(1), move || {
            o3.borrow_mut().push(3);
            LoopSignal::Terminate
        });

        std::thread::sleep(Duration::from_millis(10));
        ev.run().unwrap();

        assert_eq!(*order.borrow(), vec![3, 1, 2]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut ev = EventLoop::new().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let id = ev.add_timer_after(Duration::from_millis(1), move || {
            *f.borrow_mut() = true;
            LoopSignal::Terminate
        });
        ev.cancel_timer(id);
        // arm a second timer so the loop has something to terminate on
        ev.add_timer_after(Duration::from_millis(5), || LoopSignal::Terminate);
        ev.run().unwrap();
        assert!(!*fired.borrow());
    }

    #[test]
    fn handle_defers_timer_registration_to_next_iteration() {
        let mut ev = EventLoop::new().unwrap();
        let handle = ev.handle();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        handle.defer(move |ev| {
            ev.add_timer_after(Duration::from_millis(1), move || {
                *f.borrow_mut() = true;
                LoopSignal::Terminate
            });
        });
        std::thread::sleep(Duration::from_millis(5));
        ev.run().unwrap();
        assert!(*fired.borrow());
    }

    #[test]
    fn read_watch_fires_on_readability() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let mut ev = EventLoop::new().unwrap();
        let seen = Rc::new(RefCell::new(false));
        let seen2 = seen.clone();
        ev.register_read(fd, move |readable, _writable| {
            if readable {
                *seen2.borrow_mut() = true;
                LoopSignal::Terminate
            } else {
                LoopSignal::Continue
            }
        });

        a.write_all(b"x").unwrap();
        ev.run().unwrap();
        assert!(*seen.borrow());
        // keep `b` and `fd` alive for the duration of the test
        drop(b);
    }
}
