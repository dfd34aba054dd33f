//! Outbound work queue (§4.4).
//!
//! The client never writes to the transport from inside a message
//! handler; handlers append a [`WorkItem`] instead. Whenever the queue is
//! non-empty the loop requests write-readiness on the transport; once
//! writable, items drain in FIFO order. An item may report that it has
//! more to send (the image-streaming item does this deliberately, one
//! 2048-byte chunk at a time, so keypresses queued behind it still get a
//! turn) or that the underlying write would block (in which case draining
//! stops for this readiness notification and resumes on the next one).

use std::collections::VecDeque;
use std::io::{self, Write};

/// Result of one [`WorkItem::attempt_send`] call.
pub enum SendOutcome {
    /// The item is fully sent; drop it.
    Done,
    /// The item sent something but deliberately wants another turn later
    /// (e.g. one more chunk of a large image). Re-enqueue at the tail.
    More,
    /// The underlying write returned `WouldBlock`. Re-enqueue at the
    /// tail and stop draining until the transport is writable again.
    WouldBlock,
}

pub trait WorkItem {
    fn attempt_send(&mut self, out: &mut dyn Write) -> io::Result<SendOutcome>;
}

/// A `WorkItem` that sends one pre-encoded frame in a single call and is
/// then done. Used for everything except the image-streaming item.
pub struct OneShot {
    bytes: Vec<u8>,
    sent: usize,
}

impl OneShot {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, sent: 0 }
    }
}

impl WorkItem for OneShot {
    fn attempt_send(&mut self, out: &mut dyn Write) -> io::Result<SendOutcome> {
        while self.sent < self.bytes.len() {
            match out.write(&self.bytes[self.sent..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SendOutcome::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(SendOutcome::Done)
    }
}

#[derive(Default)]
pub struct OutboundQueue {
    items: VecDeque<Box<dyn WorkItem>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: impl WorkItem + 'static) {
        self.items.push_back(Box::new(item));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drain until either the queue is empty or a write would block.
    /// Each internal pass covers only the items present when that pass
    /// started (later-requeued items wait for the next pass), which is
    /// what lets a streaming item yield to items queued behind it instead
    /// of hogging the whole drain — but unlike a single bounded pass,
    /// this keeps passing over the queue until nothing is left to send,
    /// since `mio` fds are edge-triggered and a writable edge delivered
    /// once won't come again while the pipe stays writable.
    ///
    /// Returns `true` if a write would block (the caller should stop
    /// requesting more work until the next readiness notification; the
    /// queue keeps its write-interest registered either way as long as
    /// it's non-empty).
    pub fn drain(&mut self, out: &mut dyn Write) -> io::Result<bool> {
        loop {
            if self.items.is_empty() {
                return Ok(false);
            }
            let pass_len = self.items.len();
            for _ in 0..pass_len {
                let Some(mut item) = self.items.pop_front() else {
                    break;
                };
                match item.attempt_send(out)? {
                    SendOutcome::Done => {}
                    SendOutcome::More => self.items.push_back(item),
                    SendOutcome::WouldBlock => {
                        self.items.push_back(item);
                        return Ok(true);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Vec<u8>);
    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct CountingStream {
        chunks: Vec<u8>,
        offset: usize,
        log: std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>,
        tag: &'static str,
    }

    impl WorkItem for CountingStream {
        fn attempt_send(&mut self, out: &mut dyn Write) -> io::Result<SendOutcome> {
            if self.offset >= self.chunks.len() {
                return Ok(SendOutcome::Done);
            }
            out.write_all(&[self.chunks[self.offset]])?;
            self.log.borrow_mut().push(self.tag);
            self.offset += 1;
            if self.offset >= self.chunks.len() {
                Ok(SendOutcome::Done)
            } else {
                Ok(SendOutcome::More)
            }
        }
    }

    #[test]
    fn drains_in_fifo_order() {
        let mut q = OutboundQueue::new();
        q.push(OneShot::new(vec![1]));
        q.push(OneShot::new(vec![2]));
        q.push(OneShot::new(vec![3]));

        let mut out = Recorder(Vec::new());
        q.drain(&mut out).unwrap();
        assert_eq!(out.0, vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn self_requeueing_item_yields_to_items_queued_behind_it() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut q = OutboundQueue::new();
        q.push(CountingStream {
            chunks: vec![1, 2, 3],
            offset: 0,
            log: log.clone(),
            tag: "stream",
        });
        q.push(OneShot::new(vec![9]));

        let mut out = Recorder(Vec::new());
        // One `drain` call now empties the whole queue (it keeps passing
        // over it until nothing is left), but the one-shot item still
        // gets serviced after the stream's first chunk rather than
        // waiting for the stream to finish first.
        q.drain(&mut out).unwrap();
        assert_eq!(out.0, vec![1, 9, 2, 3]);
        assert_eq!(*log.borrow(), vec!["stream", "stream", "stream"]);
        assert!(q.is_empty());
    }

    #[test]
    fn drain_stops_and_reports_would_block() {
        struct Blocks;
        impl WorkItem for Blocks {
            fn attempt_send(&mut self, _out: &mut dyn Write) -> io::Result<SendOutcome> {
                Ok(SendOutcome::WouldBlock)
            }
        }
        let mut q = OutboundQueue::new();
        q.push(Blocks);
        q.push(OneShot::new(vec![9]));

        let mut out = Recorder(Vec::new());
        let blocked = q.drain(&mut out).unwrap();
        assert!(blocked);
        assert!(out.0.is_empty());
        assert!(!q.is_empty());
    }
}
