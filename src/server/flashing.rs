//! Flashing subsystem adapter (§4.7): watches for the target entering its
//! flashing mode, accumulates the streamed image, and hands it to a
//! `Flasher` once the client sends the end-of-image sentinel.

use crate::error::DeviceError;

/// Opaque collaborator that actually writes an image to a board. The real
/// engine is out of scope; `NullFlasher` is the shipped test/dev backend.
pub trait Flasher {
    fn flash(&mut self, image: &[u8]) -> Result<(), DeviceError>;
}

/// Accepts any image and reports success without touching hardware.
pub struct NullFlasher;

impl Flasher for NullFlasher {
    fn flash(&mut self, image: &[u8]) -> Result<(), DeviceError> {
        log::info!("NullFlasher: accepted {} byte image", image.len());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Open,
}

/// Per-session state machine tracking whether the target is currently in
/// flashing mode and accumulating the image while it is.
pub struct FlashingSession {
    phase: Phase,
    buffer: Vec<u8>,
}

/// What the dispatcher should do in response to driver events or inbound
/// `FASTBOOT_DOWNLOAD` frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashingAction {
    None,
    /// Emit `FASTBOOT_PRESENT(1)` and release any held fastboot key.
    Opened,
    /// Emit `FASTBOOT_PRESENT(0)`.
    Closed,
    /// Emit `FASTBOOT_DOWNLOAD` (empty payload) acknowledging completion.
    FlashCompleteAck,
}

impl FlashingSession {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            buffer: Vec::new(),
        }
    }

    pub fn on_mode_entered(&mut self) -> FlashingAction {
        self.phase = Phase::Open;
        self.buffer.clear();
        FlashingAction::Opened
    }

    pub fn on_mode_exited(&mut self) -> FlashingAction {
        self.phase = Phase::Idle;
        FlashingAction::Closed
    }

    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    /// Handle one inbound `FASTBOOT_DOWNLOAD` chunk. An empty payload is
    /// the end-of-image sentinel: run the flasher and report completion.
    pub fn on_download_chunk(
        &mut self,
        chunk: &[u8],
        flasher: &mut dyn Flasher,
    ) -> Result<FlashingAction, DeviceError> {
        if !self.is_open() {
            return Ok(FlashingAction::None);
        }
        if chunk.is_empty() {
            flasher.flash(&self.buffer)?;
            return Ok(FlashingAction::FlashCompleteAck);
        }
        self.buffer.extend_from_slice(chunk);
        Ok(FlashingAction::None)
    }

    /// The most recently accumulated image, used by `FASTBOOT_BOOT`
    /// (§4.7) to boot the just-flashed image directly.
    pub fn accumulated_image(&self) -> &[u8] {
        &self.buffer
    }
}

impl Default for FlashingSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingFlasher(Vec<u8>);
    impl Flasher for RecordingFlasher {
        fn flash(&mut self, image: &[u8]) -> Result<(), DeviceError> {
            self.0 = image.to_vec();
            Ok(())
        }
    }

    #[test]
    fn chunks_accumulate_until_the_empty_sentinel() {
        let mut session = FlashingSession::new();
        session.on_mode_entered();
        let mut flasher = RecordingFlasher(Vec::new());

        assert_eq!(
            session.on_download_chunk(b"abc", &mut flasher).unwrap(),
            FlashingAction::None
        );
        assert_eq!(
            session.on_download_chunk(b"def", &mut flasher).unwrap(),
            FlashingAction::None
        );
        assert_eq!(
            session.on_download_chunk(b"", &mut flasher).unwrap(),
            FlashingAction::FlashCompleteAck
        );
        assert_eq!(flasher.0, b"abcdef");
    }

    #[test]
    fn chunks_outside_flashing_mode_are_ignored() {
        let mut session = FlashingSession::new();
        let mut flasher = RecordingFlasher(Vec::new());
        assert_eq!(
            session.on_download_chunk(b"stray", &mut flasher).unwrap(),
            FlashingAction::None
        );
        assert!(session.accumulated_image().is_empty());
    }

    #[test]
    fn mode_exit_clears_openness_but_keeps_last_image() {
        let mut session = FlashingSession::new();
        session.on_mode_entered();
        let mut flasher = RecordingFlasher(Vec::new());
        session.on_download_chunk(b"img", &mut flasher).unwrap();
        session.on_download_chunk(b"", &mut flasher).unwrap();
        session.on_mode_exited();
        assert!(!session.is_open());
        assert_eq!(session.accumulated_image(), b"img");
    }

    #[test]
    fn reentering_flashing_mode_clears_the_previous_buffer() {
        let mut session = FlashingSession::new();
        session.on_mode_entered();
        let mut flasher = RecordingFlasher(Vec::new());
        session.on_download_chunk(b"first", &mut flasher).unwrap();
        session.on_mode_exited();
        session.on_mode_entered();
        assert!(session.accumulated_image().is_empty());
    }
}
