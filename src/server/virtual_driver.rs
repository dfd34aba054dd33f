//! `VirtualDriver`: a `BoardDriver` back end with no real hardware,
//! used for local development, demos, and the test suite (§4.6). It
//! accumulates console output and lets a test synthesize flashing-mode
//! and console events exactly as a real driver would surface them.

use crate::error::DeviceError;
use crate::server::device::{BoardDriver, Capabilities, DriverEvent};
use std::collections::VecDeque;

pub struct VirtualDriver {
    console_log: Vec<u8>,
    pending_events: VecDeque<DriverEvent>,
    fastboot_key_held: bool,
    powered: bool,
}

impl VirtualDriver {
    pub fn new() -> Self {
        Self {
            console_log: Vec::new(),
            pending_events: VecDeque::new(),
            fastboot_key_held: false,
            powered: false,
        }
    }

    /// Test/demo hook: synthesize the board entering flashing mode.
    pub fn simulate_flashing_mode_entered(&mut self) {
        self.pending_events.push_back(DriverEvent::FlashingModeEntered);
    }

    pub fn simulate_flashing_mode_exited(&mut self) {
        self.pending_events.push_back(DriverEvent::FlashingModeExited);
    }

    pub fn simulate_console_bytes(&mut self, bytes: &[u8]) {
        self.pending_events
            .push_back(DriverEvent::Console(bytes.to_vec()));
    }

    pub fn console_log(&self) -> &[u8] {
        &self.console_log
    }

    pub fn fastboot_key_held(&self) -> bool {
        self.fastboot_key_held
    }
}

impl Default for VirtualDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardDriver for VirtualDriver {
    fn capabilities(&self) -> Capabilities {
        Capabilities::POWER | Capabilities::USB | Capabilities::BREAK | Capabilities::FLASH
    }

    fn power(&mut self, on: bool) -> Result<(), DeviceError> {
        self.powered = on;
        Ok(())
    }

    fn write_console(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        self.console_log.extend_from_slice(bytes);
        Ok(())
    }

    fn usb(&mut self, _on: bool) -> Result<(), DeviceError> {
        Ok(())
    }

    fn send_break(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn boot(&mut self, _image: &[u8]) -> Result<(), DeviceError> {
        Ok(())
    }

    fn fastboot_continue(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn hold_fastboot_key(&mut self, held: bool) -> Result<(), DeviceError> {
        self.fastboot_key_held = held;
        Ok(())
    }

    fn enable_status(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(&mut self) {
        self.powered = false;
    }

    fn poll_events(&mut self) -> Vec<DriverEvent> {
        self.pending_events.drain(..).collect()
    }
}
