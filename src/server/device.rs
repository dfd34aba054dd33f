//! Device abstraction (§4.6): a polymorphic board object dispatching
//! power/console/USB/break/flash operations to a concrete back-end driver.
//!
//! Splits a generic driver trait from the object that owns one: `Device`
//! is the owner (one per session, exposing the capability surface the
//! dispatcher needs); `BoardDriver` is the trait object hiding the
//! concrete back end behind a common interface.

use crate::error::DeviceError;
use bitflags::bitflags;

bitflags! {
    /// Which operations a given back end actually supports. The registry
    /// consults this at dispatch time to reject operations a driver can't
    /// perform rather than letting them silently no-op.
    pub struct Capabilities: u8 {
        const POWER = 1 << 0;
        const USB = 1 << 1;
        const BREAK = 1 << 2;
        const FLASH = 1 << 3;
    }
}

/// An event a `BoardDriver` may emit spontaneously (not in response to a
/// dispatcher call), observed by the flashing adapter (§4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    FlashingModeEntered,
    FlashingModeExited,
    Console(Vec<u8>),
    Status(String),
}

/// Concrete board back ends. The dispatcher and the flashing adapter only
/// ever see this through the `BoardDriver` trait object on `Device`.
pub trait BoardDriver {
    fn capabilities(&self) -> Capabilities;
    fn power(&mut self, on: bool) -> Result<(), DeviceError>;
    fn write_console(&mut self, bytes: &[u8]) -> Result<(), DeviceError>;
    fn usb(&mut self, on: bool) -> Result<(), DeviceError>;
    fn send_break(&mut self) -> Result<(), DeviceError>;
    fn boot(&mut self, image: &[u8]) -> Result<(), DeviceError>;
    fn fastboot_continue(&mut self) -> Result<(), DeviceError>;
    fn hold_fastboot_key(&mut self, held: bool) -> Result<(), DeviceError>;
    fn enable_status(&mut self) -> Result<(), DeviceError>;
    fn close(&mut self);

    /// Drain driver-generated events since the last call. Pure virtual
    /// back ends (relay, FTDI-GPIO) would source this from real hardware
    /// polling; `VirtualDriver` lets tests inject events directly.
    fn poll_events(&mut self) -> Vec<DriverEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    On,
}

/// One board-instance entity, created by the first `SELECT_BOARD` of a
/// session and destroyed at session teardown (§3 "Device").
pub struct Device {
    pub name: String,
    pub owner: String,
    driver: Box<dyn BoardDriver>,
    power_state: PowerState,
    status_enabled: bool,
}

impl Device {
    pub fn new(name: String, owner: String, driver: Box<dyn BoardDriver>) -> Self {
        Self {
            name,
            owner,
            driver,
            power_state: PowerState::Off,
            status_enabled: false,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.driver.capabilities()
    }

    pub fn power_state(&self) -> PowerState {
        self.power_state
    }

    pub fn status_enabled(&self) -> bool {
        self.status_enabled
    }

    fn require(&self, cap: Capabilities, operation: &'static str) -> Result<(), DeviceError> {
        if self.driver.capabilities().contains(cap) {
            Ok(())
        } else {
            Err(DeviceError::Unsupported { operation })
        }
    }

    pub fn power(&mut self, on: bool) -> Result<(), DeviceError> {
        self.require(Capabilities::POWER, "power")?;
        self.driver.power(on)?;
        self.power_state = if on { PowerState::On } else { PowerState::Off };
        Ok(())
    }

    pub fn write_console(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        self.driver.write_console(bytes)
    }

    pub fn usb(&mut self, on: bool) -> Result<(), DeviceError> {
        self.require(Capabilities::USB, "usb")?;
        self.driver.usb(on)
    }

    pub fn send_break(&mut self) -> Result<(), DeviceError> {
        self.require(Capabilities::BREAK, "send_break")?;
        self.driver.send_break()
    }

    pub fn boot(&mut self, image: &[u8]) -> Result<(), DeviceError> {
        self.require(Capabilities::FLASH, "boot")?;
        self.driver.boot(image)
    }

    pub fn fastboot_continue(&mut self) -> Result<(), DeviceError> {
        self.require(Capabilities::FLASH, "fastboot_continue")?;
        self.driver.fastboot_continue()
    }

    pub fn hold_fastboot_key(&mut self, held: bool) -> Result<(), DeviceError> {
        self.driver.hold_fastboot_key(held)
    }

    pub fn enable_status(&mut self) -> Result<(), DeviceError> {
        self.status_enabled = true;
        self.driver.enable_status()
    }

    pub fn poll_events(&mut self) -> Vec<DriverEvent> {
        self.driver.poll_events()
    }

    pub fn close(&mut self) {
        self.driver.close();
    }
}
