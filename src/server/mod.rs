//! Host-side half of the harness: the board registry, the polymorphic
//! device/driver abstraction, the flashing adapter, and the dispatcher
//! that drives them from decoded frames.

pub mod device;
pub mod dispatch;
pub mod flashing;
pub mod registry;
pub mod virtual_driver;
