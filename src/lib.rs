//! Shared library behind the `dutctl` client and `dutctl-serverd` server
//! binaries: the ring buffer, wire framing, and event loop both processes
//! use, plus the client- and server-specific modules built on top of them.

pub mod client;
pub mod error;
pub mod frame;
pub mod ioutil;
pub mod reactor;
pub mod ring;
pub mod server;
pub mod workqueue;
