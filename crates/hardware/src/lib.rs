//! Device drivers for the ultrascan rig.
//!
//! One driver per physical device, each exclusively owning its port and
//! implementing the matching capability trait from `common`:
//!
//! - [`gantry::Gantry`] — G-code gantry over USB-serial (`Motion`).
//! - [`pulser::CompactPulser`] / [`pulser::BridgedPulser`] — the serial
//!   square-wave pulser and the bridged 32-bit tone-burst unit
//!   (`PulseSource`).
//! - [`mux::Mux`] — relay multiplexer (`ChannelSelect`).
//! - [`capture::CaptureUnit`] — trigger/capture unit over a [`capture::ScopeLink`]
//!   backend (`WaveformSource`).
//! - [`sim`] — simulated implementations of every seam, with fault
//!   injection, used by tests and hardware-free runs.
//!
//! Real serial I/O lives behind the default `serial` feature; with it
//! disabled the drivers still compile against in-memory ports, which is
//! how the test suite runs everywhere.

pub mod capture;
pub mod gantry;
pub mod mux;
pub mod pulser;
pub mod serial;
pub mod sim;

pub use capture::{CaptureUnit, ScopeLink, ScopeSettings};
pub use gantry::Gantry;
pub use mux::Mux;
pub use pulser::{BridgedPulser, CompactPulser};
