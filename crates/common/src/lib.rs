//! Core types for the ultrascan acquisition system.
//!
//! This crate carries everything the orchestrator, the device drivers,
//! and the bridge agree on: the waveform data model, the averaging
//! buffer, raster plans, timebase quantization, the capability traits at
//! the device seams, the configuration surface, and the error taxonomy.
//! It performs no device I/O of its own.

pub mod average;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod plan;
pub mod timebase;
pub mod waveform;

pub use average::AveragingBuffer;
pub use error::{BridgeError, ScanError, ScanResult};
pub use plan::{AbortPolicy, Axis, GridPoint, ScanPlan};
pub use waveform::{AveragedWaveform, TriggerChannel, TriggerSpec, Waveform};
