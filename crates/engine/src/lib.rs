//! Scan orchestration for the ultrascan rig.
//!
//! [`Orchestrator`] is the acquisition state machine: it sequences
//! motion, settling, triggered capture, averaging, and persistence over
//! the device seams defined in `common`, with retry and abort policy
//! carried as plan data. [`store`] is the append-only, crash-tolerant
//! persistence layer each scan writes through.

pub mod orchestrator;
pub mod store;

pub use orchestrator::{
    CancelHandle, Orchestrator, ScanDevices, ScanEvent, ScanOutcome, ScanState, ScanSummary,
};
pub use store::{read_store, FailureRecord, PointRecord, ScanManifest, ScanStore, StoreRecord};
