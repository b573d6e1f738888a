//! Capability traits at the device seams.
//!
//! The orchestrator never talks to hardware directly; it holds trait
//! objects for the four device roles in this rig. Each trait is async,
//! thread-safe, and returns typed [`ScanError`] failures so the retry
//! policy upstairs can classify them. Simulated implementations satisfy
//! the same contracts, which is what makes the orchestrator testable
//! without a single serial port attached.
//!
//! Every operation that touches a device is a blocking call with an
//! explicit timeout owned by the implementation; none of these methods is
//! allowed to wait forever.

use crate::error::ScanResult;
use crate::plan::Axis;
use crate::waveform::Waveform;
use async_trait::async_trait;
use std::time::Duration;

/// Positions the gantry over a line-oriented command/acknowledgment
/// protocol.
#[async_trait]
pub trait Motion: Send + Sync {
    /// Move one axis to an absolute position (mm from the homed origin)
    /// and block until the device acknowledges motion complete.
    async fn move_to(&self, axis: Axis, position_mm: f64) -> ScanResult<()>;

    /// Move one axis by a relative distance in millimeters.
    async fn move_rel(&self, axis: Axis, distance_mm: f64) -> ScanResult<()>;

    /// Home all axes to the reference position. Invoked at scan start and
    /// on recovery from a motion fault.
    async fn home(&self) -> ScanResult<()>;
}

/// Drives the pulse generator.
#[async_trait]
pub trait PulseSource: Send + Sync {
    /// Set the pulse repetition rate in Hz; 0 stops pulsing.
    async fn set_rate(&self, hz: u32) -> ScanResult<()>;

    /// Start pulsing at the configured repetition rate.
    async fn enable(&self) -> ScanResult<()>;

    /// Stop pulsing.
    async fn disable(&self) -> ScanResult<()>;

    /// Per-capture arm hook, issued strictly after the scope is armed.
    ///
    /// Free-running units pulse continuously and treat this as a no-op;
    /// the bridged tone-burst unit fires a burst per arm.
    async fn arm(&self) -> ScanResult<()> {
        Ok(())
    }
}

/// Captures a single triggered waveform.
#[async_trait]
pub trait WaveformSource: Send + Sync {
    /// Arm for one trigger and block until a waveform is captured or
    /// `timeout` elapses, failing with `CaptureTimeout` rather than
    /// hanging — a mis-wired trigger cable must not stall a scan forever.
    async fn capture_one(&self, timeout: Duration) -> ScanResult<Waveform>;
}

/// Routes transducer channels through the optional multiplexer.
#[async_trait]
pub trait ChannelSelect: Send + Sync {
    /// Select the routing for `channel`, releasing the previous routing
    /// first.
    async fn select(&self, channel: u8) -> ScanResult<()>;

    /// Release every switch.
    async fn clear(&self) -> ScanResult<()>;
}
