//! Waveform data types.
//!
//! A [`Waveform`] is the immutable output of a single capture: amplitude
//! samples at a fixed interval plus the vertical and trigger settings in
//! effect when it was taken. Waveforms move between components by value;
//! nothing mutates one after capture.

use serde::{Deserialize, Serialize};

/// Which scope input detects pulse timing.
///
/// The trigger channel is separate from the measurement channel: channel A
/// watches the pulser sync output while channel B records the transducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerChannel {
    A,
    B,
}

/// Trigger settings recorded alongside each capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub channel: TriggerChannel,
    /// Threshold the trigger channel must cross, in millivolts.
    pub threshold_mv: f64,
}

/// A single captured waveform. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    /// Amplitude samples in millivolts, in capture order.
    pub samples: Vec<f64>,
    /// Time between consecutive samples, in nanoseconds.
    pub sample_interval_ns: f64,
    /// Full-scale vertical range of the measurement channel, in millivolts.
    pub vertical_range_mv: f64,
    /// Trigger settings in effect for this capture.
    pub trigger: TriggerSpec,
}

impl Waveform {
    /// Number of samples in the waveform.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total capture duration in nanoseconds.
    pub fn duration_ns(&self) -> f64 {
        self.sample_interval_ns * self.samples.len().saturating_sub(1) as f64
    }

    /// True when `other` can be accumulated with `self`: same sample count
    /// and same sample interval.
    pub fn same_shape(&self, other: &Waveform) -> bool {
        self.samples.len() == other.samples.len()
            && self.sample_interval_ns == other.sample_interval_ns
    }
}

/// A waveform produced by the averaging buffer, tagged with how many
/// captures went into the mean.
///
/// Invariant: `1 <= count`, and `count` never exceeds the accumulation
/// target the buffer was reset with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AveragedWaveform {
    pub waveform: Waveform,
    /// Number of captures accumulated into the mean.
    pub count: u32,
}
