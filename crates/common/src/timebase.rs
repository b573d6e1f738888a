//! Timebase and vertical-range quantization.
//!
//! The digitizer only supports discrete sample intervals and vertical
//! ranges, so requested capture settings are quantized before a scan
//! starts and the *effective* values are what get recorded with the data.
//!
//! Timebase indices follow the 1 GS/s block-mode scheme with two channels
//! enabled: the minimum interval is 2 ns (index 1), intervals below 8 ns
//! are powers of two (`interval = 2^index`), and everything above runs on
//! the 125 MS/s ladder (`index = interval_s * 125e6 + 2`).

use crate::error::{ScanError, ScanResult};

/// Minimum sample interval with two channels enabled, in nanoseconds.
pub const MIN_SAMPLE_INTERVAL_NS: f64 = 2.0;

/// Longest representable sample interval, in nanoseconds (~30 s).
pub const MAX_SAMPLE_INTERVAL_NS: f64 = 30.0e9;

/// Discrete full-scale vertical ranges, in volts.
pub const VERTICAL_RANGES_V: [f64; 10] = [0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0];

/// A quantized device timebase: the index the hardware consumes and the
/// sample interval it actually produces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timebase {
    pub index: u32,
    pub sample_interval_ns: f64,
}

impl Timebase {
    /// Quantize a requested measurement of `samples` points over
    /// `duration_us` microseconds to the nearest supported timebase.
    ///
    /// Fails with [`ScanError::Configuration`] when the implied sample
    /// interval is below the two-channel device resolution or beyond the
    /// longest supported interval.
    pub fn from_duration_samples(samples: u32, duration_us: f64) -> ScanResult<Timebase> {
        if samples == 0 {
            return Err(ScanError::Configuration(
                "sample count must be at least 1".into(),
            ));
        }
        if duration_us <= 0.0 || duration_us.is_nan() {
            return Err(ScanError::Configuration(format!(
                "capture duration must be positive, got {duration_us} us"
            )));
        }

        let estimated_ns = duration_us * 1000.0 / f64::from(samples);

        if estimated_ns < MIN_SAMPLE_INTERVAL_NS {
            return Err(ScanError::Configuration(format!(
                "requested sample interval {estimated_ns:.3} ns is below the \
                 2 ns two-channel device resolution"
            )));
        }

        if estimated_ns < 8.0 {
            // Power-of-two region: index n gives an interval of 2^n ns.
            let index = estimated_ns.log2().floor() as u32;
            return Ok(Timebase {
                index,
                sample_interval_ns: f64::powi(2.0, index as i32),
            });
        }

        if estimated_ns < MAX_SAMPLE_INTERVAL_NS {
            // 125 MS/s ladder: interval = (index - 2) / 125e6 seconds.
            let index = (125.0e6 * (estimated_ns * 1.0e-9)) as u64 + 2;
            let actual_ns = 1.0e9 * (index - 2) as f64 / 125.0e6;
            return Ok(Timebase {
                index: index as u32,
                sample_interval_ns: actual_ns,
            });
        }

        Err(ScanError::Configuration(format!(
            "requested sample interval {estimated_ns:.0} ns exceeds the longest \
             supported timebase"
        )))
    }
}

/// A selected vertical range: the 1-based index the hardware consumes and
/// the full-scale value it corresponds to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerticalRange {
    pub index: u8,
    pub full_scale_v: f64,
}

impl VerticalRange {
    /// Select the smallest supported range that covers `requested_v` volts.
    ///
    /// Requests above the 20 V maximum clamp to the maximum with a warning
    /// rather than failing, matching the instrument's behavior; an
    /// undersized range clips rather than faults, so this is a usability
    /// concern, not a safety one.
    pub fn covering(requested_v: f64) -> ScanResult<VerticalRange> {
        if requested_v <= 0.0 || requested_v.is_nan() {
            return Err(ScanError::Configuration(format!(
                "vertical range must be positive, got {requested_v} V"
            )));
        }

        match VERTICAL_RANGES_V.iter().position(|v| *v >= requested_v) {
            Some(pos) => Ok(VerticalRange {
                index: pos as u8 + 1,
                full_scale_v: VERTICAL_RANGES_V[pos],
            }),
            None => {
                let max = VERTICAL_RANGES_V[VERTICAL_RANGES_V.len() - 1];
                tracing::warn!(
                    requested_v,
                    clamped_v = max,
                    "requested vertical range exceeds device maximum, clamping"
                );
                Ok(VerticalRange {
                    index: VERTICAL_RANGES_V.len() as u8,
                    full_scale_v: max,
                })
            }
        }
    }

    /// Full-scale range in millivolts.
    pub fn full_scale_mv(&self) -> f64 {
        self.full_scale_v * 1000.0
    }
}
