//! Scan plans and raster traversal.
//!
//! A [`ScanPlan`] is constructed once before a scan starts and treated as
//! read-only for the scan's duration: the raster geometry, the averaging
//! target, settle time, retry budget, and abort policy all live here as
//! data so the orchestrator's behavior is driven by explicit state rather
//! than ad hoc control flow.
//!
//! Traversal is row-major the way the physical scanner moves: sweep the
//! primary axis across a row, return to the primary origin, then step the
//! secondary axis to the next row.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A gantry motion axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    /// The G-code axis letter.
    pub fn letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// What the orchestrator does when a point fails beyond its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortPolicy {
    /// Record the failure, skip the point, and continue the raster.
    ContinueOnPointFailure,
    /// Transition the whole scan to `Failed` at the first point failure.
    HaltOnFirstFailure,
}

/// One raster position in traversal order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    /// Secondary-axis index (which row).
    pub row: u32,
    /// Primary-axis index (position within the row).
    pub col: u32,
    /// Primary-axis offset from the scan origin, in millimeters.
    pub primary_mm: f64,
    /// Secondary-axis offset from the scan origin, in millimeters.
    pub secondary_mm: f64,
}

/// The read-only description of a scan.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub primary_axis: Axis,
    pub secondary_axis: Axis,
    /// Distance to cover on the primary axis, in millimeters.
    pub primary_range_mm: f64,
    /// Signed step between points on the primary axis, in millimeters.
    pub primary_step_mm: f64,
    pub secondary_range_mm: f64,
    pub secondary_step_mm: f64,
    /// Captures to average per point.
    pub averages: u32,
    /// Wait after each move before capturing, letting vibration decay.
    pub settle: Duration,
    /// Deadline for a single capture.
    pub capture_timeout: Duration,
    /// Retries per point for retryable failures before the point fails.
    pub retry_limit: u32,
    pub abort_policy: AbortPolicy,
    /// Multiplexer channels to acquire at each position, if a mux is fitted.
    pub mux_channels: Option<Vec<u8>>,
}

impl ScanPlan {
    /// Validate the plan's geometry and counts.
    pub fn validate(&self) -> Result<(), String> {
        if self.primary_axis == self.secondary_axis {
            return Err(format!(
                "primary and secondary axes must differ, both are {}",
                self.primary_axis
            ));
        }
        for (name, range, step) in [
            ("primary", self.primary_range_mm, self.primary_step_mm),
            ("secondary", self.secondary_range_mm, self.secondary_step_mm),
        ] {
            if range < 0.0 || range.is_nan() {
                return Err(format!("{name} axis range must be non-negative, got {range}"));
            }
            if step == 0.0 || !step.is_finite() {
                return Err(format!("{name} axis step must be non-zero, got {step}"));
            }
        }
        if self.averages == 0 {
            return Err("averaging count must be at least 1".into());
        }
        if let Some(channels) = &self.mux_channels {
            if channels.is_empty() {
                return Err("mux channel list must not be empty when present".into());
            }
        }
        Ok(())
    }

    /// Points per row (positions along the primary axis, endpoints included).
    pub fn cols(&self) -> u32 {
        steps_for(self.primary_range_mm, self.primary_step_mm) + 1
    }

    /// Number of rows (positions along the secondary axis).
    pub fn rows(&self) -> u32 {
        steps_for(self.secondary_range_mm, self.secondary_step_mm) + 1
    }

    /// Total raster positions visited.
    pub fn point_count(&self) -> u64 {
        u64::from(self.rows()) * u64::from(self.cols())
    }

    /// Acquisitions per raster position (one per mux channel, else one).
    pub fn captures_per_point(&self) -> u64 {
        self.mux_channels.as_ref().map_or(1, |c| c.len() as u64)
    }

    /// The raster in traversal order.
    pub fn points(&self) -> impl Iterator<Item = GridPoint> + '_ {
        let cols = self.cols();
        let rows = self.rows();
        (0..rows).flat_map(move |row| {
            (0..cols).map(move |col| GridPoint {
                row,
                col,
                primary_mm: f64::from(col) * self.primary_step_mm,
                secondary_mm: f64::from(row) * self.secondary_step_mm,
            })
        })
    }
}

/// Whole steps needed to cover `range` at `step` spacing, rounding up so
/// the far edge is always reached.
fn steps_for(range_mm: f64, step_mm: f64) -> u32 {
    if range_mm == 0.0 {
        return 0;
    }
    (range_mm / step_mm.abs()).ceil() as u32
}
