//! Running-mean accumulation of repeated captures.
//!
//! Averaging N repeated captures is how the rig pulls a clean echo out of
//! noise. The buffer merges each new waveform into a running mean with the
//! incremental update `mean += (sample - mean) / count` instead of summing
//! and dividing at the end, which bounds numeric drift over long averaging
//! runs (N is commonly in the hundreds to thousands).
//!
//! [`AveragingBuffer::result`] is valid before the target count is reached,
//! so a progress observer can display the partial mean without perturbing
//! the acquisition sequence.

use crate::error::{ScanError, ScanResult};
use crate::waveform::{AveragedWaveform, Waveform};

/// Accumulates repeated captures into a running mean waveform.
#[derive(Debug)]
pub struct AveragingBuffer {
    target: u32,
    count: u32,
    mean: Option<Waveform>,
}

impl AveragingBuffer {
    /// Create a buffer that accumulates toward `target` captures.
    pub fn new(target: u32) -> Self {
        Self {
            target: target.max(1),
            count: 0,
            mean: None,
        }
    }

    /// Begin a new accumulation toward `target` captures, discarding any
    /// partial state.
    pub fn reset(&mut self, target: u32) {
        self.target = target.max(1);
        self.count = 0;
        self.mean = None;
    }

    /// Merge one capture into the running mean.
    ///
    /// Fails with [`ScanError::ShapeMismatch`] if `waveform` differs in
    /// sample count or interval from the accumulation's first waveform;
    /// the buffer's prior state is left untouched in that case.
    pub fn accumulate(&mut self, waveform: &Waveform) -> ScanResult<()> {
        match &mut self.mean {
            None => {
                self.mean = Some(waveform.clone());
                self.count = 1;
            }
            Some(mean) => {
                if !mean.same_shape(waveform) {
                    return Err(ScanError::ShapeMismatch {
                        expected: mean.len(),
                        actual: waveform.len(),
                    });
                }
                self.count += 1;
                let n = f64::from(self.count);
                for (m, s) in mean.samples.iter_mut().zip(&waveform.samples) {
                    *m += (s - *m) / n;
                }
            }
        }
        Ok(())
    }

    /// The current partial (or complete) mean.
    ///
    /// Returns `None` before the first capture is accumulated.
    pub fn result(&self) -> Option<AveragedWaveform> {
        self.mean.as_ref().map(|waveform| AveragedWaveform {
            waveform: waveform.clone(),
            count: self.count,
        })
    }

    /// Whether the accumulation count has reached the target.
    pub fn is_complete(&self) -> bool {
        self.count >= self.target
    }

    /// Number of captures accumulated so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The accumulation target.
    pub fn target(&self) -> u32 {
        self.target
    }
}
