//! Scan orchestration state machine.
//!
//! One logical acquisition task drives the whole sequence; device I/O is
//! blocking-with-timeout and nothing overlaps motion with capture for a
//! given point, because capturing while the gantry still vibrates blurs
//! the waveform. The per-point sequence is:
//!
//! ```text
//! Idle → Homing → ┌─ Positioning → Settling → Capturing ⇄ Averaging → Persisting ─┐
//!                 └────────────────────── next point ←──────────────────────────────┘
//!                                           → Complete | Aborted | Failed
//! ```
//!
//! Retry and abort policy live here as data (the plan's retry limit and
//! [`AbortPolicy`]), never inside device wrappers, so the policy is
//! testable against simulated devices. Cancellation is cooperative: the
//! flag is checked between discrete steps, and an in-flight call
//! completes or times out before an abort takes effect.

use crate::store::{FailureRecord, PointRecord, ScanManifest, ScanStore};
use chrono::Utc;
use common::capabilities::{ChannelSelect, Motion, PulseSource, WaveformSource};
use common::plan::{AbortPolicy, GridPoint, ScanPlan};
use common::{AveragingBuffer, ScanError, ScanResult};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, instrument, warn};

/// States of the scan state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Homing,
    Positioning,
    Settling,
    Capturing,
    Averaging,
    Persisting,
    Complete,
    Aborted,
    Failed,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ScanState::Idle => "idle",
            ScanState::Homing => "homing",
            ScanState::Positioning => "positioning",
            ScanState::Settling => "settling",
            ScanState::Capturing => "capturing",
            ScanState::Averaging => "averaging",
            ScanState::Persisting => "persisting",
            ScanState::Complete => "complete",
            ScanState::Aborted => "aborted",
            ScanState::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Complete,
    Aborted,
    Failed,
}

/// Progress events broadcast to read-only observers.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    StateChanged(ScanState),
    PointStarted {
        sequence: u64,
        row: u32,
        col: u32,
        mux_channel: Option<u8>,
    },
    /// Emitted after each accumulated capture; `accumulated`/`target`
    /// drives progress display without touching the acquisition task.
    CaptureProgress {
        sequence: u64,
        accumulated: u32,
        target: u32,
    },
    PointPersisted {
        sequence: u64,
    },
    PointFailed {
        sequence: u64,
        error: String,
    },
    Finished {
        outcome: ScanOutcome,
        persisted: u64,
        failed: u64,
    },
}

/// Cooperative cancellation flag, checked between discrete steps.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Re-arm the handle for another run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The device roles a scan drives. All are exclusively owned trait
/// objects; simulated implementations slot in for tests.
pub struct ScanDevices {
    pub motion: Arc<dyn Motion>,
    pub capture: Arc<dyn WaveformSource>,
    pub pulser: Arc<dyn PulseSource>,
    pub mux: Option<Arc<dyn ChannelSelect>>,
}

/// Counters for a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub outcome: ScanOutcome,
    pub persisted: u64,
    pub failed: u64,
}

/// Outcome of one point, internal to the run loop.
enum PointOutcome {
    Persisted,
    Failed(ScanError),
    Cancelled,
}

/// The top-level acquisition state machine.
pub struct Orchestrator {
    devices: ScanDevices,
    plan: ScanPlan,
    state: RwLock<ScanState>,
    events: broadcast::Sender<ScanEvent>,
    cancel: CancelHandle,
}

impl Orchestrator {
    /// Build an orchestrator over validated inputs.
    pub fn new(devices: ScanDevices, plan: ScanPlan) -> ScanResult<Self> {
        plan.validate().map_err(ScanError::Configuration)?;
        if plan.mux_channels.is_some() && devices.mux.is_none() {
            return Err(ScanError::Configuration(
                "plan names mux channels but no multiplexer is fitted".into(),
            ));
        }
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            devices,
            plan,
            state: RwLock::new(ScanState::Idle),
            events,
            cancel: CancelHandle::new(),
        })
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Handle for cancelling the run from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Current state, for read-only progress polling.
    pub async fn state(&self) -> ScanState {
        *self.state.read().await
    }

    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    async fn set_state(&self, state: ScanState) {
        let changed = {
            let mut guard = self.state.write().await;
            let changed = *guard != state;
            *guard = state;
            changed
        };
        if changed {
            self.emit(ScanEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine; progress reporting is optional.
        let _ = self.events.send(event);
    }

    /// Run the full raster scan, appending to `store`.
    ///
    /// Per-point failures beyond the retry budget are recorded in the
    /// store; whether they abort the scan is the plan's abort policy.
    /// Bridge faults are fatal regardless of policy. An abort via the
    /// cancel handle homes the gantry best-effort and returns an
    /// `Aborted` summary rather than an error.
    #[instrument(skip_all, err)]
    pub async fn run(&self, store: &mut ScanStore) -> ScanResult<ScanSummary> {
        self.cancel.reset();
        let mut persisted: u64 = 0;
        let mut failed: u64 = 0;

        info!(
            points = self.plan.point_count(),
            averages = self.plan.averages,
            "scan starting"
        );

        self.set_state(ScanState::Homing).await;
        if let Err(e) = self.prepare().await {
            return self.fail(e, persisted, failed).await;
        }

        let channels: Vec<Option<u8>> = match &self.plan.mux_channels {
            Some(list) => list.iter().copied().map(Some).collect(),
            None => vec![None],
        };

        let mut sequence: u64 = 0;
        let points: Vec<GridPoint> = self.plan.points().collect();
        for point in points {
            for channel in &channels {
                if self.cancel.is_cancelled() {
                    return Ok(self.abort(persisted, failed).await);
                }

                self.emit(ScanEvent::PointStarted {
                    sequence,
                    row: point.row,
                    col: point.col,
                    mux_channel: *channel,
                });

                match self.run_point(store, sequence, &point, *channel).await {
                    PointOutcome::Persisted => {
                        persisted += 1;
                        self.emit(ScanEvent::PointPersisted { sequence });
                    }
                    PointOutcome::Cancelled => {
                        return Ok(self.abort(persisted, failed).await);
                    }
                    PointOutcome::Failed(error) => {
                        if self.cancel.is_cancelled() {
                            return Ok(self.abort(persisted, failed).await);
                        }
                        failed += 1;
                        warn!(sequence, error = %error, "point failed beyond retry budget");
                        let record = FailureRecord {
                            sequence,
                            row: point.row,
                            col: point.col,
                            mux_channel: *channel,
                            error: error.to_string(),
                            recorded_at: Utc::now(),
                        };
                        if let Err(e) = store.append_failure(record) {
                            return self.fail(e, persisted, failed).await;
                        }
                        self.emit(ScanEvent::PointFailed {
                            sequence,
                            error: error.to_string(),
                        });

                        let fatal = matches!(error, ScanError::Bridge(_));
                        if fatal || self.plan.abort_policy == AbortPolicy::HaltOnFirstFailure {
                            return self.fail(error, persisted, failed).await;
                        }
                    }
                }
                sequence += 1;
            }
        }

        self.teardown().await;
        self.set_state(ScanState::Complete).await;
        let summary = ScanSummary {
            outcome: ScanOutcome::Complete,
            persisted,
            failed,
        };
        self.emit(ScanEvent::Finished {
            outcome: summary.outcome,
            persisted,
            failed,
        });
        info!(persisted, failed, "scan complete");
        Ok(summary)
    }

    /// Acquire a single point at the current position: no homing, no
    /// motion. The rig's bench-test mode.
    #[instrument(skip_all, err)]
    pub async fn run_single(&self, store: &mut ScanStore) -> ScanResult<ScanSummary> {
        self.cancel.reset();
        if let Err(e) = self.devices.pulser.enable().await {
            return self.fail(e, 0, 0).await;
        }

        let point = GridPoint {
            row: 0,
            col: 0,
            primary_mm: 0.0,
            secondary_mm: 0.0,
        };
        self.emit(ScanEvent::PointStarted {
            sequence: 0,
            row: 0,
            col: 0,
            mux_channel: None,
        });

        let outcome = self.capture_and_persist(store, 0, &point, None).await;
        self.teardown().await;
        match outcome {
            PointOutcome::Persisted => {
                self.emit(ScanEvent::PointPersisted { sequence: 0 });
                self.set_state(ScanState::Complete).await;
                Ok(ScanSummary {
                    outcome: ScanOutcome::Complete,
                    persisted: 1,
                    failed: 0,
                })
            }
            PointOutcome::Cancelled => Ok(self.abort(0, 0).await),
            PointOutcome::Failed(e) => self.fail(e, 0, 0).await,
        }
    }

    /// Run the plan repeatedly on a minimum interval, one store file per
    /// iteration (`base_0.jsonl`, `base_1.jsonl`, ...).
    #[instrument(skip(self, manifest), err)]
    pub async fn run_repeated(
        &self,
        base_path: &Path,
        manifest: &ScanManifest,
        count: u32,
        interval: Duration,
    ) -> ScanResult<Vec<ScanSummary>> {
        let mut summaries = Vec::with_capacity(count as usize);

        for iteration in 0..count {
            let started = tokio::time::Instant::now();

            let path = indexed_path(base_path, iteration);
            let mut store = ScanStore::create(&path, manifest)?;
            info!(iteration, path = %path.display(), "repeated scan iteration");

            let summary = self.run(&mut store).await?;
            let stop = summary.outcome == ScanOutcome::Aborted;
            summaries.push(summary);
            if stop {
                break;
            }

            if iteration + 1 < count {
                let elapsed = started.elapsed();
                if let Some(remaining) = interval.checked_sub(elapsed) {
                    if !self.wait_interruptible(remaining).await {
                        break;
                    }
                }
            }
        }

        Ok(summaries)
    }

    /// Home and start the pulser.
    async fn prepare(&self) -> ScanResult<()> {
        let motion = Arc::clone(&self.devices.motion);
        self.retrying("home", move || {
            let motion = Arc::clone(&motion);
            async move { motion.home().await }
        })
        .await?;
        self.devices.pulser.enable().await
    }

    /// One raster position: position, settle, then capture and persist.
    async fn run_point(
        &self,
        store: &mut ScanStore,
        sequence: u64,
        point: &GridPoint,
        channel: Option<u8>,
    ) -> PointOutcome {
        self.set_state(ScanState::Positioning).await;
        let motion = Arc::clone(&self.devices.motion);
        let (primary_axis, secondary_axis) = (self.plan.primary_axis, self.plan.secondary_axis);
        let (primary_mm, secondary_mm) = (point.primary_mm, point.secondary_mm);

        if let Err(e) = self
            .retrying("position", move || {
                let motion = Arc::clone(&motion);
                async move {
                    motion.move_to(primary_axis, primary_mm).await?;
                    motion.move_to(secondary_axis, secondary_mm).await
                }
            })
            .await
        {
            return PointOutcome::Failed(e);
        }

        if self.cancel.is_cancelled() {
            return PointOutcome::Cancelled;
        }

        if let Some(channel) = channel {
            if let Some(mux) = &self.devices.mux {
                if let Err(e) = mux.select(channel).await {
                    return PointOutcome::Failed(e);
                }
            }
        }

        self.set_state(ScanState::Settling).await;
        if !self.wait_interruptible(self.plan.settle).await {
            return PointOutcome::Cancelled;
        }

        self.capture_and_persist(store, sequence, point, channel)
            .await
    }

    /// The Capturing ⇄ Averaging loop followed by one Persisting step.
    async fn capture_and_persist(
        &self,
        store: &mut ScanStore,
        sequence: u64,
        point: &GridPoint,
        channel: Option<u8>,
    ) -> PointOutcome {
        let mut buffer = AveragingBuffer::new(self.plan.averages);

        while !buffer.is_complete() {
            if self.cancel.is_cancelled() {
                return PointOutcome::Cancelled;
            }

            self.set_state(ScanState::Capturing).await;
            let capture = Arc::clone(&self.devices.capture);
            let timeout = self.plan.capture_timeout;
            let waveform = match self
                .retrying("capture", move || {
                    let capture = Arc::clone(&capture);
                    async move { capture.capture_one(timeout).await }
                })
                .await
            {
                Ok(w) => w,
                Err(e) => return PointOutcome::Failed(e),
            };

            self.set_state(ScanState::Averaging).await;
            if let Err(e) = buffer.accumulate(&waveform) {
                // Shape changed mid-scan; the accumulation is unusable.
                return PointOutcome::Failed(e);
            }
            self.emit(ScanEvent::CaptureProgress {
                sequence,
                accumulated: buffer.count(),
                target: buffer.target(),
            });
        }

        self.set_state(ScanState::Persisting).await;
        let averaged = match buffer.result() {
            Some(a) => a,
            None => {
                return PointOutcome::Failed(ScanError::Configuration(
                    "averaging buffer empty after completed accumulation".into(),
                ))
            }
        };
        let record = PointRecord::new(sequence, point.row, point.col, channel, &averaged);
        match store.append_point(record) {
            Ok(()) => PointOutcome::Persisted,
            Err(e) => PointOutcome::Failed(e),
        }
    }

    /// Retry `op` on retryable failures up to the plan's retry limit.
    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> ScanResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ScanResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e)
                    if e.is_retryable()
                        && attempt < self.plan.retry_limit
                        && !self.cancel.is_cancelled() =>
                {
                    attempt += 1;
                    warn!(
                        what,
                        attempt,
                        limit = self.plan.retry_limit,
                        error = %e,
                        "retryable failure"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Chunked wait that stays responsive to cancellation. Returns false
    /// if cancelled before the full duration elapsed.
    async fn wait_interruptible(&self, total: Duration) -> bool {
        let chunk = Duration::from_millis(50);
        let deadline = tokio::time::Instant::now() + total;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return true;
            }
            tokio::time::sleep(chunk.min(remaining)).await;
        }
    }

    /// Cancellation path: best-effort homing, then `Aborted`.
    async fn abort(&self, persisted: u64, failed: u64) -> ScanSummary {
        info!("scan aborted, homing best-effort");
        if let Err(e) = self.devices.motion.home().await {
            warn!(error = %e, "failed to home while aborting");
        }
        self.teardown().await;
        self.set_state(ScanState::Aborted).await;
        let summary = ScanSummary {
            outcome: ScanOutcome::Aborted,
            persisted,
            failed,
        };
        self.emit(ScanEvent::Finished {
            outcome: summary.outcome,
            persisted,
            failed,
        });
        summary
    }

    /// Terminal failure path: surface the originating error.
    async fn fail(
        &self,
        error: ScanError,
        persisted: u64,
        failed: u64,
    ) -> ScanResult<ScanSummary> {
        self.teardown().await;
        self.set_state(ScanState::Failed).await;
        self.emit(ScanEvent::Finished {
            outcome: ScanOutcome::Failed,
            persisted,
            failed,
        });
        Err(error)
    }

    /// Best-effort device quiescing on every exit path.
    async fn teardown(&self) {
        if let Err(e) = self.devices.pulser.disable().await {
            warn!(error = %e, "failed to disable pulser");
        }
        if let Some(mux) = &self.devices.mux {
            if let Err(e) = mux.clear().await {
                warn!(error = %e, "failed to clear mux");
            }
        }
    }
}

/// `scan.jsonl` → `scan_3.jsonl` for repeated runs.
fn indexed_path(base: &Path, index: u32) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scan".into());
    let name = match base.extension() {
        Some(ext) => format!("{stem}_{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index}"),
    };
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_path_inserts_the_iteration() {
        assert_eq!(
            indexed_path(Path::new("out/scan.jsonl"), 2),
            PathBuf::from("out/scan_2.jsonl")
        );
        assert_eq!(
            indexed_path(Path::new("scan"), 0),
            PathBuf::from("scan_0")
        );
    }

    #[test]
    fn scan_state_display_labels() {
        assert_eq!(ScanState::Positioning.to_string(), "positioning");
        assert_eq!(ScanState::Failed.to_string(), "failed");
    }
}
