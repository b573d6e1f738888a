//! Simulated devices.
//!
//! Every driver seam in the rig has a simulated implementation here:
//! orchestrator and integration tests run against these, and the CLI can
//! run a full scan with no hardware attached. Fault injection is explicit
//! (`fail_next_moves`, `fail_captures`) so retry and abort paths are
//! exercised deterministically.

use crate::capture::{ScopeLink, ScopeSettings};
use async_trait::async_trait;
use common::capabilities::{ChannelSelect, Motion, PulseSource};
use common::plan::Axis;
use common::waveform::Waveform;
use common::{ScanError, ScanResult};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// =============================================================================
// SimScope
// =============================================================================

#[derive(Default)]
struct SimScopeState {
    settings: Option<ScopeSettings>,
    armed: bool,
    captures: u32,
}

/// Simulated block-mode oscilloscope.
///
/// Produces a synthetic decaying echo with the configured shape. With
/// `never_trigger` set, or while injected failures remain, an armed
/// capture never completes and the capture unit's deadline fires instead.
pub struct SimScope {
    state: Mutex<SimScopeState>,
    never_trigger: AtomicBool,
    fail_remaining: AtomicU32,
    stops: AtomicU32,
}

impl SimScope {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimScopeState::default()),
            never_trigger: AtomicBool::new(false),
            fail_remaining: AtomicU32::new(0),
            stops: AtomicU32::new(0),
        }
    }

    /// When set, no armed capture ever completes.
    pub fn never_trigger(&self, on: bool) {
        self.never_trigger.store(on, Ordering::SeqCst);
    }

    /// The next `n` capture attempts will not trigger; each timed-out
    /// attempt consumes one when the capture unit halts it.
    pub fn fail_captures(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Settings pushed by the last `apply`.
    pub async fn applied(&self) -> Option<ScopeSettings> {
        self.lock().settings.clone()
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimScopeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn synthesize(settings: &ScopeSettings, capture_index: u32) -> Waveform {
        let n = settings.samples as usize;
        let mut samples = Vec::with_capacity(n);
        // Decaying sine burst starting a tenth of the way in, with a tiny
        // capture-dependent component so repeated captures differ the way
        // real noisy data does.
        let onset = n / 10;
        for i in 0..n {
            let value = if i < onset {
                0.0
            } else {
                let t = (i - onset) as f64;
                let envelope = (-t / (n as f64 / 4.0)).exp();
                let carrier = (t * 0.35).sin();
                let jitter = 0.01 * f64::from(capture_index % 7);
                envelope * carrier * settings.vertical.full_scale_mv() * 0.5 + jitter
            };
            samples.push(value);
        }
        Waveform {
            samples,
            sample_interval_ns: settings.timebase.sample_interval_ns,
            vertical_range_mv: settings.vertical.full_scale_mv(),
            trigger: settings.trigger,
        }
    }
}

impl Default for SimScope {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScopeLink for SimScope {
    async fn apply(&self, settings: &ScopeSettings) -> ScanResult<()> {
        self.lock().settings = Some(settings.clone());
        Ok(())
    }

    async fn arm(&self) -> ScanResult<()> {
        let mut state = self.lock();
        if state.settings.is_none() {
            return Err(ScanError::Configuration("scope armed before apply".into()));
        }
        state.armed = true;
        Ok(())
    }

    async fn poll_ready(&self) -> ScanResult<bool> {
        if self.never_trigger.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if self.fail_remaining.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }
        Ok(self.lock().armed)
    }

    async fn fetch(&self) -> ScanResult<Waveform> {
        let mut state = self.lock();
        if !state.armed {
            return Err(ScanError::Device("fetch without an armed capture".into()));
        }
        state.armed = false;
        state.captures += 1;
        let settings = state
            .settings
            .clone()
            .ok_or_else(|| ScanError::Configuration("scope was never configured".into()))?;
        Ok(Self::synthesize(&settings, state.captures))
    }

    async fn stop(&self) -> ScanResult<()> {
        self.lock().armed = false;
        self.stops.fetch_add(1, Ordering::SeqCst);
        // A halted capture consumes one injected failure.
        let _ = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Ok(())
    }
}

// =============================================================================
// SimPulser
// =============================================================================

/// Simulated pulse generator recording what was asked of it.
pub struct SimPulser {
    enabled: AtomicBool,
    arms: AtomicU32,
    watched_scope: Mutex<Option<std::sync::Arc<SimScope>>>,
    scope_was_armed: AtomicBool,
}

impl SimPulser {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            arms: AtomicU32::new(0),
            watched_scope: Mutex::new(None),
            scope_was_armed: AtomicBool::new(false),
        }
    }

    /// Observe a scope so `arm` can record whether the scope was armed
    /// first (the ordering the capture unit must guarantee).
    pub fn watch_scope(&self, scope: std::sync::Arc<SimScope>) {
        if let Ok(mut guard) = self.watched_scope.lock() {
            *guard = Some(scope);
        }
    }

    pub fn saw_scope_armed(&self) -> bool {
        self.scope_was_armed.load(Ordering::SeqCst)
    }

    pub fn arm_count(&self) -> u32 {
        self.arms.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl Default for SimPulser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PulseSource for SimPulser {
    async fn set_rate(&self, hz: u32) -> ScanResult<()> {
        self.enabled.store(hz > 0, Ordering::SeqCst);
        Ok(())
    }

    async fn enable(&self) -> ScanResult<()> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable(&self) -> ScanResult<()> {
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn arm(&self) -> ScanResult<()> {
        self.arms.fetch_add(1, Ordering::SeqCst);
        if let Ok(guard) = self.watched_scope.lock() {
            if let Some(scope) = guard.as_ref() {
                self.scope_was_armed.store(scope.is_armed(), Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

// =============================================================================
// SimGantry
// =============================================================================

/// Simulated gantry recording every acknowledged move.
pub struct SimGantry {
    moves: Mutex<Vec<(Axis, f64)>>,
    homes: AtomicU32,
    fail_moves_remaining: AtomicU32,
    move_delay: Mutex<Duration>,
}

impl SimGantry {
    pub fn new() -> Self {
        Self {
            moves: Mutex::new(Vec::new()),
            homes: AtomicU32::new(0),
            fail_moves_remaining: AtomicU32::new(0),
            move_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// The next `n` positioning commands fail with `MotionTimeout`.
    pub fn fail_next_moves(&self, n: u32) {
        self.fail_moves_remaining.store(n, Ordering::SeqCst);
    }

    /// Add a per-move delay to exercise cancellation timing.
    pub fn set_move_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.move_delay.lock() {
            *guard = delay;
        }
    }

    pub fn moves(&self) -> Vec<(Axis, f64)> {
        self.moves.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn home_count(&self) -> u32 {
        self.homes.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_moves_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn settle_delay(&self) {
        let delay = self.move_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for SimGantry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Motion for SimGantry {
    async fn move_to(&self, axis: Axis, position_mm: f64) -> ScanResult<()> {
        if self.take_injected_failure() {
            return Err(ScanError::MotionTimeout {
                waited: Duration::from_millis(1),
            });
        }
        self.settle_delay().await;
        if let Ok(mut guard) = self.moves.lock() {
            guard.push((axis, position_mm));
        }
        Ok(())
    }

    async fn move_rel(&self, axis: Axis, distance_mm: f64) -> ScanResult<()> {
        self.move_to(axis, distance_mm).await
    }

    async fn home(&self) -> ScanResult<()> {
        self.homes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// SimMux
// =============================================================================

/// Simulated multiplexer recording route selections.
pub struct SimMux {
    selections: Mutex<Vec<u8>>,
    clears: AtomicU32,
}

impl SimMux {
    pub fn new() -> Self {
        Self {
            selections: Mutex::new(Vec::new()),
            clears: AtomicU32::new(0),
        }
    }

    pub fn selections(&self) -> Vec<u8> {
        self.selections.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn clear_count(&self) -> u32 {
        self.clears.load(Ordering::SeqCst)
    }
}

impl Default for SimMux {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelSelect for SimMux {
    async fn select(&self, channel: u8) -> ScanResult<()> {
        if let Ok(mut guard) = self.selections.lock() {
            guard.push(channel);
        }
        Ok(())
    }

    async fn clear(&self) -> ScanResult<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
