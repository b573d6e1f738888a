//! Trigger/capture unit.
//!
//! Wraps the oscilloscope behind the [`WaveformSource`] seam the
//! orchestrator consumes. The vendor scope SDK itself stays outside this
//! repository; what a backend has to provide is the thin block-mode
//! [`ScopeLink`] contract (apply settings, arm, poll ready, fetch).
//!
//! Two ordering rules live here because getting them wrong corrupts data
//! silently:
//!
//! - The scope is armed strictly *before* the pulser's per-capture arm
//!   hook fires, or the first waveform misses the pulse.
//! - A capture that never sees a trigger returns
//!   [`ScanError::CaptureTimeout`] at its deadline instead of waiting
//!   forever — a mis-wired trigger cable must not hang a scan.

use async_trait::async_trait;
use common::capabilities::{PulseSource, WaveformSource};
use common::config::CaptureConfig;
use common::timebase::{Timebase, VerticalRange};
use common::waveform::{TriggerSpec, Waveform};
use common::{ScanError, ScanResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

/// Effective (post-quantization) acquisition settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeSettings {
    pub timebase: Timebase,
    pub samples: u32,
    /// Post-trigger delay, in whole sample intervals.
    pub delay_samples: u32,
    pub vertical: VerticalRange,
    pub trigger: TriggerSpec,
}

/// Block-mode scope contract a backend implements.
///
/// `arm` starts a single block capture; `poll_ready` is a cheap
/// non-blocking completion check; `fetch` retrieves the captured buffer;
/// `stop` halts an armed capture that will not be fetched (the timeout
/// path) so the device is ready to re-arm.
#[async_trait]
pub trait ScopeLink: Send + Sync {
    async fn apply(&self, settings: &ScopeSettings) -> ScanResult<()>;
    async fn arm(&self) -> ScanResult<()>;
    async fn poll_ready(&self) -> ScanResult<bool>;
    async fn fetch(&self) -> ScanResult<Waveform>;
    async fn stop(&self) -> ScanResult<()>;
}

/// How often an armed capture is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Fixed full-scale range of the trigger channel, in millivolts. The
/// trigger input watches the pulser sync line, whose level does not
/// depend on the measurement range.
const TRIGGER_RANGE_MV: f64 = 1000.0;

/// The trigger/capture unit: one scope plus the active pulser's arm hook.
pub struct CaptureUnit {
    scope: Arc<dyn ScopeLink>,
    pulser: Arc<dyn PulseSource>,
    settings: Mutex<Option<ScopeSettings>>,
}

impl CaptureUnit {
    pub fn new(scope: Arc<dyn ScopeLink>, pulser: Arc<dyn PulseSource>) -> Self {
        Self {
            scope,
            pulser,
            settings: Mutex::new(None),
        }
    }

    /// Quantize the requested settings, push them to the scope, and
    /// return what will actually be in effect. Called once per scan.
    #[instrument(skip(self, config), err)]
    pub async fn configure(&self, config: &CaptureConfig) -> ScanResult<ScopeSettings> {
        let timebase = Timebase::from_duration_samples(config.samples, config.duration_us)?;
        let vertical = VerticalRange::covering(config.vertical_range_v)?;

        if config.trigger_threshold_mv > TRIGGER_RANGE_MV {
            return Err(ScanError::Configuration(format!(
                "trigger threshold {} mV exceeds the {TRIGGER_RANGE_MV} mV trigger-channel range",
                config.trigger_threshold_mv
            )));
        }

        let delay_samples = (config.delay_us * 1000.0 / timebase.sample_interval_ns) as u32;

        let settings = ScopeSettings {
            timebase,
            samples: config.samples,
            delay_samples,
            vertical,
            trigger: TriggerSpec {
                channel: config.trigger_channel,
                threshold_mv: config.trigger_threshold_mv,
            },
        };

        self.scope.apply(&settings).await?;
        tracing::info!(
            timebase = settings.timebase.index,
            interval_ns = settings.timebase.sample_interval_ns,
            samples = settings.samples,
            range_v = settings.vertical.full_scale_v,
            "capture configured"
        );

        *self.settings.lock().await = Some(settings.clone());
        Ok(settings)
    }

    /// The effective settings, if `configure` has run.
    pub async fn settings(&self) -> Option<ScopeSettings> {
        self.settings.lock().await.clone()
    }
}

#[async_trait]
impl WaveformSource for CaptureUnit {
    #[instrument(skip(self), err)]
    async fn capture_one(&self, timeout: Duration) -> ScanResult<Waveform> {
        if self.settings.lock().await.is_none() {
            return Err(ScanError::Configuration(
                "capture_one called before configure".into(),
            ));
        }

        // Scope first, pulser second; the reverse order loses the pulse.
        self.scope.arm().await?;
        self.pulser.arm().await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.scope.poll_ready().await? {
                return self.scope.fetch().await;
            }
            if tokio::time::Instant::now() >= deadline {
                // Halt the armed capture so the device can re-arm cleanly.
                if let Err(e) = self.scope.stop().await {
                    tracing::warn!(error = %e, "failed to stop scope after capture timeout");
                }
                return Err(ScanError::CaptureTimeout { waited: timeout });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimPulser, SimScope};
    use common::waveform::TriggerChannel;

    fn capture_config() -> CaptureConfig {
        CaptureConfig {
            samples: 500,
            duration_us: 1.0,
            delay_us: 13.5,
            vertical_range_v: 0.1,
            trigger_channel: TriggerChannel::A,
            trigger_threshold_mv: 50.0,
        }
    }

    #[tokio::test]
    async fn configure_quantizes_and_applies() {
        let scope = Arc::new(SimScope::new());
        let pulser = Arc::new(SimPulser::new());
        let unit = CaptureUnit::new(scope.clone(), pulser);

        let settings = unit.configure(&capture_config()).await.unwrap();

        // 500 samples over 1 us -> 2 ns interval, timebase 1.
        assert_eq!(settings.timebase.index, 1);
        assert_eq!(settings.timebase.sample_interval_ns, 2.0);
        // 13.5 us delay at 2 ns/sample -> 6750 samples.
        assert_eq!(settings.delay_samples, 6750);
        assert_eq!(settings.vertical.full_scale_v, 0.1);
        assert_eq!(scope.applied().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn threshold_outside_range_is_rejected() {
        let unit = CaptureUnit::new(Arc::new(SimScope::new()), Arc::new(SimPulser::new()));
        let mut cfg = capture_config();
        cfg.trigger_threshold_mv = 1500.0; // Trigger channel is fixed at 1 V.
        assert!(matches!(
            unit.configure(&cfg).await,
            Err(ScanError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn capture_before_configure_is_rejected() {
        let unit = CaptureUnit::new(Arc::new(SimScope::new()), Arc::new(SimPulser::new()));
        assert!(matches!(
            unit.capture_one(Duration::from_millis(10)).await,
            Err(ScanError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn capture_returns_a_waveform_with_effective_shape() {
        let scope = Arc::new(SimScope::new());
        let pulser = Arc::new(SimPulser::new());
        let unit = CaptureUnit::new(scope, pulser.clone());

        unit.configure(&capture_config()).await.unwrap();
        let waveform = unit.capture_one(Duration::from_secs(1)).await.unwrap();

        assert_eq!(waveform.len(), 500);
        assert_eq!(waveform.sample_interval_ns, 2.0);
        // The pulser's per-capture hook fired exactly once.
        assert_eq!(pulser.arm_count(), 1);
    }

    #[tokio::test]
    async fn scope_is_armed_before_the_pulser_fires() {
        let scope = Arc::new(SimScope::new());
        let pulser = Arc::new(SimPulser::new());
        pulser.watch_scope(scope.clone());
        let unit = CaptureUnit::new(scope, pulser.clone());

        unit.configure(&capture_config()).await.unwrap();
        unit.capture_one(Duration::from_secs(1)).await.unwrap();

        // SimPulser::arm asserts the scope was already armed; reaching
        // here without a panic plus a recorded observation is the check.
        assert!(pulser.saw_scope_armed());
    }

    #[tokio::test]
    async fn missing_trigger_times_out_with_bounded_wait() {
        let scope = Arc::new(SimScope::new());
        scope.never_trigger(true);
        let unit = CaptureUnit::new(scope.clone(), Arc::new(SimPulser::new()));

        unit.configure(&capture_config()).await.unwrap();

        let timeout = Duration::from_millis(50);
        let started = tokio::time::Instant::now();
        let err = unit.capture_one(timeout).await.unwrap_err();

        assert!(matches!(err, ScanError::CaptureTimeout { .. }));
        assert!(started.elapsed() >= timeout);
        // The armed capture was halted so the scope can re-arm.
        assert!(scope.stop_count() > 0);
    }
}
