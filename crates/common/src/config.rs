//! Configuration surface consumed by the acquisition core.
//!
//! Loading (TOML file + environment) is the CLI's concern; this module
//! owns the deserialized shape and the semantic validation step that runs
//! before any device is opened. Port identity is assumed correct by the
//! time a scan starts — first-run port discovery is an external tool.

use crate::error::{ScanError, ScanResult};
use crate::plan::{AbortPolicy, Axis, ScanPlan};
use crate::waveform::TriggerChannel;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_gantry_baud() -> u32 {
    115_200
}

fn default_serial_baud() -> u32 {
    9600
}

fn default_ack_timeout_s() -> f64 {
    5.0
}

fn default_motion_timeout_s() -> f64 {
    30.0
}

fn default_home_timeout_s() -> f64 {
    60.0
}

/// Serial link to the gantry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GantryConfig {
    pub port: String,
    #[serde(default = "default_gantry_baud")]
    pub baud_rate: u32,
    /// Per-command acknowledgment deadline, in seconds.
    #[serde(default = "default_ack_timeout_s")]
    pub ack_timeout_s: f64,
    /// Motion-complete deadline for a single move, in seconds.
    #[serde(default = "default_motion_timeout_s")]
    pub motion_timeout_s: f64,
    /// Homing deadline, in seconds. Homing sweeps the full travel.
    #[serde(default = "default_home_timeout_s")]
    pub home_timeout_s: f64,
}

/// Which pulse generator is fitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PulserConfig {
    /// Free-running square-wave pulser on a serial port.
    Compact {
        port: String,
        #[serde(default = "default_serial_baud")]
        baud_rate: u32,
        /// Pulse repetition rate while enabled, in Hz.
        rate_hz: u32,
        /// Transducer center frequency, in kHz; sets the pulse width.
        transducer_khz: u32,
    },
    /// Tone-burst unit whose vendor driver only exists as a 32-bit build;
    /// driven through the out-of-process bridge.
    ToneBurst {
        /// Bridge worker program and arguments.
        worker: Vec<String>,
        rate_hz: u32,
        /// Burst frequency in kHz (20..=10_000).
        burst_khz: u32,
        #[serde(default)]
        negative_polarity: bool,
        half_cycles: u32,
    },
}

/// Oscilloscope capture settings, pre-quantization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Data points per waveform.
    pub samples: u32,
    /// Measurement duration, in microseconds.
    pub duration_us: f64,
    /// Delay between trigger and the first sample, in microseconds.
    #[serde(default)]
    pub delay_us: f64,
    /// Requested full-scale vertical range of the measurement channel, in
    /// volts; quantized up to the device ladder.
    pub vertical_range_v: f64,
    pub trigger_channel: TriggerChannel,
    /// Trigger threshold, in millivolts.
    pub trigger_threshold_mv: f64,
}

/// Raster geometry and acquisition policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterConfig {
    pub primary_axis: Axis,
    pub secondary_axis: Axis,
    pub primary_range_mm: f64,
    pub primary_step_mm: f64,
    pub secondary_range_mm: f64,
    pub secondary_step_mm: f64,
    /// Captures to average per point.
    pub averages: u32,
    /// Post-motion settle delay, in seconds.
    pub settle_s: f64,
    /// Single-capture deadline, in seconds.
    pub capture_timeout_s: f64,
    /// Retries per point for retryable faults.
    #[serde(default)]
    pub retry_limit: u32,
    pub abort_policy: AbortPolicy,
}

/// A (module, switch) address on the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchAddress {
    pub module: u8,
    pub switch: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    Transmission,
    Echo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Reverse,
}

/// One routing the scan cycles through; its position in the route list is
/// the mux channel index recorded with each point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub mode: CollectionMode,
    pub direction: Direction,
}

/// Multiplexer wiring and the routes to acquire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    pub port: String,
    #[serde(default = "default_serial_baud")]
    pub baud_rate: u32,
    /// Pulser transmit line.
    pub tx: SwitchAddress,
    /// Scope measurement input.
    pub scope: SwitchAddress,
    /// Receive line for pulse-echo collection, if wired.
    pub rf: Option<SwitchAddress>,
    pub t0_pulse: SwitchAddress,
    pub t0_receive: SwitchAddress,
    pub t1_pulse: SwitchAddress,
    pub t1_receive: SwitchAddress,
    pub routes: Vec<RouteSpec>,
}

/// Repeated-scan settings: re-run the same plan on a minimum interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatConfig {
    pub count: u32,
    /// Minimum seconds between scan starts.
    pub interval_s: f64,
}

/// Top-level configuration for an acquisition run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Store file the scan appends to.
    pub output: PathBuf,
    pub gantry: GantryConfig,
    pub pulser: PulserConfig,
    pub capture: CaptureConfig,
    pub raster: RasterConfig,
    pub mux: Option<MuxConfig>,
    pub repeat: Option<RepeatConfig>,
}

impl ScanConfig {
    /// Semantic validation, run once before any device is opened.
    pub fn validate(&self) -> ScanResult<()> {
        let plan = self.plan();
        plan.validate().map_err(ScanError::Configuration)?;

        if self.capture.samples == 0 {
            return Err(ScanError::Configuration(
                "capture.samples must be at least 1".into(),
            ));
        }
        if self.capture.delay_us < 0.0 {
            return Err(ScanError::Configuration(
                "capture.delay_us must be non-negative".into(),
            ));
        }
        if self.capture.trigger_threshold_mv <= 0.0 {
            return Err(ScanError::Configuration(
                "capture.trigger_threshold_mv must be positive".into(),
            ));
        }

        match &self.pulser {
            PulserConfig::Compact { port, .. } => {
                if port == &self.gantry.port {
                    return Err(ScanError::Configuration(format!(
                        "pulser and gantry cannot share serial port {port}"
                    )));
                }
            }
            PulserConfig::ToneBurst {
                worker,
                burst_khz,
                half_cycles,
                ..
            } => {
                if worker.is_empty() {
                    return Err(ScanError::Configuration(
                        "pulser.worker must name the bridge worker program".into(),
                    ));
                }
                if !(20..=10_000).contains(burst_khz) {
                    return Err(ScanError::Configuration(format!(
                        "pulser.burst_khz must be 20..=10000, got {burst_khz}"
                    )));
                }
                if *half_cycles == 0 {
                    return Err(ScanError::Configuration(
                        "pulser.half_cycles must be at least 1".into(),
                    ));
                }
            }
        }

        if let Some(mux) = &self.mux {
            mux.validate()?;
        }

        if let Some(repeat) = &self.repeat {
            if repeat.count == 0 {
                return Err(ScanError::Configuration(
                    "repeat.count must be at least 1".into(),
                ));
            }
            if repeat.interval_s < 0.0 {
                return Err(ScanError::Configuration(
                    "repeat.interval_s must be non-negative".into(),
                ));
            }
        }

        Ok(())
    }

    /// Build the read-only [`ScanPlan`] this configuration describes.
    pub fn plan(&self) -> ScanPlan {
        let r = &self.raster;
        ScanPlan {
            primary_axis: r.primary_axis,
            secondary_axis: r.secondary_axis,
            primary_range_mm: r.primary_range_mm,
            primary_step_mm: r.primary_step_mm,
            secondary_range_mm: r.secondary_range_mm,
            secondary_step_mm: r.secondary_step_mm,
            averages: r.averages,
            settle: Duration::from_secs_f64(r.settle_s.max(0.0)),
            capture_timeout: Duration::from_secs_f64(r.capture_timeout_s.max(0.0)),
            retry_limit: r.retry_limit,
            abort_policy: r.abort_policy,
            mux_channels: self
                .mux
                .as_ref()
                .map(|m| (0..m.routes.len() as u8).collect()),
        }
    }
}

impl MuxConfig {
    fn validate(&self) -> ScanResult<()> {
        // The pulser transmit and scope inputs must never sit on the same
        // relay module; a single stuck module would connect the pulser
        // straight into the scope front end.
        if self.tx.module == self.scope.module {
            return Err(ScanError::Configuration(format!(
                "mux tx (module {}) and scope (module {}) must be on different modules",
                self.tx.module, self.scope.module
            )));
        }
        if self.routes.is_empty() {
            return Err(ScanError::Configuration(
                "mux.routes must list at least one route".into(),
            ));
        }
        if self
            .routes
            .iter()
            .any(|r| r.mode == CollectionMode::Echo)
            && self.rf.is_none()
        {
            return Err(ScanError::Configuration(
                "echo routes require the rf switch address".into(),
            ));
        }

        let named = [
            self.tx,
            self.scope,
            self.t0_pulse,
            self.t0_receive,
            self.t1_pulse,
            self.t1_receive,
        ];
        for (i, a) in named.iter().enumerate() {
            for b in named.iter().skip(i + 1) {
                if a == b {
                    return Err(ScanError::Configuration(format!(
                        "duplicate mux switch address ({}, {})",
                        a.module, a.switch
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ScanConfig {
        ScanConfig {
            output: PathBuf::from("scan.jsonl"),
            gantry: GantryConfig {
                port: "/dev/ttyUSB0".into(),
                baud_rate: 115_200,
                ack_timeout_s: 5.0,
                motion_timeout_s: 30.0,
                home_timeout_s: 60.0,
            },
            pulser: PulserConfig::Compact {
                port: "/dev/ttyUSB1".into(),
                baud_rate: 9600,
                rate_hz: 500,
                transducer_khz: 2250,
            },
            capture: CaptureConfig {
                samples: 1000,
                duration_us: 2.0,
                delay_us: 15.0,
                vertical_range_v: 0.1,
                trigger_channel: TriggerChannel::A,
                trigger_threshold_mv: 500.0,
            },
            raster: RasterConfig {
                primary_axis: Axis::X,
                secondary_axis: Axis::Z,
                primary_range_mm: 10.0,
                primary_step_mm: 1.0,
                secondary_range_mm: 10.0,
                secondary_step_mm: 1.0,
                averages: 64,
                settle_s: 0.5,
                capture_timeout_s: 2.0,
                retry_limit: 3,
                abort_policy: AbortPolicy::ContinueOnPointFailure,
            },
            mux: None,
            repeat: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        base_config().validate().unwrap();
    }

    #[test]
    fn shared_serial_port_is_rejected() {
        let mut cfg = base_config();
        cfg.pulser = PulserConfig::Compact {
            port: cfg.gantry.port.clone(),
            baud_rate: 9600,
            rate_hz: 500,
            transducer_khz: 2250,
        };
        assert!(matches!(
            cfg.validate(),
            Err(ScanError::Configuration(_))
        ));
    }

    #[test]
    fn tone_burst_range_is_checked() {
        let mut cfg = base_config();
        cfg.pulser = PulserConfig::ToneBurst {
            worker: vec!["toneburst-worker".into()],
            rate_hz: 1000,
            burst_khz: 15_000,
            negative_polarity: false,
            half_cycles: 16,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mux_module_collision_is_rejected() {
        let mut cfg = base_config();
        cfg.mux = Some(MuxConfig {
            port: "/dev/ttyUSB2".into(),
            baud_rate: 9600,
            tx: SwitchAddress { module: 1, switch: 0 },
            scope: SwitchAddress { module: 1, switch: 1 },
            rf: None,
            t0_pulse: SwitchAddress { module: 2, switch: 0 },
            t0_receive: SwitchAddress { module: 2, switch: 1 },
            t1_pulse: SwitchAddress { module: 3, switch: 0 },
            t1_receive: SwitchAddress { module: 3, switch: 1 },
            routes: vec![RouteSpec {
                mode: CollectionMode::Transmission,
                direction: Direction::Forward,
            }],
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn echo_route_requires_rf() {
        let mut cfg = base_config();
        cfg.mux = Some(MuxConfig {
            port: "/dev/ttyUSB2".into(),
            baud_rate: 9600,
            tx: SwitchAddress { module: 1, switch: 0 },
            scope: SwitchAddress { module: 4, switch: 1 },
            rf: None,
            t0_pulse: SwitchAddress { module: 2, switch: 0 },
            t0_receive: SwitchAddress { module: 2, switch: 1 },
            t1_pulse: SwitchAddress { module: 3, switch: 0 },
            t1_receive: SwitchAddress { module: 3, switch: 1 },
            routes: vec![RouteSpec {
                mode: CollectionMode::Echo,
                direction: Direction::Forward,
            }],
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn plan_carries_mux_channels() {
        let mut cfg = base_config();
        cfg.mux = Some(MuxConfig {
            port: "/dev/ttyUSB2".into(),
            baud_rate: 9600,
            tx: SwitchAddress { module: 1, switch: 0 },
            scope: SwitchAddress { module: 4, switch: 1 },
            rf: None,
            t0_pulse: SwitchAddress { module: 2, switch: 0 },
            t0_receive: SwitchAddress { module: 2, switch: 1 },
            t1_pulse: SwitchAddress { module: 3, switch: 0 },
            t1_receive: SwitchAddress { module: 3, switch: 1 },
            routes: vec![
                RouteSpec {
                    mode: CollectionMode::Transmission,
                    direction: Direction::Forward,
                },
                RouteSpec {
                    mode: CollectionMode::Transmission,
                    direction: Direction::Reverse,
                },
            ],
        });
        let plan = cfg.plan();
        assert_eq!(plan.mux_channels, Some(vec![0, 1]));
        assert_eq!(plan.captures_per_point(), 2);
    }

    #[test]
    fn deserializes_from_toml() {
        let toml_src = r#"
            output = "out/scan.jsonl"

            [gantry]
            port = "/dev/ttyUSB0"

            [pulser]
            kind = "compact"
            port = "/dev/ttyUSB1"
            rate_hz = 500
            transducer_khz = 2250

            [capture]
            samples = 500
            duration_us = 1.0
            delay_us = 13.5
            vertical_range_v = 0.1
            trigger_channel = "a"
            trigger_threshold_mv = 500.0

            [raster]
            primary_axis = "X"
            secondary_axis = "Z"
            primary_range_mm = 4.0
            primary_step_mm = 0.1
            secondary_range_mm = 4.0
            secondary_step_mm = 0.1
            averages = 1000
            settle_s = 0.5
            capture_timeout_s = 2.0
            abort_policy = "continue_on_point_failure"
        "#;
        let cfg: ScanConfig = toml::from_str(toml_src).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.gantry.baud_rate, 115_200);
        assert_eq!(cfg.raster.retry_limit, 0);
        assert_eq!(cfg.plan().point_count(), 41 * 41);
    }
}
