//! Pulse generator drivers.
//!
//! Two units are supported behind the same [`PulseSource`] seam:
//!
//! - [`CompactPulser`] — a free-running square-wave pulser on a serial
//!   port. Fire-and-forget ASCII commands terminated by a carriage
//!   return; the unit sends no acknowledgments. Once its repetition rate
//!   is nonzero it pulses continuously, so the per-capture `arm` hook is
//!   a no-op.
//! - [`BridgedPulser`] — a tone-burst unit whose vendor SDK only exists
//!   as a 32-bit build. All control goes through a [`BridgeSession`]
//!   worker; bridge failures are fatal to the session and are surfaced
//!   unretried.

#[cfg(feature = "serial")]
use crate::serial;
use crate::serial::SharedRawPort;
use async_trait::async_trait;
use bridge::BridgeSession;
use common::capabilities::PulseSource;
use common::{ScanError, ScanResult};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tracing::instrument;

// =============================================================================
// CompactPulser
// =============================================================================

/// Fixed setup commands sent once at open: damping, mode, trigger source,
/// pulse voltage. Values match the unit's bench configuration.
const COMPACT_SETUP: [&str; 4] = ["D0", "M0", "T0", "V300"];

/// Serial square-wave pulser.
pub struct CompactPulser {
    port: SharedRawPort,
    rate_hz: u32,
}

impl CompactPulser {
    /// Open the pulser's port and apply the bench setup, including the
    /// pulse width matched to the transducer's center frequency.
    #[cfg(feature = "serial")]
    pub async fn open(
        port_path: &str,
        baud_rate: u32,
        rate_hz: u32,
        transducer_khz: u32,
    ) -> ScanResult<Self> {
        let port = serial::open_port(port_path, baud_rate, "pulser").await?;
        let pulser = Self::with_port(serial::shared_raw(Box::new(port)), rate_hz);
        pulser.setup(transducer_khz).await?;
        Ok(pulser)
    }

    /// Build a driver over an already-open port (tests use duplex pipes).
    pub fn with_port(port: SharedRawPort, rate_hz: u32) -> Self {
        Self { port, rate_hz }
    }

    /// Apply the bench setup commands and the transducer-matched pulse
    /// width (half the transducer period: 500000/kHz nanoseconds).
    pub async fn setup(&self, transducer_khz: u32) -> ScanResult<()> {
        if transducer_khz == 0 {
            return Err(ScanError::Configuration(
                "transducer frequency must be positive".into(),
            ));
        }
        for cmd in COMPACT_SETUP {
            self.command(cmd).await?;
        }
        let width_ns = 500_000 / transducer_khz;
        self.command(&format!("W{width_ns}")).await
    }

    /// Send one command; the unit does not acknowledge.
    async fn command(&self, cmd: &str) -> ScanResult<()> {
        let mut port = self.port.lock().await;
        port.write_all(format!("{cmd}\r").as_bytes()).await?;
        port.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl PulseSource for CompactPulser {
    #[instrument(skip(self), err)]
    async fn set_rate(&self, hz: u32) -> ScanResult<()> {
        self.command(&format!("P{hz}")).await
    }

    async fn enable(&self) -> ScanResult<()> {
        self.set_rate(self.rate_hz).await
    }

    async fn disable(&self) -> ScanResult<()> {
        self.set_rate(0).await
    }
}

// =============================================================================
// BridgedPulser
// =============================================================================

/// Tone-burst pulser behind the out-of-process bridge.
pub struct BridgedPulser {
    session: BridgeSession,
    rate_hz: u32,
}

impl BridgedPulser {
    /// Wrap a started bridge session and configure the burst.
    ///
    /// The session is expected to have completed its ready handshake; the
    /// worker owns USB port discovery for the unit.
    pub async fn new(
        session: BridgeSession,
        rate_hz: u32,
        burst_khz: u32,
        negative_polarity: bool,
        half_cycles: u32,
    ) -> ScanResult<Self> {
        let pulser = Self { session, rate_hz };
        pulser
            .call(
                "set_burst",
                [
                    ("frequency_khz", Value::from(burst_khz)),
                    ("negative_polarity", Value::from(negative_polarity)),
                ],
            )
            .await?;
        pulser
            .call("set_half_cycles", [("count", Value::from(half_cycles))])
            .await?;
        pulser.call("set_voltage", [("level", Value::from(255))]).await?;
        Ok(pulser)
    }

    async fn call<const N: usize>(
        &self,
        command: &str,
        params: [(&str, Value); N],
    ) -> ScanResult<Value> {
        let mut map = Map::new();
        for (k, v) in params {
            map.insert(k.to_string(), v);
        }
        self.session
            .call(command, map)
            .await
            .map_err(ScanError::Bridge)
    }

    /// Tear down the bridge session, killing the worker.
    pub async fn shutdown(self) {
        self.session.stop().await;
    }
}

#[async_trait]
impl PulseSource for BridgedPulser {
    #[instrument(skip(self), err)]
    async fn set_rate(&self, hz: u32) -> ScanResult<()> {
        self.call("set_prf", [("hz", Value::from(hz))]).await?;
        Ok(())
    }

    async fn enable(&self) -> ScanResult<()> {
        self.set_rate(self.rate_hz).await
    }

    async fn disable(&self) -> ScanResult<()> {
        self.set_rate(0).await
    }

    /// Fire one burst. Issued by the capture unit strictly after the
    /// scope is armed, or the waveform would miss the pulse.
    #[instrument(skip(self), err)]
    async fn arm(&self) -> ScanResult<()> {
        self.call("arm", []).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::shared_raw;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn read_commands(host: &mut tokio::io::DuplexStream, count: usize) -> Vec<String> {
        let mut commands = Vec::new();
        let mut buf = Vec::new();
        while commands.len() < count {
            let mut byte = [0u8; 1];
            host.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\r' {
                commands.push(String::from_utf8_lossy(&buf).to_string());
                buf.clear();
            } else {
                buf.push(byte[0]);
            }
        }
        commands
    }

    #[tokio::test]
    async fn setup_sends_bench_configuration_and_width() {
        let (mut host, device) = tokio::io::duplex(256);
        let pulser = CompactPulser::with_port(shared_raw(Box::new(device)), 500);

        pulser.setup(2250).await.unwrap();

        let commands = read_commands(&mut host, 5).await;
        // 2250 kHz transducer -> 222 ns pulse width.
        assert_eq!(commands, vec!["D0", "M0", "T0", "V300", "W222"]);
    }

    #[tokio::test]
    async fn enable_and_disable_drive_the_repetition_rate() {
        let (mut host, device) = tokio::io::duplex(256);
        let pulser = CompactPulser::with_port(shared_raw(Box::new(device)), 500);

        pulser.enable().await.unwrap();
        pulser.disable().await.unwrap();

        let commands = read_commands(&mut host, 2).await;
        assert_eq!(commands, vec!["P500", "P0"]);
    }

    #[tokio::test]
    async fn compact_arm_is_a_no_op() {
        let (_host, device) = tokio::io::duplex(256);
        let pulser = CompactPulser::with_port(shared_raw(Box::new(device)), 500);
        // Must not write anything or block.
        tokio::time::timeout(Duration::from_millis(50), pulser.arm())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn zero_transducer_frequency_is_rejected() {
        let (_host, device) = tokio::io::duplex(256);
        let pulser = CompactPulser::with_port(shared_raw(Box::new(device)), 500);
        assert!(matches!(
            pulser.setup(0).await,
            Err(ScanError::Configuration(_))
        ));
    }
}
