//! G-code gantry driver.
//!
//! The scanner rides on a Marlin-style 3D-printer gantry driven over
//! USB-serial at 115200 baud. Commands are ASCII G-code lines; the
//! firmware answers each accepted command with an `ok` line, possibly
//! preceded by informational chatter (`echo:`, temperature reports) that
//! this driver skips.
//!
//! Every command waits for its acknowledgment with a deadline. Moves are
//! followed by `M400` (finish moves), whose `ok` only arrives once the
//! axes have physically stopped — that acknowledgment is the
//! motion-complete signal the orchestrator sequences on. An unanswered
//! command is treated as link failure and surfaces as
//! [`ScanError::MotionTimeout`].

use crate::serial::{self, SharedPort};
use async_trait::async_trait;
use common::capabilities::Motion;
#[cfg(feature = "serial")]
use common::config::GantryConfig;
use common::plan::Axis;
use common::{ScanError, ScanResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::instrument;

/// Driver for a Marlin/G-code gantry.
pub struct Gantry {
    port: SharedPort,
    ack_timeout: Duration,
    motion_timeout: Duration,
    home_timeout: Duration,
}

impl Gantry {
    /// Open the gantry's serial port, drain its boot banner, and switch
    /// it to millimeter units.
    #[cfg(feature = "serial")]
    pub async fn open(config: &GantryConfig) -> ScanResult<Self> {
        let port = serial::open_port(&config.port, config.baud_rate, "gantry").await?;
        let gantry = Self::with_port(
            serial::shared(Box::new(port)),
            Duration::from_secs_f64(config.ack_timeout_s),
            Duration::from_secs_f64(config.motion_timeout_s),
            Duration::from_secs_f64(config.home_timeout_s),
        );
        gantry.init().await?;
        Ok(gantry)
    }

    /// Build a driver over an already-open port. Used by tests with
    /// `tokio::io::duplex` and by callers that manage ports themselves.
    pub fn with_port(
        port: SharedPort,
        ack_timeout: Duration,
        motion_timeout: Duration,
        home_timeout: Duration,
    ) -> Self {
        Self {
            port,
            ack_timeout,
            motion_timeout,
            home_timeout,
        }
    }

    /// Drain stale bytes and put the firmware in a known unit mode.
    pub async fn init(&self) -> ScanResult<()> {
        {
            let mut guard = self.port.lock().await;
            let dropped = serial::drain_stale(guard.get_mut(), Duration::from_millis(50)).await;
            if dropped > 0 {
                tracing::debug!(dropped, "drained stale gantry output");
            }
        }
        // Millimeter units; every coordinate in the system is mm.
        self.command("G21", self.ack_timeout).await
    }

    /// Send one G-code line and wait for its `ok` acknowledgment.
    async fn command(&self, gcode: &str, timeout: Duration) -> ScanResult<()> {
        let mut port = self.port.lock().await;

        let line = format!("{gcode} \r\n");
        let writer = port.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!(gcode, ?timeout, "gantry did not acknowledge");
                return Err(ScanError::MotionTimeout { waited: timeout });
            }

            let mut response = String::new();
            let n = match tokio::time::timeout(remaining, port.read_line(&mut response)).await {
                Err(_) => {
                    tracing::warn!(gcode, ?timeout, "gantry did not acknowledge");
                    return Err(ScanError::MotionTimeout { waited: timeout });
                }
                Ok(read) => read?,
            };
            if n == 0 {
                return Err(ScanError::Device("gantry link closed".into()));
            }

            let response = response.trim();
            if response == "ok" {
                return Ok(());
            }
            if let Some(message) = response.strip_prefix("Error:") {
                return Err(ScanError::Device(format!("gantry error: {message}")));
            }
            // Firmware chatter between command and ok; ignore it.
            tracing::trace!(gcode, response, "gantry chatter");
        }
    }

    /// Send a positioning command and wait until motion has finished.
    async fn positioned_move(&self, mode: &str, motion: String) -> ScanResult<()> {
        self.command(mode, self.ack_timeout).await?;
        self.command(&motion, self.ack_timeout).await?;
        // ok for M400 arrives only once the axes have stopped.
        self.command("M400", self.motion_timeout).await
    }
}

#[async_trait]
impl Motion for Gantry {
    #[instrument(skip(self), err)]
    async fn move_to(&self, axis: Axis, position_mm: f64) -> ScanResult<()> {
        self.positioned_move("G90", format!("G1 {}{:.3}", axis.letter(), position_mm))
            .await
    }

    #[instrument(skip(self), err)]
    async fn move_rel(&self, axis: Axis, distance_mm: f64) -> ScanResult<()> {
        self.positioned_move("G91", format!("G1 {}{:.3}", axis.letter(), distance_mm))
            .await
    }

    #[instrument(skip(self), err)]
    async fn home(&self) -> ScanResult<()> {
        self.command("G28", self.home_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::shared;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_gantry(device: DuplexStream) -> Gantry {
        Gantry::with_port(
            shared(Box::new(device)),
            Duration::from_millis(200),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
    }

    /// Reads command lines from the host side and answers each with `ok`,
    /// recording what was received.
    async fn ack_all(mut host: DuplexStream, expected_commands: usize) -> Vec<String> {
        let mut received = Vec::new();
        let mut buf = Vec::new();
        while received.len() < expected_commands {
            let mut byte = [0u8; 1];
            if host.read_exact(&mut byte).await.is_err() {
                break;
            }
            if byte[0] == b'\n' {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                buf.clear();
                if line.is_empty() {
                    continue;
                }
                received.push(line);
                host.write_all(b"ok\n").await.unwrap();
            } else {
                buf.push(byte[0]);
            }
        }
        received
    }

    #[tokio::test]
    async fn move_to_issues_absolute_gcode_and_waits_for_completion() {
        let (host, device) = tokio::io::duplex(256);
        let gantry = test_gantry(device);

        let responder = tokio::spawn(ack_all(host, 3));
        gantry.move_to(Axis::X, 2.5).await.unwrap();

        let commands = responder.await.unwrap();
        assert_eq!(commands, vec!["G90", "G1 X2.500", "M400"]);
    }

    #[tokio::test]
    async fn move_rel_uses_relative_mode() {
        let (host, device) = tokio::io::duplex(256);
        let gantry = test_gantry(device);

        let responder = tokio::spawn(ack_all(host, 3));
        gantry.move_rel(Axis::Z, -0.1).await.unwrap();

        let commands = responder.await.unwrap();
        assert_eq!(commands, vec!["G91", "G1 Z-0.100", "M400"]);
    }

    #[tokio::test]
    async fn home_sends_g28() {
        let (host, device) = tokio::io::duplex(256);
        let gantry = test_gantry(device);

        let responder = tokio::spawn(ack_all(host, 1));
        gantry.home().await.unwrap();

        assert_eq!(responder.await.unwrap(), vec!["G28"]);
    }

    #[tokio::test]
    async fn unacknowledged_command_times_out() {
        let (_host, device) = tokio::io::duplex(256);
        let gantry = test_gantry(device);

        let err = gantry.move_to(Axis::Y, 1.0).await.unwrap_err();
        assert!(matches!(err, ScanError::MotionTimeout { .. }));
    }

    #[tokio::test]
    async fn chatter_before_ok_is_skipped() {
        let (mut host, device) = tokio::io::duplex(256);
        let gantry = test_gantry(device);

        let responder = tokio::spawn(async move {
            {
                let mut reader = tokio::io::BufReader::new(&mut host);
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
            }
            host.write_all(b"echo:busy processing\nok\n").await.unwrap();
        });

        gantry.command("G28", Duration::from_millis(200)).await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn firmware_error_is_a_device_error() {
        let (mut host, device) = tokio::io::duplex(256);
        let gantry = test_gantry(device);

        let responder = tokio::spawn(async move {
            {
                let mut reader = tokio::io::BufReader::new(&mut host);
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
            }
            host.write_all(b"Error:Printer halted. kill() called!\n")
                .await
                .unwrap();
        });

        let err = gantry
            .command("G1 X999", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Device(_)));
        responder.await.unwrap();
    }
}
