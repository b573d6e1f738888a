//! Channel multiplexer driver.
//!
//! A relay multiplexer routes the pulser and scope between two
//! transducers, selecting transmission or pulse-echo collection in either
//! direction. The protocol is line-oriented ASCII with a carriage-return
//! terminator: `C` releases every switch, `L0 <module> <switch>` latches
//! one, `U0 <module> <switch>` releases one, and with answerback enabled
//! the unit replies to each command with a numeric status where 0 and 1
//! mean success and anything else is a device error code.
//!
//! Two wiring faults can physically damage the scope front end, so they
//! are guarded here rather than trusted to configuration: a transducer's
//! pulse and receive lines are never latched together, and the route
//! tables are built only from validated switch addresses.

#[cfg(feature = "serial")]
use crate::serial;
use crate::serial::SharedPort;
use async_trait::async_trait;
use common::capabilities::ChannelSelect;
use common::config::{CollectionMode, Direction, MuxConfig, SwitchAddress};
use common::{ScanError, ScanResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::instrument;

/// One selectable routing: the switches latched for a mode/direction.
#[derive(Debug, Clone)]
struct Route {
    latches: Vec<SwitchAddress>,
}

/// Driver for the relay multiplexer.
pub struct Mux {
    port: SharedPort,
    routes: Vec<Route>,
    t0_pulse: SwitchAddress,
    t0_receive: SwitchAddress,
    t1_pulse: SwitchAddress,
    t1_receive: SwitchAddress,
    ack_timeout: Duration,
}

impl Mux {
    /// Open the multiplexer port, enable answerback, and release every
    /// switch.
    #[cfg(feature = "serial")]
    pub async fn open(config: &MuxConfig) -> ScanResult<Self> {
        let port = serial::open_port(&config.port, config.baud_rate, "mux").await?;
        let mux = Self::with_port(serial::shared(Box::new(port)), config)?;
        mux.init().await?;
        Ok(mux)
    }

    /// Build a driver over an already-open port.
    pub fn with_port(port: SharedPort, config: &MuxConfig) -> ScanResult<Self> {
        let routes = config
            .routes
            .iter()
            .map(|spec| {
                let pulse_receive = match (spec.mode, spec.direction) {
                    (CollectionMode::Transmission, Direction::Forward) => {
                        vec![config.t0_pulse, config.t1_receive]
                    }
                    (CollectionMode::Transmission, Direction::Reverse) => {
                        vec![config.t1_pulse, config.t0_receive]
                    }
                    (CollectionMode::Echo, direction) => {
                        let rf = config.rf.ok_or_else(|| {
                            ScanError::Configuration(
                                "echo routes require the rf switch address".into(),
                            )
                        })?;
                        match direction {
                            Direction::Forward => vec![config.t0_pulse, rf],
                            Direction::Reverse => vec![config.t1_pulse, rf],
                        }
                    }
                };
                let mut latches = pulse_receive;
                // The pulser transmit and scope lines are part of every
                // routing.
                latches.push(config.tx);
                latches.push(config.scope);
                Ok(Route { latches })
            })
            .collect::<ScanResult<Vec<_>>>()?;

        Ok(Self {
            port,
            routes,
            t0_pulse: config.t0_pulse,
            t0_receive: config.t0_receive,
            t1_pulse: config.t1_pulse,
            t1_receive: config.t1_receive,
            ack_timeout: Duration::from_secs(2),
        })
    }

    /// Enable answerback so every command is confirmed, then release all
    /// switches to a known state.
    pub async fn init(&self) -> ScanResult<()> {
        self.command("A 1 73").await?;
        self.command("C").await
    }

    /// Send one command and check the unit's numeric status reply.
    async fn command(&self, cmd: &str) -> ScanResult<()> {
        let mut port = self.port.lock().await;

        let writer = port.get_mut();
        writer.write_all(format!("{cmd}\r").as_bytes()).await?;
        writer.flush().await?;

        let mut reply = Vec::new();
        let n = tokio::time::timeout(self.ack_timeout, port.read_until(b'\r', &mut reply))
            .await
            .map_err(|_| ScanError::Device(format!("mux did not answer command '{cmd}'")))??;
        if n == 0 {
            return Err(ScanError::Device("mux link closed".into()));
        }

        let text = String::from_utf8_lossy(&reply);
        let status: i32 = text
            .trim_matches(['\r', '\n', ' '])
            .parse()
            .map_err(|_| ScanError::Device(format!("mux sent malformed status {text:?}")))?;

        if status == 0 || status == 1 {
            Ok(())
        } else {
            Err(ScanError::Device(format!(
                "mux returned error code {status} for command '{cmd}'"
            )))
        }
    }

    /// Latch a set of switches after refusing unsafe combinations: a
    /// transducer's pulse and receive lines latched together would feed
    /// the pulser output straight into the scope input.
    async fn latch_switches(&self, switches: &[SwitchAddress]) -> ScanResult<()> {
        let has = |addr: SwitchAddress| switches.contains(&addr);
        if has(self.t0_pulse) && has(self.t0_receive) {
            self.clear_best_effort().await;
            return Err(ScanError::Device(
                "unsafe switch combination for transducer 0 refused".into(),
            ));
        }
        if has(self.t1_pulse) && has(self.t1_receive) {
            self.clear_best_effort().await;
            return Err(ScanError::Device(
                "unsafe switch combination for transducer 1 refused".into(),
            ));
        }

        for addr in switches {
            self.command(&format!("L0 {} {}", addr.module, addr.switch))
                .await?;
        }
        Ok(())
    }

    async fn clear_best_effort(&self) {
        if let Err(e) = self.command("C").await {
            tracing::warn!(error = %e, "failed to clear mux switches");
        }
    }

    /// Release every switch and close the driver.
    pub async fn shutdown(&self) -> ScanResult<()> {
        self.command("C").await
    }
}

#[async_trait]
impl ChannelSelect for Mux {
    #[instrument(skip(self), err)]
    async fn select(&self, channel: u8) -> ScanResult<()> {
        let route = self
            .routes
            .get(usize::from(channel))
            .ok_or_else(|| {
                ScanError::Device(format!("mux channel {channel} has no configured route"))
            })?
            .clone();

        // Release the previous routing before latching the next one.
        self.command("C").await?;
        self.latch_switches(&route.latches).await
    }

    async fn clear(&self) -> ScanResult<()> {
        self.command("C").await
    }
}
