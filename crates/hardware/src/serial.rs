//! Serial port plumbing shared by the rig's drivers.
//!
//! Every serial-attached device here (gantry, compact pulser, mux) talks
//! a line-oriented ASCII protocol, so ports are type-erased behind
//! `AsyncRead + AsyncWrite` and wrapped in a `BufReader` for delimited
//! reads. Tests substitute `tokio::io::DuplexStream` for real hardware —
//! the drivers cannot tell the difference.
//!
//! Each physical port is exclusively owned by its wrapping driver; the
//! `Arc<Mutex<_>>` exists so a driver can be shared across tasks, not so
//! two drivers can share a port.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::Mutex;

/// Anything usable as an async serial port.
pub trait SerialIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialIO for T {}

/// Type-erased serial port.
pub type DynPort = Box<dyn SerialIO>;

/// Shared, buffered serial port handle for line-oriented protocols.
pub type SharedPort = Arc<Mutex<BufReader<DynPort>>>;

/// Shared serial port without read buffering, for write-only protocols.
pub type SharedRawPort = Arc<Mutex<DynPort>>;

/// Wrap a port for shared, buffered access.
pub fn shared(port: DynPort) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Wrap a port for shared, unbuffered access.
pub fn shared_raw(port: DynPort) -> SharedRawPort {
    Arc::new(Mutex::new(port))
}

/// Open a serial port with 8N1 framing and no flow control.
///
/// Opening is moved onto the blocking pool; enumeration and open can
/// stall for seconds on some USB-serial adapters.
#[cfg(feature = "serial")]
pub async fn open_port(
    path: &str,
    baud_rate: u32,
    device_name: &str,
) -> std::io::Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let path = path.to_string();
    let device_name = device_name.to_string();

    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                std::io::Error::other(format!(
                    "failed to open {device_name} serial port {path}: {e}"
                ))
            })
    })
    .await
    .map_err(|e| std::io::Error::other(format!("serial open task failed: {e}")))?
}

/// Read and discard whatever is sitting in the port's receive buffer.
///
/// Devices chatter at power-up (the gantry firmware prints a banner), and
/// stale bytes from a previous session would corrupt the first
/// command/acknowledgment exchange. Returns the number of bytes dropped.
pub async fn drain_stale<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut dropped = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => dropped += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn shared_port_reads_lines_from_duplex() {
        let (mut host, device) = tokio::io::duplex(64);
        let port = shared(Box::new(device));

        host.write_all(b"ok\n").await.unwrap();

        let mut guard = port.lock().await;
        let mut line = String::new();
        guard.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), "ok");
    }

    #[tokio::test]
    async fn drain_discards_boot_banner() {
        let (mut host, mut device) = tokio::io::duplex(256);
        host.write_all(b"start\necho:Marlin 2.0\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let dropped = drain_stale(&mut device, Duration::from_millis(50)).await;
        assert_eq!(dropped, b"start\necho:Marlin 2.0\n".len());
    }
}
