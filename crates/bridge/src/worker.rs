//! Worker-side dispatch loop.
//!
//! A bridge worker is a small program whose whole job is to load a driver
//! the controller process cannot (here: the 32-bit pulser SDK) and relay
//! commands to it. The worker binary links this module, implements
//! [`BridgeHandler`] against the vendor SDK, and calls [`serve`] on its
//! stdio. Tests run the same loop in-process over duplex pipes.

use crate::protocol::{self, Hello, Request, Response, SHUTDOWN_COMMAND};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Command dispatch implemented by the worker against its driver.
#[async_trait]
pub trait BridgeHandler: Send {
    /// Execute one command. `Err` becomes an error-status response; it
    /// does not terminate the serve loop.
    async fn handle(&mut self, command: &str, params: &Map<String, Value>)
        -> Result<Value, String>;
}

/// Run the request/response loop until a `shutdown` command or EOF.
///
/// Writes the ready handshake first, then answers each request line with
/// exactly one response line. Unparseable request lines are answered with
/// an error response (id 0) rather than killing the worker, so a confused
/// controller gets a diagnostic instead of a dead child.
pub async fn serve<R, W, H>(reader: R, writer: W, mut handler: H) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    H: BridgeHandler,
{
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    send_line(&mut writer, &Hello::ready()).await?;

    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            tracing::debug!("controller closed the channel, worker exiting");
            return Ok(());
        }

        let request: Request = match protocol::decode_line(&line) {
            Ok(r) => r,
            Err(e) => {
                send_line(&mut writer, &Response::error(0, e.to_string())).await?;
                continue;
            }
        };

        if request.command == SHUTDOWN_COMMAND {
            send_line(&mut writer, &Response::ok(request.id, Value::Null)).await?;
            tracing::debug!("shutdown requested, worker exiting");
            return Ok(());
        }

        let response = match handler.handle(&request.command, &request.params).await {
            Ok(payload) => Response::ok(request.id, payload),
            Err(message) => Response::error(request.id, message),
        };
        send_line(&mut writer, &response).await?;
    }
}

async fn send_line<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let line = serde_json::to_string(message)?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
