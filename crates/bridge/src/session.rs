//! Controller-side bridge session.
//!
//! The vendor driver for the tone-burst pulser only exists as a 32-bit
//! build, so it cannot be loaded into the 64-bit controller process.
//! [`BridgeSession`] hosts it in a dedicated child process instead and
//! exposes its control surface over a line-delimited JSON channel on the
//! child's stdio.
//!
//! The channel enforces one in-flight request at a time: a `call` issued
//! while another is outstanding waits its turn, so the worker always sees
//! a strict request/response alternation and its driver state is never
//! touched by overlapping commands.

use crate::protocol::{self, Hello, Request, Response, Status, SHUTDOWN_COMMAND};
use common::BridgeError;
use serde_json::{Map, Value};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// How a bridge worker is launched and how long to wait on it.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Worker program followed by its arguments.
    pub worker: Vec<String>,
    /// Deadline for the worker's ready handshake after spawn.
    pub ready_timeout: Duration,
    /// Deadline for each request/response exchange.
    pub call_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(worker: Vec<String>) -> Self {
        Self {
            worker,
            ready_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
        }
    }
}

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Channel {
    reader: BoxedReader,
    writer: BoxedWriter,
}

/// The lifetime-scoped handle to the child-process instrument.
///
/// At most one session exists per physical device. The child is always
/// torn down on every exit path: [`BridgeSession::stop`] asks it to exit
/// and then kills it, and dropping an un-stopped session kills it too.
pub struct BridgeSession {
    channel: Mutex<Channel>,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
    call_timeout: Duration,
    /// Set once a timeout or protocol fault desynchronizes the channel;
    /// every later call fails fast instead of reading a stale response.
    failed: AtomicBool,
}

impl std::fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSession")
            .field("call_timeout", &self.call_timeout)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl BridgeSession {
    /// Spawn the worker process and wait for its ready handshake.
    ///
    /// Fails with [`BridgeError::Start`] if the process cannot be spawned
    /// or does not report ready within `config.ready_timeout`.
    pub async fn start(config: BridgeConfig) -> Result<Self, BridgeError> {
        let (program, args) = config
            .worker
            .split_first()
            .ok_or_else(|| BridgeError::Start("empty worker command".into()))?;

        tracing::info!(worker = %program, "starting bridge worker");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Start(format!("failed to spawn '{program}': {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Start("worker stdout not captured".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Start("worker stdin not captured".into()))?;

        let session = Self::attach_inner(
            Box::new(stdout) as Box<dyn AsyncRead + Send + Unpin>,
            Box::new(stdin) as Box<dyn AsyncWrite + Send + Unpin>,
            Some(child),
            config.ready_timeout,
            config.call_timeout,
        )
        .await?;

        tracing::info!("bridge worker ready");
        Ok(session)
    }

    /// Attach to an already-connected transport instead of spawning a
    /// process. This is how tests drive a session against an in-process
    /// worker over `tokio::io::duplex`.
    pub async fn attach<R, W>(
        reader: R,
        writer: W,
        ready_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self, BridgeError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::attach_inner(
            Box::new(reader),
            Box::new(writer),
            None,
            ready_timeout,
            call_timeout,
        )
        .await
    }

    async fn attach_inner(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        child: Option<Child>,
        ready_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let mut reader = BufReader::new(reader);

        let mut line = String::new();
        let read = timeout(ready_timeout, reader.read_line(&mut line)).await;
        match read {
            Err(_) => {
                if let Some(mut child) = child {
                    let _ = child.start_kill();
                }
                return Err(BridgeError::Start(format!(
                    "worker did not report ready within {ready_timeout:?}"
                )));
            }
            Ok(Err(e)) => {
                if let Some(mut child) = child {
                    let _ = child.start_kill();
                }
                return Err(BridgeError::Start(format!("handshake read failed: {e}")));
            }
            Ok(Ok(0)) => {
                if let Some(mut child) = child {
                    let _ = child.start_kill();
                }
                return Err(BridgeError::Start("worker exited before handshake".into()));
            }
            Ok(Ok(_)) => {}
        }

        let hello: Hello = protocol::decode_line(&line)
            .map_err(|e| BridgeError::Start(format!("bad handshake: {e}")))?;
        if !hello.ready {
            return Err(BridgeError::Start("worker reported not ready".into()));
        }
        if hello.version != protocol::PROTOCOL_VERSION {
            return Err(BridgeError::Start(format!(
                "protocol version mismatch: worker speaks {}, controller speaks {}",
                hello.version,
                protocol::PROTOCOL_VERSION
            )));
        }

        Ok(Self {
            channel: Mutex::new(Channel { reader, writer }),
            child: Mutex::new(child),
            next_id: AtomicU64::new(1),
            call_timeout,
            failed: AtomicBool::new(false),
        })
    }

    /// Send one command and block for its response.
    ///
    /// Calls are serialized internally; a call issued while another is in
    /// flight queues behind it and responses can never interleave.
    pub async fn call(&self, command: &str, params: Map<String, Value>) -> Result<Value, BridgeError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(BridgeError::Protocol(
                "bridge session failed earlier; channel is desynchronized".into(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            id,
            command: command.to_string(),
            params,
        };
        let line = protocol::encode_line(&request)?;

        let mut channel = self.channel.lock().await;

        tracing::debug!(id, command, "bridge request");
        channel.writer.write_all(line.as_bytes()).await?;
        channel.writer.write_all(b"\n").await?;
        channel.writer.flush().await?;

        let mut response_line = String::new();
        let read = timeout(self.call_timeout, channel.reader.read_line(&mut response_line)).await;
        drop(channel);

        let n = match read {
            Err(_) => {
                self.failed.store(true, Ordering::Release);
                return Err(BridgeError::Timeout(self.call_timeout));
            }
            Ok(result) => result?,
        };
        if n == 0 {
            self.failed.store(true, Ordering::Release);
            return Err(BridgeError::Protocol("worker closed the channel".into()));
        }

        let response: Response = match protocol::decode_line(&response_line) {
            Ok(r) => r,
            Err(e) => {
                self.failed.store(true, Ordering::Release);
                return Err(e);
            }
        };
        if response.id != id {
            self.failed.store(true, Ordering::Release);
            return Err(BridgeError::Protocol(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }

        match response.status {
            Status::Ok => Ok(response.payload),
            Status::Error => Err(BridgeError::Command {
                command: command.to_string(),
                message: response.error.unwrap_or_else(|| "unspecified error".into()),
            }),
        }
    }

    /// Tear the session down.
    ///
    /// The worker is asked to exit via a best-effort `shutdown` request,
    /// then the child is killed and reaped regardless of whether the
    /// request was answered. This runs on every exit path, including after
    /// failed calls.
    pub async fn stop(self) {
        if !self.failed.load(Ordering::Acquire) {
            let _ = timeout(
                Duration::from_millis(500),
                self.call(SHUTDOWN_COMMAND, Map::new()),
            )
            .await;
        }

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.start_kill();
            match child.wait().await {
                Ok(status) => tracing::info!(%status, "bridge worker stopped"),
                Err(e) => tracing::warn!(error = %e, "failed to reap bridge worker"),
            }
        }
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        // kill_on_drop on the Command covers the spawned case; this makes
        // the teardown explicit even if the session is dropped without
        // stop() having run.
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn write_line<W: AsyncWrite + Unpin>(w: &mut W, line: &str) {
        w.write_all(line.as_bytes()).await.unwrap();
        w.write_all(b"\n").await.unwrap();
        w.flush().await.unwrap();
    }

    #[tokio::test]
    async fn handshake_timeout_is_a_start_error() {
        let (_host_w, session_r) = duplex(256);
        let (session_w, _host_r) = duplex(256);

        let err = BridgeSession::attach(
            session_r,
            session_w,
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BridgeError::Start(_)));
    }

    #[tokio::test]
    async fn malformed_handshake_is_a_start_error() {
        let (mut host_w, session_r) = duplex(256);
        let (session_w, _host_r) = duplex(256);

        write_line(&mut host_w, "not json at all").await;

        let err = BridgeSession::attach(
            session_r,
            session_w,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::Start(_)));
    }

    #[tokio::test]
    async fn call_timeout_poisons_the_session() {
        let (mut host_w, session_r) = duplex(256);
        let (session_w, _host_r) = duplex(256);

        write_line(&mut host_w, &protocol::encode_line(&Hello::ready()).unwrap()).await;

        let session = BridgeSession::attach(
            session_r,
            session_w,
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        let err = session.call("arm", Map::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));

        // The channel is desynchronized now; further calls fail fast.
        let err = session.call("arm", Map::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[tokio::test]
    async fn mismatched_response_id_is_a_protocol_error() {
        let (mut host_w, session_r) = duplex(256);
        let (session_w, mut host_r) = duplex(256);

        write_line(&mut host_w, &protocol::encode_line(&Hello::ready()).unwrap()).await;

        let session = BridgeSession::attach(
            session_r,
            session_w,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let responder = tokio::spawn(async move {
            let mut reader = BufReader::new(&mut host_r);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let req: Request = protocol::decode_line(&line).unwrap();
            let wrong = Response::ok(req.id + 99, Value::Null);
            write_line(&mut host_w, &protocol::encode_line(&wrong).unwrap()).await;
        });

        let err = session.call("status", Map::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
        responder.await.unwrap();
    }
}
