//! Byte-stream transports carrying newline-delimited JSON-RPC frames.
//!
//! Each transport owns its stream exclusively. Outbound frames go through a
//! single writer gate; one reader task per connection decodes inbound frames
//! and hands them to the [`ResponseDispatcher`]. When the reader stops, for
//! whatever reason, every pending request on that transport is failed.

mod pipe;
#[cfg(unix)]
mod unix;

pub use pipe::{PipeConfig, PipeTransport, is_real_error};
#[cfg(unix)]
pub use unix::UnixSocketTransport;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::ResponseDispatcher;
use crate::error::{McpError, Result};
use crate::protocol::Message;

/// Largest inbound frame accepted, in bytes.
pub const MAX_FRAME_BYTES: usize = 20 * 1024 * 1024;

/// Which binding a transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Child process stdin/stdout.
    Pipe,
    /// Unix domain socket.
    UnixSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe => f.write_str("pipe"),
            Self::UnixSocket => f.write_str("unix"),
        }
    }
}

/// A started-once, stopped-once message stream.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Open the stream and start the reader task.
    async fn start(&self) -> Result<()>;

    /// Write one frame.
    async fn send(&self, message: &Message) -> Result<()>;

    /// Close the stream, stop the reader and fail anything still pending.
    async fn stop(&self) -> Result<()>;

    /// Whether the reader is still running.
    fn is_running(&self) -> bool;

    fn kind(&self) -> TransportKind;
}

/// Serializes writes to the outbound half of a stream.
pub(crate) struct FrameWriter<W> {
    inner: tokio::sync::Mutex<Option<BufWriter<W>>>,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub(crate) fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(None),
        }
    }

    pub(crate) async fn attach(&self, writer: W) {
        *self.inner.lock().await = Some(BufWriter::new(writer));
    }

    /// Encode and write one frame. Encoding happens before taking the gate.
    pub(crate) async fn write(&self, message: &Message) -> Result<()> {
        let frame = message.to_frame()?;
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(McpError::ConnectionClosed)?;

        tracing::trace!(frame = %String::from_utf8_lossy(&frame).trim_end(), "Sending frame");
        writer
            .write_all(&frame)
            .await
            .map_err(|e| McpError::transport(format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::transport(format!("flush failed: {e}")))?;
        Ok(())
    }

    /// Drop the writer, closing our side of the stream.
    pub(crate) async fn close(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl<W> fmt::Debug for FrameWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FrameWriter")
    }
}

/// Start/stop bookkeeping shared by the transports.
pub(crate) struct Lifecycle {
    started: AtomicBool,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Claim the single start. Fails on a second call.
    pub(crate) fn begin_start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(McpError::transport("transport already started"));
        }
        Ok(())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the reader task; `running` flips back to false when it exits.
    pub(crate) fn spawn_reader<R>(
        &self,
        reader: R,
        dispatcher: Arc<ResponseDispatcher>,
        label: String,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let cancel = self.cancel.clone();
        self.spawn(async move {
            read_frames(reader, &dispatcher, cancel, &label).await;
            running.store(false, Ordering::SeqCst);
        });
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(task));
    }

    /// Cancel the background tasks and wait for them to finish.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Transport task ended abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Read frames until EOF, error or cancellation, then fail what is pending.
pub(crate) async fn read_frames<R>(
    reader: R,
    dispatcher: &ResponseDispatcher,
    cancel: CancellationToken,
    label: &str,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

    let reason = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break format!("{label}: transport stopped"),
            next = frames.next() => next,
        };
        match next {
            Some(Ok(line)) => handle_line(&line, dispatcher),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!(transport = label, limit = MAX_FRAME_BYTES, "Frame exceeds size limit");
                break format!("{label}: frame exceeds {MAX_FRAME_BYTES} bytes");
            }
            Some(Err(LinesCodecError::Io(e))) => break format!("{label}: read failed: {e}"),
            None => break format!("{label}: connection closed by peer"),
        }
    };

    let failed = dispatcher.close(&reason);
    tracing::debug!(transport = label, reason = %reason, failed, "Reader stopped");
}

fn handle_line(line: &str, dispatcher: &ResponseDispatcher) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match Message::decode(line.as_bytes()) {
        Ok(message) => {
            tracing::trace!(frame = line, "Received frame");
            dispatcher.dispatch(message);
        }
        // Servers sometimes print banners or logs on stdout; skip them.
        Err(e) => tracing::debug!(error = %e, line, "Skipping non-JSON-RPC line"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageId;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_reader_routes_frames_and_skips_noise() {
        let dispatcher = ResponseDispatcher::new();
        let pending = dispatcher.register(&MessageId::Number(1)).unwrap();
        let (mut server, client) = tokio::io::duplex(1024);

        let reader = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                read_frames(client, &dispatcher, CancellationToken::new(), "test").await;
            })
        };

        server
            .write_all(b"starting up...\n\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\r\n")
            .await
            .unwrap();
        let reply = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.result, Some(json!({"ok": true})));

        // EOF fails whatever is still waiting.
        let pending = dispatcher.register(&MessageId::Number(2)).unwrap();
        drop(server);
        let err = pending.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("closed by peer"));
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_stops_on_cancel() {
        let dispatcher = ResponseDispatcher::new();
        let pending = dispatcher.register(&MessageId::Number(1)).unwrap();
        let (_server, client) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();

        let reader = {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { read_frames(client, &dispatcher, cancel, "test").await })
        };
        cancel.cancel();
        reader.await.unwrap();

        let err = pending.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("transport stopped"));
    }

    #[tokio::test]
    async fn test_writer_frames_and_closes() {
        let (client, mut server) = tokio::io::duplex(1024);
        let writer = FrameWriter::new();
        assert!(matches!(
            writer.write(&Message::notification("x", None)).await,
            Err(McpError::ConnectionClosed)
        ));

        writer.attach(client).await;
        writer
            .write(&Message::request(1i64, "ping", None))
            .await
            .unwrap();
        writer.close().await;

        let mut buf = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n");
    }
}
