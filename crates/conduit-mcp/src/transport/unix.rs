//! Unix domain socket transport.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;

use super::{FrameWriter, Lifecycle, Transport, TransportKind};
use crate::dispatcher::ResponseDispatcher;
use crate::error::{McpError, Result};
use crate::protocol::Message;

/// Default bound on connecting to the socket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport over a connected Unix domain socket.
#[derive(Debug)]
pub struct UnixSocketTransport {
    path: PathBuf,
    connect_timeout: Duration,
    dispatcher: Arc<ResponseDispatcher>,
    writer: FrameWriter<OwnedWriteHalf>,
    lifecycle: Lifecycle,
}

impl UnixSocketTransport {
    pub fn new(path: impl Into<PathBuf>, dispatcher: Arc<ResponseDispatcher>) -> Self {
        Self {
            path: path.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dispatcher,
            writer: FrameWriter::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make sure something socket-like exists at the path before dialing.
    async fn check_endpoint(&self) -> Result<()> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(McpError::unavailable(&self.path, "socket not found"));
            }
            Err(e) => return Err(McpError::unavailable(&self.path, e.to_string())),
        };
        if !meta.file_type().is_socket() {
            return Err(McpError::unavailable(&self.path, "not a socket"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn start(&self) -> Result<()> {
        self.check_endpoint().await?;
        self.lifecycle.begin_start()?;

        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.path))
            .await
            .map_err(|_| McpError::timeout(format!("connection to {}", self.path.display())))?
            .map_err(|e| {
                tracing::warn!(path = %self.path.display(), error = %e, "Socket connect failed");
                McpError::Io(e)
            })?;
        let (read_half, write_half) = stream.into_split();

        self.writer.attach(write_half).await;
        self.lifecycle.spawn_reader(
            read_half,
            self.dispatcher.clone(),
            self.path.display().to_string(),
        );
        tracing::info!(path = %self.path.display(), "Connected to MCP server socket");
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        if !self.lifecycle.is_running() {
            return Err(McpError::ConnectionClosed);
        }
        let result = self.writer.write(message).await;
        if let Err(e) = &result {
            if e.is_transport() {
                self.dispatcher.close(&e.to_string());
            }
        }
        result
    }

    async fn stop(&self) -> Result<()> {
        self.writer.close().await;
        self.lifecycle.shutdown().await;
        self.dispatcher.close("transport stopped");
        tracing::debug!(path = %self.path.display(), "Socket transport stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::UnixSocket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageId;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_missing_socket_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            UnixSocketTransport::new(dir.path().join("absent.sock"), ResponseDispatcher::new());
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, McpError::TransportUnavailable { .. }));
        assert!(err.to_string().contains("socket not found"));
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_regular_file_is_unavailable() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let transport = UnixSocketTransport::new(file.path(), ResponseDispatcher::new());
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, McpError::TransportUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_stale_socket_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        // The socket file outlives its listener.
        drop(UnixListener::bind(&path).unwrap());

        let transport = UnixSocketTransport::new(&path, ResponseDispatcher::new());
        let err = transport.start().await.unwrap_err();
        assert!(
            matches!(&err, McpError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused),
            "unexpected error: {err:?}"
        );
        assert!(err.is_transport());
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_echo_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let listener = UnixListener::bind(&path).unwrap();

        // Answers each request with its own params.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Some(line) = lines.next_line().await.unwrap() {
                let request = Message::decode(line.as_bytes()).unwrap();
                let reply = Message::response(request.id, request.params.unwrap_or_default());
                write.write_all(&reply.to_frame().unwrap()).await.unwrap();
            }
        });

        let dispatcher = ResponseDispatcher::new();
        let transport = UnixSocketTransport::new(&path, dispatcher.clone());
        transport.start().await.unwrap();
        assert_eq!(transport.kind(), TransportKind::UnixSocket);

        let pending = dispatcher.register(&MessageId::from("req-1")).unwrap();
        transport
            .send(&Message::request("req-1", "echo", Some(json!({"v": 1}))))
            .await
            .unwrap();
        let reply = pending.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply.result, Some(json!({"v": 1})));

        transport.stop().await.unwrap();
        assert!(!transport.is_running());
        server.await.unwrap();
    }
}
