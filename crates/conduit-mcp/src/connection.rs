//! Request/response plumbing over one transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;

use crate::dispatcher::{PendingResponse, ResponseDispatcher};
use crate::error::Result;
use crate::protocol::{Message, MessageId};
use crate::transport::Transport;

/// Issues requests over a transport and waits for their replies.
#[derive(Debug)]
pub struct Connection {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<ResponseDispatcher>,
    next_id: AtomicI64,
}

impl Connection {
    /// The dispatcher must be the one the transport's reader feeds.
    pub fn new(transport: Arc<dyn Transport>, dispatcher: Arc<ResponseDispatcher>) -> Self {
        Self {
            transport,
            dispatcher,
            next_id: AtomicI64::new(1),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Arc<ResponseDispatcher> {
        &self.dispatcher
    }

    fn next_id(&self) -> MessageId {
        MessageId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register for the reply, then write the request.
    ///
    /// Registration comes first so a fast reply can never arrive unclaimed.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingResponse> {
        let id = self.next_id();
        let message = Message::request(id.clone(), method, params);
        let pending = self.dispatcher.register(&id)?;
        tracing::debug!(method, id = %id, "Sending request");
        // On failure `pending` drops here and removes its entry.
        self.transport.send(&message).await?;
        Ok(pending)
    }

    /// Send a request and wait up to `timeout` for its result.
    ///
    /// An error reply becomes [`McpError::ServerError`](crate::McpError::ServerError).
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let pending = self.send_request(method, params).await?;
        pending.wait(timeout).await?.into_result()
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.transport
            .send(&Message::notification(method, params))
            .await
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_running() && !self.dispatcher.is_closed()
    }

    /// Stop the underlying transport.
    pub async fn close(&self) -> Result<()> {
        self.transport.stop().await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::scripted;
    use super::*;
    use crate::McpError;
    use serde_json::json;

    #[tokio::test]
    async fn test_request_round_trip() {
        let (conn, transport) = scripted(|req| {
            vec![Message::response(req.id.clone(), json!({"echo": req.method}))]
        });
        let result = conn
            .request("ping", None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, json!({"echo": "ping"}));

        conn.request("ping", None, Duration::from_secs(1)).await.unwrap();
        let sent = transport.sent.lock();
        assert_eq!(sent[0].id, MessageId::Number(1));
        assert_eq!(sent[1].id, MessageId::Number(2));
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_verbatim() {
        let (conn, _) = scripted(|req| {
            vec![Message::error_response(
                req.id.clone(),
                -32001,
                "quota exceeded",
                Some(json!({"retryAfter": 5})),
            )]
        });
        match conn.request("x", None, Duration::from_secs(1)).await {
            Err(McpError::ServerError {
                code,
                message,
                data,
            }) => {
                assert_eq!(code, -32001);
                assert_eq!(message, "quota exceeded");
                assert_eq!(data, Some(json!({"retryAfter": 5})));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_entry() {
        let (conn, _) = scripted(|_| Vec::new());
        let err = conn
            .request("slow", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout(_)));
        assert_eq!(conn.dispatcher().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_releases_entry() {
        let (conn, transport) = scripted(|_| Vec::new());
        transport.stop().await.unwrap();
        assert!(!conn.is_open());
        let err = conn.request("x", None, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(conn.dispatcher().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_notify_has_no_id() {
        let (conn, transport) = scripted(|_| Vec::new());
        conn.notify("notifications/initialized", None).await.unwrap();
        let sent = transport.sent.lock();
        assert!(sent[0].id.is_none());
        assert_eq!(conn.dispatcher().pending_count(), 0);
    }
}
