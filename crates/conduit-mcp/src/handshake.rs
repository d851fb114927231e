//! The `initialize` exchange that opens every connection.

use std::time::Duration;

use serde_json::Value;

use crate::connection::Connection;
use crate::error::{McpError, Result};
use crate::protocol::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, encode_params, methods,
};

/// Default bound on the initialize round trip.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for the initialize request.
#[derive(Debug, Clone)]
pub struct Handshake {
    params: InitializeParams,
    timeout: Duration,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            params: InitializeParams::default(),
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_info(mut self, info: ClientInfo) -> Self {
        self.params.client_info = info;
        self
    }

    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.params.capabilities = capabilities;
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.params.protocol_version = version.into();
        self
    }

    pub fn with_server_config(mut self, config: Value) -> Self {
        self.params.server_config = Some(config);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn params(&self) -> &InitializeParams {
        &self.params
    }

    /// Run the exchange and send `notifications/initialized` on success.
    ///
    /// Any failure is reported as [`McpError::HandshakeFailed`] wrapping its
    /// cause; the caller is expected to tear the connection down.
    pub async fn perform(&self, conn: &Connection) -> Result<InitializeResult> {
        let params = encode_params(&self.params)?;
        let value = conn
            .request(methods::INITIALIZE, Some(params), self.timeout)
            .await
            .map_err(McpError::handshake_failed)?;

        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| {
                McpError::handshake_failed(McpError::protocol(format!(
                    "invalid initialize result: {e}"
                )))
            })?;

        let negotiated = result.protocol_version();
        if !negotiated.is_empty() && negotiated != self.params.protocol_version {
            tracing::warn!(
                requested = %self.params.protocol_version,
                negotiated,
                "Server answered with a different protocol version"
            );
        }

        conn.notify(methods::INITIALIZED, None)
            .await
            .map_err(McpError::handshake_failed)?;

        tracing::info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            protocol = negotiated,
            "MCP server initialized"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::scripted;
    use crate::protocol::Message;
    use serde_json::json;

    fn init_reply(req: &Message) -> Vec<Message> {
        if req.method.as_deref() != Some(methods::INITIALIZE) {
            return Vec::new();
        }
        vec![Message::response(
            req.id.clone(),
            json!({
                "serverInfo": {"name": "mock", "version": "1.2.3", "protocolVersion": "2024-11-05"},
                "capabilities": {"providesTools": true}
            }),
        )]
    }

    #[tokio::test]
    async fn test_successful_handshake() {
        let (conn, transport) = scripted(init_reply);
        let result = Handshake::new().perform(&conn).await.unwrap();
        assert_eq!(result.server_info.name, "mock");
        assert!(result.capabilities.has_tools());

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 2);
        let params = sent[0].params.as_ref().unwrap();
        assert_eq!(params["clientInfo"]["name"], "conduit");
        assert_eq!(params["capabilities"]["supportsProgressReporting"], true);
        assert_eq!(sent[1].method.as_deref(), Some(methods::INITIALIZED));
        assert!(sent[1].id.is_none());
    }

    #[tokio::test]
    async fn test_error_reply_fails_handshake() {
        let (conn, transport) = scripted(|req| {
            vec![Message::error_response(req.id.clone(), -32603, "not ready", None)]
        });
        let err = Handshake::new().perform(&conn).await.unwrap_err();
        assert!(matches!(
            err.handshake_cause(),
            Some(McpError::ServerError { message, .. }) if message == "not ready"
        ));
        // No initialized notification after a failure.
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_result_fails_handshake() {
        let (conn, _) = scripted(|req| vec![Message::response(req.id.clone(), json!({"nope": 1}))]);
        let err = Handshake::new().perform(&conn).await.unwrap_err();
        assert!(matches!(
            err.handshake_cause(),
            Some(McpError::Protocol(m)) if m.contains("invalid initialize result")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (conn, _) = scripted(|_| Vec::new());
        let err = Handshake::new()
            .with_timeout(Duration::from_secs(3))
            .perform(&conn)
            .await
            .unwrap_err();
        assert!(matches!(err.handshake_cause(), Some(McpError::Timeout(_))));
    }

    #[test]
    fn test_builder() {
        let hs = Handshake::new()
            .with_protocol_version("2024-05-01")
            .with_client_info(ClientInfo {
                name: "cli".into(),
                version: "9".into(),
            })
            .with_server_config(json!({"verbose": true}));
        assert_eq!(hs.params().protocol_version, "2024-05-01");
        assert_eq!(hs.params().client_info.name, "cli");
        assert!(hs.params().server_config.is_some());
    }
}
