//! Correlates replies with the requests waiting for them.
//!
//! Every outstanding request owns one entry in a map keyed by the canonical
//! id string. The entry is inserted before the request is written and removed
//! exactly once: by the reader loop delivering a reply, or by the waiter
//! giving up (timeout or drop). The map lock is held only for the insert or
//! remove; waiting happens on a oneshot outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};

use crate::error::{McpError, Result};
use crate::protocol::{Message, MessageId, MessageKind};

/// Capacity of the notification broadcast channel.
const NOTIFICATION_CAPACITY: usize = 256;

type Reply = Result<Message>;

#[derive(Default)]
struct State {
    pending: HashMap<String, (u64, oneshot::Sender<Reply>)>,
    next_ticket: u64,
    closed: Option<String>,
}

/// Routes inbound frames to pending requests and notification subscribers.
pub struct ResponseDispatcher {
    state: Mutex<State>,
    notifications: broadcast::Sender<Message>,
}

impl std::fmt::Debug for ResponseDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseDispatcher")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Default for ResponseDispatcher {
    fn default() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            notifications,
        }
    }
}

impl ResponseDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register interest in the reply to `id`. Call this before sending the request.
    ///
    /// Fails if the id is absent, already pending, or the dispatcher was closed.
    pub fn register(self: &Arc<Self>, id: &MessageId) -> Result<PendingResponse> {
        let key = id
            .key()
            .ok_or_else(|| McpError::protocol("cannot wait for a reply to a request without an id"))?;

        let (tx, rx) = oneshot::channel();
        let ticket = {
            let mut state = self.state.lock();
            if let Some(reason) = &state.closed {
                return Err(McpError::transport(reason.clone()));
            }
            if state.pending.contains_key(&key) {
                return Err(McpError::protocol(format!("request id {key} is already pending")));
            }
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            state.pending.insert(key.clone(), (ticket, tx));
            ticket
        };

        Ok(PendingResponse {
            id: id.clone(),
            key,
            ticket,
            rx,
            dispatcher: Arc::downgrade(self),
            settled: false,
        })
    }

    /// Route one inbound message.
    pub fn dispatch(&self, message: Message) {
        match message.kind() {
            MessageKind::Response | MessageKind::Error => {
                let Some(key) = message.id.key() else {
                    tracing::debug!(error = ?message.error, "Dropping reply without id");
                    return;
                };
                let entry = self.state.lock().pending.remove(&key);
                match entry {
                    Some((_, tx)) => {
                        tracing::trace!(id = %key, "Delivering reply");
                        if tx.send(Ok(message)).is_err() {
                            tracing::debug!(id = %key, "Waiter left before the reply arrived");
                        }
                    }
                    None => tracing::debug!(id = %key, "Dropping unmatched reply"),
                }
            }
            MessageKind::Notification => {
                tracing::trace!(method = ?message.method, "Notification received");
                // No subscribers is fine; the notification is dropped.
                let _ = self.notifications.send(message);
            }
            MessageKind::Request => {
                tracing::debug!(method = ?message.method, id = %message.id, "Ignoring server-initiated request");
            }
            MessageKind::Invalid => {
                tracing::debug!("Dropping message with no method, result, error or id");
            }
        }
    }

    /// Remove a pending entry. Returns whether one existed.
    pub fn unregister(&self, id: &MessageId) -> bool {
        match id.key() {
            Some(key) => self.state.lock().pending.remove(&key).is_some(),
            None => false,
        }
    }

    fn unregister_ticket(&self, key: &str, ticket: u64) {
        let mut state = self.state.lock();
        if state.pending.get(key).is_some_and(|(t, _)| *t == ticket) {
            state.pending.remove(key);
        }
    }

    /// Number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Fail every pending request with a transport error. Returns how many were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.state.lock().pending.drain().collect();
        let count = drained.len();
        for (key, (_, tx)) in drained {
            tracing::debug!(id = %key, reason, "Failing pending request");
            let _ = tx.send(Err(McpError::transport(reason.to_string())));
        }
        count
    }

    /// Fail everything pending and refuse new registrations.
    pub fn close(&self, reason: &str) -> usize {
        {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
        }
        self.fail_all(reason)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    /// Receive every notification dispatched from now on.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Message> {
        self.notifications.subscribe()
    }
}

/// A registered wait for one reply.
///
/// Dropping it without receiving removes the entry from the dispatcher.
#[derive(Debug)]
pub struct PendingResponse {
    id: MessageId,
    key: String,
    ticket: u64,
    rx: oneshot::Receiver<Reply>,
    dispatcher: Weak<ResponseDispatcher>,
    settled: bool,
}

impl PendingResponse {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Wait for the reply, giving up after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Message> {
        let outcome = tokio::time::timeout(timeout, self.recv()).await;
        match outcome {
            Ok(reply) => reply,
            Err(_) => Err(McpError::timeout(format!("reply to request {}", self.id))),
        }
    }

    /// Wait without a bound. Callers race this against their own deadline.
    pub(crate) async fn recv(&mut self) -> Result<Message> {
        let reply = (&mut self.rx).await;
        self.settled = true;
        reply.unwrap_or(Err(McpError::ConnectionClosed))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unregister_ticket(&self.key, self.ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(id: impl Into<MessageId>, n: i64) -> Message {
        Message::response(id, json!({"n": n}))
    }

    #[tokio::test]
    async fn test_delivers_matching_reply() {
        let dispatcher = ResponseDispatcher::new();
        let pending = dispatcher.register(&MessageId::Number(1)).unwrap();
        assert_eq!(dispatcher.pending_count(), 1);

        dispatcher.dispatch(reply(1i64, 10));
        let msg = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.result, Some(json!({"n": 10})));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_string_reply_matches_numeric_request() {
        let dispatcher = ResponseDispatcher::new();
        let pending = dispatcher.register(&MessageId::Number(7)).unwrap();
        dispatcher.dispatch(reply("7", 1));
        assert!(pending.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_error_reply_is_delivered() {
        let dispatcher = ResponseDispatcher::new();
        let pending = dispatcher.register(&MessageId::from("a")).unwrap();
        dispatcher.dispatch(Message::error_response("a", -32601, "nope", None));
        let msg = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(msg.into_result(), Err(McpError::ServerError { code: -32601, .. })));
    }

    #[tokio::test]
    async fn test_duplicate_registration_refused() {
        let dispatcher = ResponseDispatcher::new();
        let _first = dispatcher.register(&MessageId::Number(1)).unwrap();
        assert!(matches!(
            dispatcher.register(&MessageId::from("1")),
            Err(McpError::Protocol(_))
        ));
        assert!(dispatcher.register(&MessageId::None).is_err());
    }

    #[tokio::test]
    async fn test_duplicate_and_unmatched_replies_dropped() {
        let dispatcher = ResponseDispatcher::new();
        let pending = dispatcher.register(&MessageId::Number(1)).unwrap();

        dispatcher.dispatch(reply(1i64, 1));
        dispatcher.dispatch(reply(1i64, 2));
        dispatcher.dispatch(reply(99i64, 3));
        dispatcher.dispatch(Message::error_response(MessageId::None, -32700, "parse", None));

        let msg = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.result, Some(json!({"n": 1})));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_unregisters() {
        let dispatcher = ResponseDispatcher::new();
        let pending = dispatcher.register(&MessageId::Number(5)).unwrap();
        let err = pending.wait(Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout(_)));
        assert_eq!(dispatcher.pending_count(), 0);

        // A late reply is dropped quietly and the id can be reused.
        dispatcher.dispatch(reply(5i64, 0));
        assert!(dispatcher.register(&MessageId::Number(5)).is_ok());
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let dispatcher = ResponseDispatcher::new();
        let pending = dispatcher.register(&MessageId::Number(1)).unwrap();
        drop(pending);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_drop_keeps_newer_entry() {
        let dispatcher = ResponseDispatcher::new();
        let old = dispatcher.register(&MessageId::Number(1)).unwrap();
        assert!(dispatcher.unregister(&MessageId::Number(1)));
        let _new = dispatcher.register(&MessageId::Number(1)).unwrap();
        drop(old);
        assert_eq!(dispatcher.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_and_close() {
        let dispatcher = ResponseDispatcher::new();
        let a = dispatcher.register(&MessageId::Number(1)).unwrap();
        let b = dispatcher.register(&MessageId::Number(2)).unwrap();

        assert_eq!(dispatcher.close("server exited"), 2);
        for pending in [a, b] {
            let err = pending.wait(Duration::from_secs(1)).await.unwrap_err();
            assert!(err.is_transport());
            assert!(err.to_string().contains("server exited"));
        }

        assert!(dispatcher.is_closed());
        assert!(matches!(
            dispatcher.register(&MessageId::Number(3)),
            Err(McpError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_notifications_broadcast() {
        let dispatcher = ResponseDispatcher::new();
        // Without subscribers this is a no-op.
        dispatcher.dispatch(Message::notification("notifications/progress", None));

        let mut a = dispatcher.subscribe_notifications();
        let mut b = dispatcher.subscribe_notifications();
        dispatcher.dispatch(Message::notification("notifications/progress", Some(json!({"p": 1}))));

        for rx in [&mut a, &mut b] {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.method.as_deref(), Some("notifications/progress"));
        }
    }

    /// Replies injected at random points relative to registration and wait
    /// must always reach the right waiter.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_premature_delivery_race() {
        use rand::Rng;

        const TRIALS: i64 = 10_000;
        let dispatcher = ResponseDispatcher::new();

        let mut trials = Vec::with_capacity(TRIALS as usize);
        for n in 0..TRIALS {
            let (send_jitter, reply_jitter): (u8, u8) = {
                let mut rng = rand::rng();
                (rng.random_range(0..4), rng.random_range(0..4))
            };
            let dispatcher = dispatcher.clone();
            trials.push(tokio::spawn(async move {
                let id = MessageId::Number(n);
                let pending = dispatcher.register(&id)?;

                // The "server" answers on another task after some jitter.
                let responder = {
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        for _ in 0..reply_jitter {
                            tokio::task::yield_now().await;
                        }
                        dispatcher.dispatch(reply(n, n));
                    })
                };
                for _ in 0..send_jitter {
                    tokio::task::yield_now().await;
                }

                let msg = pending.wait(Duration::from_secs(10)).await?;
                let _ = responder.await;
                Ok::<_, McpError>((n, msg))
            }));
        }

        for trial in trials {
            let (n, msg) = trial.await.unwrap().unwrap();
            assert_eq!(msg.id, MessageId::Number(n));
            assert_eq!(msg.result, Some(json!({"n": n})));
        }
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
