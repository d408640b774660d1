//! Outstanding calls with single resolution
//!
//! A [`Transaction`] is the pool's record of one request. The caller holds
//! the matching [`TransactionHandle`] and awaits the outcome. Settling is
//! first-wins: a late server reply racing a close cascade, or a timeout
//! racing a reply, can only ever deliver one result.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;
use xapi_types::{ConnectionId, Response, TransactionId, XapiError, XapiResult};

/// Settlement state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Waiting for a reply
    Pending,
    /// Settled with response data
    Resolved,
    /// Settled with an error
    Rejected,
}

struct TransactionState {
    sent_at: Option<Instant>,
    settled_at: Option<Instant>,
    resolution: Resolution,
    sender: Option<oneshot::Sender<XapiResult<Response>>>,
}

/// One outstanding request
pub struct Transaction {
    id: TransactionId,
    command: String,
    request_json: String,
    connection_id: ConnectionId,
    created_at: Instant,
    state: Mutex<TransactionState>,
}

impl Transaction {
    /// Create a pending transaction and the handle its caller awaits
    pub fn new(
        id: TransactionId,
        command: impl Into<String>,
        request_json: String,
        connection_id: ConnectionId,
    ) -> (Arc<Self>, TransactionHandle) {
        let (tx, rx) = oneshot::channel();
        let transaction = Arc::new(Self {
            id: id.clone(),
            command: command.into(),
            request_json,
            connection_id,
            created_at: Instant::now(),
            state: Mutex::new(TransactionState {
                sent_at: None,
                settled_at: None,
                resolution: Resolution::Pending,
                sender: Some(tx),
            }),
        });
        (transaction, TransactionHandle { id, rx })
    }

    /// Transaction id
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Logical command name
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Serialized request frame
    pub fn request_json(&self) -> &str {
        &self.request_json
    }

    /// Connection the transaction is bound to
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Creation time
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since creation, as of `now`
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// When the frame was handed to the socket
    pub fn sent_at(&self) -> Option<Instant> {
        self.state.lock().sent_at
    }

    /// When the transaction was settled
    pub fn settled_at(&self) -> Option<Instant> {
        self.state.lock().settled_at
    }

    /// Stamp the transmit time
    pub fn mark_sent(&self, at: Instant) {
        self.state.lock().sent_at = Some(at);
    }

    /// Current settlement state
    pub fn resolution(&self) -> Resolution {
        self.state.lock().resolution
    }

    /// Whether the transaction has been settled
    pub fn is_settled(&self) -> bool {
        self.resolution() != Resolution::Pending
    }

    /// Settle with response data; returns `false` if already settled
    pub fn resolve(&self, response: Response) -> bool {
        self.settle(Ok(response))
    }

    /// Settle with an error; returns `false` if already settled
    pub fn reject(&self, error: XapiError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: XapiResult<Response>) -> bool {
        let sender = {
            let mut state = self.state.lock();
            let Some(sender) = state.sender.take() else {
                return false;
            };
            state.settled_at = Some(Instant::now());
            state.resolution = if outcome.is_ok() {
                Resolution::Resolved
            } else {
                Resolution::Rejected
            };
            sender
        };
        // The caller may have stopped waiting; the transaction is settled anyway
        let _ = sender.send(outcome);
        true
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("connection_id", &self.connection_id)
            .field("sent_at", &state.sent_at)
            .field("resolution", &state.resolution)
            .finish()
    }
}

/// Caller's side of a transaction
///
/// Awaiting the handle yields the single outcome.
#[derive(Debug)]
pub struct TransactionHandle {
    id: TransactionId,
    rx: oneshot::Receiver<XapiResult<Response>>,
}

impl TransactionHandle {
    /// Transaction id
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Wait for the outcome
    pub async fn wait(self) -> XapiResult<Response> {
        self.await
    }
}

impl Future for TransactionHandle {
    type Output = XapiResult<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(XapiError::ChannelClosed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transaction() -> (Arc<Transaction>, TransactionHandle) {
        Transaction::new(
            TransactionId::from("17"),
            "getVersion",
            r#"{"command":"getVersion","customTag":"getVersion_17"}"#.into(),
            ConnectionId::from("c1"),
        )
    }

    #[tokio::test]
    async fn test_resolve_then_reject() {
        let (tx, handle) = transaction();
        assert_eq!(tx.resolution(), Resolution::Pending);

        assert!(tx.resolve(Response::new(json!({"version": "2.5.0"}))));
        assert!(!tx.reject(XapiError::connection_closed("c1")));
        assert_eq!(tx.resolution(), Resolution::Resolved);

        let response = handle.await.unwrap();
        assert_eq!(response.return_data["version"], "2.5.0");
    }

    #[tokio::test]
    async fn test_reject_then_resolve() {
        let (tx, handle) = transaction();

        assert!(tx.reject(XapiError::connection_closed("c1")));
        assert!(!tx.resolve(Response::new(json!(null))));
        assert!(!tx.reject(XapiError::ConnectionUnavailable));
        assert_eq!(tx.resolution(), Resolution::Rejected);
        assert!(tx.settled_at().is_some());

        let err = handle.wait().await.unwrap_err();
        assert_eq!(err, XapiError::connection_closed("c1"));
    }

    #[tokio::test]
    async fn test_settle_after_caller_gone() {
        let (tx, handle) = transaction();
        drop(handle);
        assert!(tx.resolve(Response::new(json!(1))));
        assert!(tx.is_settled());
    }

    #[tokio::test]
    async fn test_dropped_transaction_closes_handle() {
        let (tx, handle) = transaction();
        assert_eq!(handle.id().as_str(), "17");
        drop(tx);
        assert_eq!(handle.await.unwrap_err(), XapiError::ChannelClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamps() {
        let (tx, _handle) = transaction();
        assert!(tx.sent_at().is_none());

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        let now = Instant::now();
        tx.mark_sent(now);
        assert_eq!(tx.sent_at(), Some(now));
        assert_eq!(tx.age(now), std::time::Duration::from_millis(40));
    }
}
