//! Correlation of outbound `req` frames with inbound `res` frames.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

use super::SessionError;
use crate::protocol::ResponseFrame;

type Responder = oneshot::Sender<Result<Value, SessionError>>;

/// Table of calls awaiting a reply.
///
/// Each id resolves at most once: whichever of reply, timeout, or
/// disconnect removes the entry first wins, and anything arriving later for
/// that id is dropped.
#[derive(Debug, Default)]
pub struct RpcCorrelator {
    pending: Mutex<HashMap<String, Responder>>,
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call and get the receiver its outcome will arrive on.
    pub fn register(&self, id: &str) -> oneshot::Receiver<Result<Value, SessionError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.to_string(), tx);
        rx
    }

    /// Deliver a `res` frame. Returns false when no call is waiting for it.
    pub fn resolve(&self, res: ResponseFrame) -> bool {
        let Some(responder) = self.pending.lock().remove(&res.id) else {
            return false;
        };
        let outcome = if res.ok {
            Ok(res.payload())
        } else {
            let (code, message) = match res.error {
                Some(err) => (err.code, err.message),
                None => ("UNAVAILABLE".to_string(), "request failed".to_string()),
            };
            Err(SessionError::Remote { code, message })
        };
        let _ = responder.send(outcome);
        true
    }

    pub fn remove(&self, id: &str) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    /// Fail every pending call; used when the connection drops.
    pub fn reject_all(&self) -> usize {
        let drained: Vec<Responder> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for responder in drained {
            let _ = responder.send(Err(SessionError::ConnectionClosed));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }

    /// Await a registered call, removing it if `timeout` elapses first.
    pub async fn wait(
        &self,
        id: &str,
        method: &str,
        rx: oneshot::Receiver<Result<Value, SessionError>>,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SessionError::ConnectionClosed),
            Err(_) => {
                self.remove(id);
                Err(SessionError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorShape;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_ok() {
        let rpc = RpcCorrelator::new();
        let rx = rpc.register("1");
        assert!(rpc.resolve(ResponseFrame::ok("1", &json!({"v": 1}))));
        let value = rpc
            .wait("1", "m", rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value, json!({"v": 1}));
        assert!(rpc.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_error_carries_message() {
        let rpc = RpcCorrelator::new();
        let rx = rpc.register("1");
        rpc.resolve(ResponseFrame::err(
            "1",
            ErrorShape::invalid_request("bad params"),
        ));
        let err = rpc
            .wait("1", "m", rx, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            SessionError::Remote { code, message } => {
                assert_eq!(code, "INVALID_REQUEST");
                assert_eq!(message, "bad params");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_late_reply_is_noop() {
        let rpc = RpcCorrelator::new();
        let rx = rpc.register("slow");
        let err = rpc
            .wait("slow", "skills.bins", rx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { ref method, .. } if method == "skills.bins"));
        assert!(!rpc.contains("slow"));
        assert!(!rpc.resolve(ResponseFrame::ok("slow", &json!(null))));
    }

    #[tokio::test]
    async fn test_reject_all() {
        let rpc = RpcCorrelator::new();
        let a = rpc.register("a");
        let b = rpc.register("b");
        assert_eq!(rpc.reject_all(), 2);
        assert!(rpc.is_empty());
        for rx in [a, b] {
            let err = rpc
                .wait("x", "m", rx, Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, SessionError::ConnectionClosed));
        }
    }

    #[tokio::test]
    async fn test_out_of_order_resolution() {
        let rpc = RpcCorrelator::new();
        let ids: Vec<String> = (0..5).map(|i| format!("id-{i}")).collect();
        let receivers: Vec<_> = ids.iter().map(|id| rpc.register(id)).collect();
        for (i, id) in ids.iter().enumerate().rev() {
            rpc.resolve(ResponseFrame::ok(id.clone(), &json!(i)));
        }
        for (i, (id, rx)) in ids.iter().zip(receivers).enumerate() {
            let v = rpc.wait(id, "m", rx, Duration::from_secs(1)).await.unwrap();
            assert_eq!(v, json!(i));
        }
    }
}
