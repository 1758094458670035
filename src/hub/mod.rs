//! The bidirectional request/response multiplexer.
//!
//! A [`Hub`] turns a single ordered message stream (a [`Transport`]) into
//! a full-duplex RPC fabric: either side may initiate a call, many calls
//! may be outstanding concurrently, and inbound requests dispatch to
//! handlers registered by method name.

pub mod message;
pub mod transport;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;

pub use message::Message;
pub use transport::Transport;

use crate::error::{Error, Result};

/// An inbound request delivered to a handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub tx_id: u32,
    pub payload: Value,
}

type HandlerFn =
    Arc<dyn Fn(ResponseWriter, Request) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct HandlerEntry {
    id: u64,
    f: HandlerFn,
}

type ResponseHandler = Box<dyn FnOnce(Option<Value>, Option<Error>) + Send>;

struct OutstandingRequest {
    #[allow(dead_code)]
    method: String,
    response_handler: ResponseHandler,
}

type HandlerTable = Mutex<HashMap<String, Vec<HandlerEntry>>>;

/// The request/response multiplexer built on a single [`Transport`].
///
/// Invariants (see `SPEC_FULL.md` §3): the transport is never written to
/// concurrently with itself (enforced inside the transport adapter
/// itself, H1); a `tx_id` in the outstanding-request table has exactly
/// one response handler (H2); unregistering a handler removes exactly
/// the handler registered by that call (H3).
pub struct Hub {
    pub id: String,
    transport: Arc<dyn Transport>,
    handlers: Arc<HandlerTable>,
    outstanding: Mutex<HashMap<u32, OutstandingRequest>>,
    next_tx: AtomicU32,
    next_handler_id: AtomicU64,
}

/// A capability returned by [`Hub::handle`]; removes exactly the
/// registered handler. Idempotent — calling `unregister` any number of
/// times after the first has no further effect.
pub struct Unregister {
    handlers: Arc<HandlerTable>,
    method: String,
    id: u64,
}

impl Unregister {
    pub fn unregister(&self) {
        let mut table = self.handlers.lock().unwrap();
        if let Some(entries) = table.get_mut(&self.method) {
            entries.retain(|e| e.id != self.id);
            if entries.is_empty() {
                table.remove(&self.method);
            }
        }
    }
}

impl Hub {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            transport,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            outstanding: Mutex::new(HashMap::new()),
            next_tx: AtomicU32::new(0),
            next_handler_id: AtomicU64::new(0),
        })
    }

    // ── Send path ──────────────────────────────────────────────────────

    /// Sends a request; `response_handler` is invoked later, from
    /// `process_message`, with `(payload, error)`.
    pub async fn request<F>(&self, method: &str, payload: Value, response_handler: F) -> Result<()>
    where
        F: FnOnce(Option<Value>, Option<Error>) + Send + 'static,
    {
        let tx_id = self.next_tx.fetch_add(1, Ordering::SeqCst);

        {
            let mut outstanding = self.outstanding.lock().unwrap();
            outstanding.insert(
                tx_id,
                OutstandingRequest {
                    method: method.to_string(),
                    response_handler: Box::new(response_handler),
                },
            );
        }

        self.transport
            .send(&Message::request(method, tx_id, payload))
            .await
    }

    pub async fn request_without_response(&self, method: &str, payload: Value) -> Result<()> {
        self.request(method, payload, |_, _| {}).await
    }

    /// Sends a request and suspends the calling task until the matching
    /// response (or a transport-closed error from `shut_down`) arrives.
    pub async fn request_sync(&self, method: &str, payload: Value) -> Result<Value> {
        let (tx, rx) = tokio::sync::oneshot::channel::<(Option<Value>, Option<Error>)>();
        self.request(method, payload, move |payload, error| {
            let _ = tx.send((payload, error));
        })
        .await?;

        match rx.await {
            Ok((_, Some(err))) => Err(err),
            Ok((payload, None)) => Ok(payload.unwrap_or(Value::Null)),
            Err(_) => Err(Error::Transport(
                "hub closed before a response arrived".into(),
            )),
        }
    }

    /// Registers `f` for `method`; handlers for one method run in
    /// registration order for a single incoming request.
    pub fn handle<F, Fut>(&self, method: &str, f: F) -> Unregister
    where
        F: Fn(ResponseWriter, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        let f: HandlerFn = Arc::new(move |w, r| Box::pin(f(w, r)));

        {
            let mut table = self.handlers.lock().unwrap();
            table
                .entry(method.to_string())
                .or_default()
                .push(HandlerEntry { id, f });
        }

        Unregister {
            handlers: Arc::clone(&self.handlers),
            method: method.to_string(),
            id,
        }
    }

    // ── Receive path ───────────────────────────────────────────────────

    /// Parses and dispatches one inbound frame. Rejects envelopes that
    /// are not exactly one of {request, response} with a protocol error;
    /// the caller (the transport's read loop) should terminate the
    /// connection on this error. An unknown method on a request is
    /// *not* a connection-ending error: it is surfaced as an error
    /// response to the sender and `process_message` returns `Ok(())`.
    pub async fn process_message(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        let msg: Message = serde_json::from_slice(bytes)?;

        match (msg.itx, msg.otx) {
            (Some(_), Some(_)) => Err(Error::Protocol(
                "message carries both itx and otx".to_string(),
            )),
            (None, None) => Err(Error::Protocol(
                "message carries neither itx nor otx".to_string(),
            )),
            (Some(itx), None) => {
                let Some(method) = msg.method else {
                    return Err(Error::Protocol(
                        "itx present without method".to_string(),
                    ));
                };
                self.dispatch_request(itx, method, msg.payload.unwrap_or(Value::Null))
                    .await;
                Ok(())
            }
            (None, Some(otx)) => {
                self.dispatch_response(otx, msg.payload, msg.error);
                Ok(())
            }
        }
    }

    async fn dispatch_request(self: &Arc<Self>, tx_id: u32, method: String, payload: Value) {
        let entries: Option<Vec<HandlerFn>> = {
            let table = self.handlers.lock().unwrap();
            table
                .get(&method)
                .map(|entries| entries.iter().map(|e| Arc::clone(&e.f)).collect())
        };

        let writer = ResponseWriter {
            transport: Arc::clone(&self.transport),
            tx_id,
            written: Arc::new(AtomicBool::new(false)),
        };

        let Some(handlers) = entries else {
            writer
                .write_error(format!("handler does not exist for method \"{method}\""))
                .await;
            return;
        };

        let request = Request {
            method,
            tx_id,
            payload,
        };

        tokio::spawn(async move {
            for handler in handlers {
                if let Err(err) = handler(writer.clone(), request.clone()).await {
                    writer.write_error(err.to_string()).await;
                    return;
                }
            }
            writer.write_null_if_unwritten().await;
        });
    }

    fn dispatch_response(&self, tx_id: u32, payload: Option<Value>, error: Option<String>) {
        let entry = {
            let mut outstanding = self.outstanding.lock().unwrap();
            outstanding.remove(&tx_id)
        };

        if let Some(entry) = entry {
            tokio::spawn(async move {
                let error = error.map(Error::Application);
                (entry.response_handler)(payload, error);
            });
        }
    }

    /// Wakes every outstanding request (and, transitively, every
    /// `request_sync` waiter) with a transport-closed error. Invoked by
    /// the hub's owner once its transport is known to be dead; this is
    /// the only cancellation path in the core (no per-request timeout).
    pub fn shut_down(&self, reason: &str) {
        let entries: Vec<OutstandingRequest> = {
            let mut outstanding = self.outstanding.lock().unwrap();
            outstanding.drain().map(|(_, v)| v).collect()
        };

        for entry in entries {
            let error = Error::Transport(reason.to_string());
            (entry.response_handler)(None, Some(error));
        }
    }
}

/// Single-shot writer bound to one incoming request's `tx_id`. The first
/// write (success or error) is the one that is sent; all later writes
/// are rejected without touching the transport.
#[derive(Clone)]
pub struct ResponseWriter {
    transport: Arc<dyn Transport>,
    tx_id: u32,
    written: Arc<AtomicBool>,
}

impl ResponseWriter {
    pub async fn write(&self, payload: Value) -> Result<()> {
        if self.written.swap(true, Ordering::SeqCst) {
            return Err(Error::Protocol("response already sent".to_string()));
        }
        self.transport.send(&Message::response(self.tx_id, payload)).await
    }

    async fn write_error(&self, error: impl Into<String>) {
        if self.written.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .transport
            .send(&Message::error_response(self.tx_id, error.into()))
            .await;
    }

    async fn write_null_if_unwritten(&self) {
        if self.written.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .transport
            .send(&Message::response(self.tx_id, Value::Null))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingTransport {
        sent: Mutex<Vec<Message>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, message: &Message) -> Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn unknown_method_yields_error_response_not_teardown() {
        let transport = RecordingTransport::new();
        let hub = Hub::new(transport.clone());

        let bytes = serde_json::to_vec(&Message::request("nope", 7, Value::Null)).unwrap();
        hub.process_message(&bytes).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].otx, Some(7));
        assert!(sent[0].error.as_ref().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn malformed_envelopes_are_rejected() {
        let transport = RecordingTransport::new();
        let hub = Hub::new(transport);

        let both = serde_json::to_vec(&Message {
            itx: Some(1),
            otx: Some(2),
            ..Default::default()
        })
        .unwrap();
        assert!(hub.process_message(&both).await.is_err());

        let neither = serde_json::to_vec(&Message::default()).unwrap();
        assert!(hub.process_message(&neither).await.is_err());

        let itx_no_method = serde_json::to_vec(&Message {
            itx: Some(1),
            ..Default::default()
        })
        .unwrap();
        assert!(hub.process_message(&itx_no_method).await.is_err());
    }

    #[tokio::test]
    async fn handler_runs_and_response_is_routed_back() {
        let transport = RecordingTransport::new();
        let hub = Hub::new(transport.clone());

        hub.handle("echo", |w, r| async move {
            w.write(r.payload).await
        });

        let bytes = serde_json::to_vec(&Message::request(
            "echo",
            3,
            serde_json::json!({"hello": "world"}),
        ))
        .unwrap();
        hub.process_message(&bytes).await.unwrap();

        // handler dispatch is spawned; yield so it can run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].otx, Some(3));
        assert_eq!(sent[0].payload, Some(serde_json::json!({"hello": "world"})));
    }

    #[tokio::test]
    async fn unregister_removes_only_its_own_handler() {
        let transport = RecordingTransport::new();
        let hub = Hub::new(transport);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_a = Arc::clone(&calls);
        let calls_b = Arc::clone(&calls);

        let unregister_a = hub.handle("m", move |w, _r| {
            let calls_a = Arc::clone(&calls_a);
            async move {
                calls_a.fetch_add(1, Ordering::SeqCst);
                w.write(Value::Null).await
            }
        });
        hub.handle("m", move |w, _r| {
            let calls_b = Arc::clone(&calls_b);
            async move {
                calls_b.fetch_add(1, Ordering::SeqCst);
                // first handler already wrote the response; this write fails
                // but the chain should not error the whole dispatch loudly.
                let _ = w.write(Value::Null).await;
                Ok(())
            }
        });

        unregister_a.unregister();
        unregister_a.unregister(); // idempotent

        let bytes = serde_json::to_vec(&Message::request("m", 1, Value::Null)).unwrap();
        hub.process_message(&bytes).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shut_down_wakes_request_sync_with_transport_error() {
        let transport = RecordingTransport::new();
        let hub = Hub::new(transport);

        let hub2 = Arc::clone(&hub);
        let waiter = tokio::spawn(async move { hub2.request_sync("x", Value::Null).await });

        tokio::task::yield_now().await;
        hub.shut_down("socket closed");

        let result = waiter.await.unwrap();
        assert!(result.is_err());
    }
}
