//! Full-duplex JSON-RPC connection over a framed byte stream.
//!
//! A [`Conn`] owns one reader and one writer half of a byte stream. The
//! reader is consumed by [`Conn::run`], which dispatches incoming envelopes:
//! requests go to the installed request handler, notifications to the
//! notification handler, and responses resolve the matching pending call.
//! Writes may come from any task and are serialized by a writer mutex, so
//! [`Conn::call`] is safe to invoke re-entrantly from inside a handler (a
//! permission prompt received from one peer can be forwarded as a call to
//! the other while both read loops keep running).
//!
//! # Cancellation
//!
//! `call` futures are cancel-safe: dropping one (for example via
//! [`tokio::time::timeout`]) removes its pending entry, and a late response
//! with that id is then discarded silently.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::rpc::framing::LineCodec;
use crate::rpc::types::{
    RpcMessage, RpcResponse, ERR_INTERNAL, ERR_METHOD_NOT_FOUND, JSONRPC_VERSION,
};
use crate::{AppError, Result};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = Mutex<HashMap<String, oneshot::Sender<RpcMessage>>>;

/// Future returned by a request handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<RpcResponse>>> + Send>>;
/// Async callback invoked for each incoming request.
pub type RequestHandler = Arc<dyn Fn(RpcMessage) -> HandlerFuture + Send + Sync>;
/// Future returned by a notification handler.
pub type NotifyFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
/// Async callback invoked for each incoming notification.
pub type NotificationHandler = Arc<dyn Fn(RpcMessage) -> NotifyFuture + Send + Sync>;

/// Bidirectional JSON-RPC connection.
pub struct Conn {
    reader: tokio::sync::Mutex<Option<FramedRead<BoxedReader, LineCodec>>>,
    writer: tokio::sync::Mutex<FramedWrite<BoxedWriter, LineCodec>>,
    pending: Arc<PendingMap>,
    next_id: AtomicI64,
    handler: RwLock<Option<RequestHandler>>,
    notification: RwLock<Option<NotificationHandler>>,
}

impl Conn {
    /// Wrap a reader/writer pair in a new connection.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: tokio::sync::Mutex::new(Some(FramedRead::new(
                Box::new(reader) as BoxedReader,
                LineCodec::new(),
            ))),
            writer: tokio::sync::Mutex::new(FramedWrite::new(
                Box::new(writer) as BoxedWriter,
                LineCodec::new(),
            )),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(0),
            handler: RwLock::new(None),
            notification: RwLock::new(None),
        }
    }

    /// Install the request handler. Replaces any previous handler.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(RpcMessage) -> HandlerFuture + Send + Sync + 'static,
    {
        *self
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Install the notification handler. Replaces any previous handler.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(RpcMessage) -> NotifyFuture + Send + Sync + 'static,
    {
        *self
            .notification
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Read and dispatch messages until EOF or an unrecoverable error.
    ///
    /// Returns `Ok(())` on clean EOF. A framing violation or a line that is
    /// not valid JSON terminates the connection with an error; no response is
    /// emitted for the offending bytes. Either way, every call still awaiting
    /// a response fails with a closed-connection error on return.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] / [`AppError::Io`] for stream
    /// failures and [`AppError::Rpc`] for undecodable messages.
    pub async fn run(&self) -> Result<()> {
        let mut framed = self
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| AppError::Rpc("connection is already running".into()))?;

        let result = async {
            while let Some(item) = framed.next().await {
                let line = item?;
                let msg: RpcMessage = serde_json::from_str(&line)
                    .map_err(|err| AppError::Rpc(format!("unmarshal message: {err}")))?;
                self.dispatch(msg).await?;
            }
            Ok(())
        }
        .await;

        self.fail_pending();
        result
    }

    /// Send a request and await the matching response.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`] if params cannot be serialized or the
    /// connection closes before the response arrives, or a write error.
    pub async fn call(&self, method: &str, params: &impl Serialize) -> Result<RpcMessage> {
        let raw = serde_json::value::to_raw_value(params)
            .map_err(|err| AppError::Rpc(format!("marshal params: {err}")))?;
        self.call_raw(method, Some(raw)).await
    }

    /// Send a request with pre-serialized params and await the response.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Conn::call`].
    pub async fn call_raw(
        &self,
        method: &str,
        params: Option<Box<RawValue>>,
    ) -> Result<RpcMessage> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id_raw = RawValue::from_string(id.to_string())
            .map_err(|err| AppError::Rpc(format!("mint request id: {err}")))?;
        let key = id.to_string();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            key,
        };

        let msg = RpcMessage {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id_raw),
            method: method.into(),
            params,
            result: None,
            error: None,
        };
        self.send_json(&msg).await?;

        rx.await.map_err(|_| {
            AppError::Rpc(format!("connection closed before response to {method}"))
        })
    }

    /// Send a notification (no id, no response expected).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`] on serialization failure or a write error.
    pub async fn notify(&self, method: &str, params: &impl Serialize) -> Result<()> {
        let raw = serde_json::value::to_raw_value(params)
            .map_err(|err| AppError::Rpc(format!("marshal params: {err}")))?;
        self.notify_raw(method, Some(raw)).await
    }

    /// Send a notification with pre-serialized params.
    ///
    /// # Errors
    ///
    /// Returns a write error on failure.
    pub async fn notify_raw(&self, method: &str, params: Option<Box<RawValue>>) -> Result<()> {
        let msg = RpcMessage {
            jsonrpc: JSONRPC_VERSION.into(),
            id: None,
            method: method.into(),
            params,
            result: None,
            error: None,
        };
        self.send_json(&msg).await
    }

    /// Send a pre-built response, defaulting the `jsonrpc` field.
    ///
    /// # Errors
    ///
    /// Returns a write error on failure.
    pub async fn send_response(&self, mut resp: RpcResponse) -> Result<()> {
        if resp.jsonrpc.is_empty() {
            resp.jsonrpc = JSONRPC_VERSION.into();
        }
        self.send_json(&resp).await
    }

    /// Send a raw message envelope, defaulting the `jsonrpc` field.
    ///
    /// Used to forward notifications between peers byte-faithfully.
    ///
    /// # Errors
    ///
    /// Returns a write error on failure.
    pub async fn send_message(&self, msg: &RpcMessage) -> Result<()> {
        if msg.jsonrpc.is_empty() {
            let mut msg = msg.clone();
            msg.jsonrpc = JSONRPC_VERSION.into();
            return self.send_json(&msg).await;
        }
        self.send_json(msg).await
    }

    // ── Read-side dispatch ───────────────────────────────────────────────────

    async fn dispatch(&self, msg: RpcMessage) -> Result<()> {
        if !msg.method.is_empty() {
            if !msg.has_id() {
                let handler = self
                    .notification
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(handler) = handler {
                    handler(msg).await;
                }
                return Ok(());
            }
            return self.dispatch_request(msg).await;
        }

        if msg.id.is_some() {
            self.deliver_response(msg);
        }
        Ok(())
    }

    async fn dispatch_request(&self, msg: RpcMessage) -> Result<()> {
        let id = msg.id.clone();
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let resp = match handler {
            None => Some(RpcResponse::error(id, ERR_METHOD_NOT_FOUND, "method not found")),
            Some(handler) => match handler(msg).await {
                Ok(resp) => resp,
                Err(err) => Some(RpcResponse::error(id, ERR_INTERNAL, err.to_string())),
            },
        };

        // A handler may return None when it has already arranged the reply
        // elsewhere; in that case nothing is written here.
        if let Some(resp) = resp {
            self.send_response(resp).await?;
        }
        Ok(())
    }

    fn deliver_response(&self, msg: RpcMessage) {
        let key = msg
            .id
            .as_deref()
            .map(|id| id.get().to_owned())
            .unwrap_or_default();
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        match sender {
            // The receiver may have been dropped by a timed-out caller; the
            // late response is discarded either way.
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => debug!(id = %key, "dropping response with no pending call"),
        }
    }

    fn fail_pending(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    async fn send_json(&self, value: &impl Serialize) -> Result<()> {
        let line = serde_json::to_string(value)
            .map_err(|err| AppError::Rpc(format!("marshal message: {err}")))?;
        let mut writer = self.writer.lock().await;
        writer.send(line).await
    }
}

/// Removes a pending-call entry when the owning `call` future is dropped
/// before a response arrived (timeout or caller cancellation).
struct PendingGuard {
    pending: Arc<PendingMap>,
    key: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
