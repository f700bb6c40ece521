//! Transport seam between the protocol drivers and the WebSocket carrier.
//!
//! Listener and dialer wiring live with the host; sessions and the client
//! only need an object-safe handle that can report liveness and queued
//! bytes, send text/binary messages, and close with an optional code.
//! [`WsTransport`] implements the seam over a tokio-tungstenite sink with a
//! writer task; the queued-byte counter is the protocol's `bufferedAmount`
//! analog and drives backpressure decisions.

use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};

use crate::error::{Error, Result};

/// WebSocket close code for protocol violations.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Handle to one peer connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the connection is still open for sending.
    fn is_open(&self) -> bool;

    /// Bytes accepted for sending but not yet handed to the socket.
    fn buffered_amount(&self) -> usize;

    /// Queues a text message.
    async fn send_text(&self, text: String) -> Result<()>;

    /// Queues a binary message.
    async fn send_binary(&self, data: Vec<u8>) -> Result<()>;

    /// Closes the connection, optionally with a close code and reason.
    async fn close(&self, code: Option<u16>, reason: &str) -> Result<()>;
}

/// [`Transport`] over a tokio-tungstenite message sink.
///
/// Outbound messages flow through an unbounded channel into a writer task;
/// the channel depth in bytes is exposed as [`buffered_amount`]. The read
/// half of the socket stays with the caller, which reports closure via
/// [`mark_closed`].
///
/// [`buffered_amount`]: Transport::buffered_amount
/// [`mark_closed`]: WsTransport::mark_closed
pub struct WsTransport {
    tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    buffered: Arc<AtomicUsize>,
}

impl WsTransport {
    /// Spawns the writer task over `sink` and returns the handle.
    ///
    /// Must be called within a tokio runtime.
    pub fn new<S>(mut sink: S) -> Self
    where
        S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let open = Arc::new(AtomicBool::new(true));
        let buffered = Arc::new(AtomicUsize::new(0));

        let task_open = Arc::clone(&open);
        let task_buffered = Arc::clone(&buffered);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let len = message.len();
                let closing = matches!(message, Message::Close(_));
                let result = sink.send(message).await;
                task_buffered.fetch_sub(len, Ordering::AcqRel);
                if closing || result.is_err() {
                    break;
                }
            }
            task_open.store(false, Ordering::Release);
            let _ = sink.close().await;
        });

        Self { tx, open, buffered }
    }

    /// Marks the transport closed, e.g. when the read half saw EOF.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn enqueue(&self, message: Message) -> Result<()> {
        if !self.is_open() {
            return Err(Error::failed_precondition("transport is closed"));
        }
        self.buffered.fetch_add(message.len(), Ordering::AcqRel);
        self.tx.send(message).map_err(|e| {
            self.mark_closed();
            Error::unavailable(format!("writer task gone: {e}"))
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.enqueue(Message::Text(text))
    }

    async fn send_binary(&self, data: Vec<u8>) -> Result<()> {
        self.enqueue(Message::Binary(data))
    }

    async fn close(&self, code: Option<u16>, reason: &str) -> Result<()> {
        let frame = code.map(|code| CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        });
        let result = self.enqueue(Message::Close(frame));
        self.mark_closed();
        result
    }
}
