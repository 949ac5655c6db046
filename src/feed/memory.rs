use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use super::transport::{FeedConnector, FeedFrame, FeedTransport};
use crate::errors::FeedError;

/// In-process [`FeedConnector`]
///
/// Every successful `connect` hands a [`MemoryConnection`] to the paired
/// [`MemoryBroker`], which plays the upstream side: it reads the control
/// messages the feed sent and pushes frames back. Used by tests and for
/// running the relay without a broker.
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryConnection>,
    fail_next: Arc<AtomicUsize>,
    hang_next: Arc<AtomicUsize>,
}

/// Upstream side of a [`MemoryConnector`]
pub struct MemoryBroker {
    accepted: mpsc::UnboundedReceiver<MemoryConnection>,
    fail_next: Arc<AtomicUsize>,
    hang_next: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryBroker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fail_next = Arc::new(AtomicUsize::new(0));
        let hang_next = Arc::new(AtomicUsize::new(0));

        (
            Self {
                accepted: tx,
                fail_next: Arc::clone(&fail_next),
                hang_next: Arc::clone(&hang_next),
            },
            MemoryBroker {
                accepted: rx,
                fail_next,
                hang_next,
            },
        )
    }
}

impl MemoryBroker {
    /// Wait for the feed's next connection
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.accepted.recv().await
    }

    /// Connection already opened, without waiting
    pub fn try_accept(&mut self) -> Option<MemoryConnection> {
        self.accepted.try_recv().ok()
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Leave the next `n` connection attempts pending forever
    pub fn hang_next_connects(&self, n: usize) {
        self.hang_next.store(n, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl FeedConnector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn FeedTransport>, FeedError> {
        if take_one(&self.fail_next) {
            return Err(FeedError::Connect("connection refused".to_string()));
        }
        if take_one(&self.hang_next) {
            std::future::pending::<()>().await;
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let stall_close = Arc::new(AtomicBool::new(false));

        let connection = MemoryConnection {
            url: url.clone(),
            outbound: outbound_rx,
            inbound: inbound_tx,
            stall_close: Arc::clone(&stall_close),
        };
        self.accepted
            .send(connection)
            .map_err(|_| FeedError::Connect("broker dropped".to_string()))?;

        Ok(Box::new(MemoryTransport {
            outbound: Some(outbound_tx),
            inbound: inbound_rx,
            stall_close,
        }))
    }
}

enum Inbound {
    Frame(FeedFrame),
    Error(String),
}

/// One accepted connection, seen from the broker side
pub struct MemoryConnection {
    pub url: Url,
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<Inbound>,
    stall_close: Arc<AtomicBool>,
}

impl MemoryConnection {
    /// Next control message sent by the feed; `None` once the feed closed
    pub async fn next_sent(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Control message already sent, without waiting
    pub fn try_next_sent(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    pub fn send_binary(&self, frame: impl Into<Bytes>) -> bool {
        self.inbound
            .send(Inbound::Frame(FeedFrame::Binary(frame.into())))
            .is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound
            .send(Inbound::Frame(FeedFrame::Text(text.into())))
            .is_ok()
    }

    /// Inject a protocol error on the feed side
    pub fn send_error(&self, reason: impl Into<String>) -> bool {
        self.inbound.send(Inbound::Error(reason.into())).is_ok()
    }

    /// True once the feed side dropped or closed this connection
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }

    /// Never complete the feed's close handshake on this connection
    pub fn stall_close(&self) {
        self.stall_close.store(true, Ordering::SeqCst);
    }

    /// Close from the broker side (clean close)
    pub fn close(self) {}
}

struct MemoryTransport {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    stall_close: Arc<AtomicBool>,
}

#[async_trait]
impl FeedTransport for MemoryTransport {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| FeedError::Transport("connection closed".to_string()))?;
        outbound
            .send(text)
            .map_err(|_| FeedError::Transport("broker hung up".to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<FeedFrame, FeedError>> {
        match self.inbound.recv().await? {
            Inbound::Frame(frame) => Some(Ok(frame)),
            Inbound::Error(reason) => Some(Err(FeedError::Transport(reason))),
        }
    }

    async fn close(&mut self) {
        if self.stall_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.outbound = None;
        self.inbound.close();
    }
}
