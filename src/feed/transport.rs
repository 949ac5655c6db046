use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::errors::FeedError;

/// Inbound payload from the upstream feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFrame {
    /// Binary tick frame
    Binary(Bytes),
    /// Text frame (acks, error notices)
    Text(String),
}

/// One open upstream connection
///
/// `next_frame` returns `None` once the peer has closed the connection.
#[async_trait]
pub trait FeedTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError>;

    async fn next_frame(&mut self) -> Option<Result<FeedFrame, FeedError>>;

    async fn close(&mut self);
}

/// Opens upstream connections
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn FeedTransport>, FeedError>;
}

/// Production connector over tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FeedConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn FeedTransport>, FeedError> {
        let (stream, response) = connect_async(url.as_str()).await.map_err(|e| {
            if let tokio_tungstenite::tungstenite::Error::Http(response) = &e {
                FeedError::Connect(format!("HTTP {}", response.status()))
            } else {
                FeedError::Connect(e.to_string())
            }
        })?;

        info!("Upstream handshake complete (status {})", response.status());
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<FeedFrame, FeedError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(FeedFrame::Binary(Bytes::from(data)))),
                Ok(Message::Text(text)) => return Some(Ok(FeedFrame::Text(text))),
                Ok(Message::Ping(data)) => {
                    debug!("Upstream ping, sending pong");
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        return Some(Err(FeedError::Transport(e.to_string())));
                    }
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Close(frame)) => {
                    debug!("Upstream close frame: {:?}", frame);
                    return None;
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(FeedError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Upstream close returned: {}", e);
        }
    }
}
