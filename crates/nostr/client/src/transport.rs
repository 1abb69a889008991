//! WebSocket transport seam.
//!
//! A [`RelayConnection`](crate::relay::RelayConnection) only needs a sink of
//! outbound frames and a stream of inbound ones. [`WsConnector`] provides them
//! over tokio-tungstenite; tests plug in in-memory channels instead.

use crate::error::{ClientError, Result};
use crate::relay_url::RelayUrl;
use async_trait::async_trait;
use futures::sink::Sink;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

/// Frame written to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutFrame {
    Text(String),
    Ping,
}

/// Frame read from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InFrame {
    Text(String),
    Pong,
}

pub type FrameSink = Pin<Box<dyn Sink<OutFrame, Error = ClientError> + Send>>;
pub type FrameStream = BoxStream<'static, Result<InFrame>>;

/// An established session. The stream ends when the relay closes the socket.
pub struct Session {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens sessions to relays.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &RelayUrl) -> Result<Session>;
}

/// tokio-tungstenite connector (rustls with webpki roots for `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &RelayUrl) -> Result<Session> {
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        let (sink, stream) = ws.split();

        let sink = sink
            .with(|frame: OutFrame| async move {
                Ok::<_, tokio_tungstenite::tungstenite::Error>(match frame {
                    OutFrame::Text(text) => Message::Text(text.into()),
                    OutFrame::Ping => Message::Ping(Default::default()),
                })
            })
            .sink_map_err(|e| ClientError::WebSocket(e.to_string()));

        let host = url.host().to_string();
        let stream = stream
            .filter_map(move |msg| {
                let host = host.clone();
                async move {
                    match msg {
                        Ok(Message::Text(text)) => Some(Ok(InFrame::Text(text.to_string()))),
                        Ok(Message::Pong(_)) => Some(Ok(InFrame::Pong)),
                        Ok(Message::Close(frame)) => {
                            debug!("{} sent close frame: {:?}", host, frame);
                            None
                        }
                        // Pings are answered by tungstenite; binary frames are not Nostr.
                        Ok(_) => None,
                        Err(e) => Some(Err(ClientError::WebSocket(e.to_string()))),
                    }
                }
            })
            .boxed();

        Ok(Session {
            sink: Box::pin(sink),
            stream,
        })
    }
}
