//! [`Connector`] over `tokio-tungstenite`.
//!
//! Each connection is split into a writer task draining the link's outbound
//! queue and a reader task forwarding frames. The reader always finishes by
//! delivering exactly one [`LinkEvent::Closed`].

use assess_core::TransportError;
use assess_core::protocol::{ABNORMAL_CLOSURE, NO_STATUS_RECEIVED};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::config::ChannelConfig;
use crate::transport::{Connector, Frame, Link, LinkEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials `ws://` / `wss://` endpoints.
#[derive(Clone, Debug)]
pub struct WsConnector {
    buffer: usize,
}

impl WsConnector {
    /// Connector whose links buffer up to `buffer` frames each way.
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

impl From<&ChannelConfig> for WsConnector {
    fn from(config: &ChannelConfig) -> Self {
        Self::new(config.outbound_buffer)
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::from(&ChannelConfig::default())
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_owned(),
                message: e.to_string(),
            })?;
        debug!(url, "websocket open");

        let (link, peer) = Link::channel(self.buffer);
        let (sink, stream) = ws.split();
        drop(tokio::spawn(write_loop(sink, peer.outbound)));
        drop(tokio::spawn(read_loop(stream, peer.inbound)));
        Ok(link)
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut frames: mpsc::Receiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        match frame {
            Frame::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %e, "websocket write failed");
                    return;
                }
            }
            Frame::Close { code, reason } => {
                let close = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(close))).await {
                    debug!(error = %e, "websocket close failed");
                }
                return;
            }
        }
    }
    // Link released without an explicit close.
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<WsStream>, events: mpsc::Sender<LinkEvent>) {
    let mut close: Option<(u16, String)> = None;

    while let Some(item) = stream.next().await {
        let text = match item {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!(len = bytes.len(), "non-UTF-8 binary frame dropped");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                close = Some(frame.map_or((NO_STATUS_RECEIVED, String::new()), |f| {
                    (u16::from(f.code), f.reason.as_str().to_owned())
                }));
                // Keep reading so the close handshake completes.
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                if close.is_none() {
                    debug!(error = %e, "websocket read failed");
                }
                break;
            }
        };
        if events.send(LinkEvent::Text(text)).await.is_err() {
            return;
        }
    }

    let (code, reason) = close.unwrap_or((ABNORMAL_CLOSURE, String::new()));
    let _ = events.send(LinkEvent::Closed { code, reason }).await;
}
