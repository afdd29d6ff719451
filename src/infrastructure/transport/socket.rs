//! WebSocket signaling socket
//!
//! Thin connector abstraction over the actual socket so the connection
//! manager can be driven by a scripted socket in tests.

use crate::domain::shared::error::ClientError;
use crate::domain::shared::result::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Events produced by an open socket.
#[derive(Debug)]
pub enum SocketEvent {
    Frame(Bytes),
    Closed { reason: Option<String> },
}

/// Write half of an established signaling connection.
#[async_trait]
pub trait SignalingSocket: Send {
    async fn send(&mut self, frame: Bytes) -> Result<()>;
    async fn close(&mut self);
}

/// Dials new signaling connections.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn SignalingSocket>, mpsc::Receiver<SocketEvent>)>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// `tokio-tungstenite` backed socket.
pub struct WsSocket {
    sink: WsSink,
}

#[async_trait]
impl SignalingSocket for WsSocket {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.sink
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| ClientError::Transport(format!("WebSocket send failed: {}", e)))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// Default connector dialing `ws://` / `wss://` endpoints.
pub struct WsConnector;

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn SignalingSocket>, mpsc::Receiver<SocketEvent>)> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(format!("WebSocket connect failed: {}", e)))?;

        debug!("WebSocket connected to {}", url);

        let (sink, mut source) = stream.split();
        let (tx, rx) = mpsc::channel(256);

        // Pump incoming frames into the receiver until the stream ends.
        tokio::spawn(async move {
            loop {
                match source.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if tx.send(SocketEvent::Frame(Bytes::from(data))).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if tx
                            .send(SocketEvent::Frame(Bytes::from(text.into_bytes())))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = tx.send(SocketEvent::Closed { reason }).await;
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {}", e);
                        let _ = tx
                            .send(SocketEvent::Closed {
                                reason: Some(e.to_string()),
                            })
                            .await;
                        break;
                    }
                    None => {
                        let _ = tx.send(SocketEvent::Closed { reason: None }).await;
                        break;
                    }
                }
            }
        });

        Ok((Box::new(WsSocket { sink }), rx))
    }
}
