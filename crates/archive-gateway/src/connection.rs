//! Thin socket wrapper, generalized from `client-sdk/src/websocket.rs`'s
//! `DbConnection`: one `connect_async` call, split into a
//! `SplitSink`/`SplitStream` pair, JSON instead of a binary protobuf wire.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use archive_wire::gateway::GatewayPayload;

pub struct GatewaySocket {
    write: SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, WsMessage>,
    read: SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed gateway payload: {0}")]
    Decode(#[from] serde_json::Error),
}

pub enum SocketEvent {
    Payload(GatewayPayload),
    Closed { code: Option<u16> },
}

impl GatewaySocket {
    pub async fn connect(url: &str) -> Result<GatewaySocket, ConnectionError> {
        let (stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = stream.split();
        Ok(GatewaySocket { write, read })
    }

    pub async fn send(&mut self, payload: &GatewayPayload) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(payload)?;
        self.write.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    pub async fn next_event(&mut self) -> Option<Result<SocketEvent, ConnectionError>> {
        loop {
            let msg = self.read.next().await?;
            return Some(match msg {
                Ok(WsMessage::Text(text)) => serde_json::from_str::<GatewayPayload>(&text)
                    .map(SocketEvent::Payload)
                    .map_err(ConnectionError::from),
                Ok(WsMessage::Close(frame)) => Ok(SocketEvent::Closed {
                    code: frame.map(|f| f.code.into()),
                }),
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) | Ok(WsMessage::Binary(_)) => {
                    continue;
                }
                Err(e) => Err(ConnectionError::from(e)),
            });
        }
    }

    pub async fn close(&mut self) {
        let _ = self.write.close().await;
    }
}
