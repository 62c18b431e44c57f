//! Client side of the WebSocket session

use std::time::Duration;

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::ws::protocol::{ClientMsg, ProtocolError, ServerMsg};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport errors. All of them end the session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("WebSocket error: {0}")]
    Socket(#[source] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed by host")]
    Closed,
}

/// An open session with the host
pub struct Transport {
    sink: SplitSink<Socket, Message>,
    stream: SplitStream<Socket>,
}

impl Transport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(TransportError::Connect)?;
        debug!(url, "WebSocket connected");
        let (sink, stream) = socket.split();
        Ok(Self { sink, stream })
    }

    /// [`Transport::connect`] bounded by `limit`
    pub async fn connect_within(url: &str, limit: Duration) -> Result<Self, TransportError> {
        tokio::time::timeout(limit, Self::connect(url))
            .await
            .unwrap_or(Err(TransportError::Timeout(limit)))
    }

    pub async fn send(&mut self, msg: &ClientMsg) -> Result<(), TransportError> {
        let frame = msg.encode()?;
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(TransportError::Socket)
    }

    /// Next host message. Malformed and non-text frames are skipped.
    pub async fn recv(&mut self) -> Result<ServerMsg, TransportError> {
        while let Some(frame) = self.stream.next().await {
            match frame.map_err(TransportError::Socket)? {
                Message::Text(text) => match ServerMsg::decode(&text) {
                    Ok(msg) => return Ok(msg),
                    Err(e) => debug!(error = %e, "Dropping malformed frame"),
                },
                Message::Close(_) => return Err(TransportError::Closed),
                _ => {}
            }
        }
        Err(TransportError::Closed)
    }

    pub async fn close(mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}
