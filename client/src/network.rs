//! Headless WebSocket client for the canvas server.
//!
//! Performs the config handshake, keeps the last received canvas, and
//! exposes the paint/clear/query actions. The CLI and the integration tests
//! drive the protocol through this type; rendering is someone else's job.

use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use shared::{CanvasState, Color, Packet};
use std::fmt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub enum ClientError {
    Socket(tokio_tungstenite::tungstenite::Error),
    Protocol(String),
    ConnectionClosed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Socket(e) => write!(f, "socket error: {}", e),
            ClientError::Protocol(e) => write!(f, "protocol error: {}", e),
            ClientError::ConnectionClosed => write!(f, "connection closed by server"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Socket(e)
    }
}

pub struct CanvasClient {
    ws: WsStream,
    session_id: u64,
    canvas: CanvasState,
}

impl CanvasClient {
    /// Connects, sends the config handshake and waits for the session id and
    /// the initial canvas. Fails if the server refuses the handshake.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (mut ws, _) = connect_async(url).await?;

        let handshake = bincode::serialize(&Packet::handshake())
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        ws.send(Message::Binary(handshake.into())).await?;

        let session_id = match read_packet(&mut ws).await? {
            Packet::Connected { session_id } => session_id,
            Packet::Disconnected { reason } => {
                return Err(ClientError::Protocol(format!(
                    "server refused connection: {}",
                    reason
                )))
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected Connected, got {:?}",
                    other
                )))
            }
        };

        let canvas = match read_packet(&mut ws).await? {
            Packet::Grid { canvas } => canvas,
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected the initial canvas, got {:?}",
                    other
                )))
            }
        };

        info!("Connected to {} as session {}", url, session_id);
        Ok(Self {
            ws,
            session_id,
            canvas,
        })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// The most recently received canvas.
    pub fn canvas(&self) -> &CanvasState {
        &self.canvas
    }

    pub async fn paint(
        &mut self,
        grid_index: u32,
        row: u32,
        col: u32,
        color: Color,
    ) -> Result<(), ClientError> {
        self.send(&Packet::Paint {
            grid_index,
            row,
            col,
            color,
        })
        .await
    }

    pub async fn clear(&mut self) -> Result<(), ClientError> {
        self.send(&Packet::Clear).await
    }

    pub async fn request_grid(&mut self) -> Result<(), ClientError> {
        self.send(&Packet::GetInitialGrid).await
    }

    /// Tells the server we are leaving and closes the socket.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.send(&Packet::Disconnect).await?;
        self.ws.close(None).await?;
        Ok(())
    }

    /// The next packet from the server. Canvas broadcasts also update the
    /// locally cached copy.
    pub async fn next_packet(&mut self) -> Result<Packet, ClientError> {
        let packet = read_packet(&mut self.ws).await?;
        if let Packet::Grid { canvas } = &packet {
            self.canvas = canvas.clone();
        }
        Ok(packet)
    }

    /// Waits for the next full canvas broadcast, skipping everything else.
    pub async fn next_grid(&mut self) -> Result<CanvasState, ClientError> {
        loop {
            match self.next_packet().await? {
                Packet::Grid { canvas } => return Ok(canvas),
                Packet::Disconnected { reason } => {
                    return Err(ClientError::Protocol(reason));
                }
                _ => {}
            }
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let data =
            bincode::serialize(packet).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.ws.send(Message::Binary(data.into())).await?;
        Ok(())
    }
}

async fn read_packet(ws: &mut WsStream) -> Result<Packet, ClientError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                match bincode::deserialize::<Packet>(&bytes) {
                    Ok(packet) => return Ok(packet),
                    Err(e) => warn!("Dropping malformed frame from server: {}", e),
                }
            }
            Some(Ok(Message::Close(_))) | None => return Err(ClientError::ConnectionClosed),
            Some(Ok(_)) => {} // pings are answered by the protocol layer
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_formatting() {
        let err = ClientError::Protocol("bad frame".to_string());
        assert!(err.to_string().contains("bad frame"));

        let err = ClientError::ConnectionClosed;
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_handshake_is_encodable() {
        // The handshake sent on every connect must always serialize
        let encoded = bincode::serialize(&Packet::handshake()).unwrap();
        assert!(!encoded.is_empty());
    }
}
