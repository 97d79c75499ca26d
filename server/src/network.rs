//! WebSocket connection gateway.
//!
//! Accepts connections, performs the config handshake, and shuttles packets
//! between each socket and the hub. All business logic lives in the hub; a
//! connection task only decodes inbound frames, forwards them, and writes
//! the pre-encoded outbound frames the hub queues for its session.

use crate::hub::{Frame, HubHandle};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{Packet, CANVAS_SIZE, COOLDOWN, PIXEL_SIZE, PROTOCOL_VERSION, TOTAL_GRIDS};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;
type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub struct Gateway {
    listener: TcpListener,
    hub: HubHandle,
}

impl Gateway {
    pub async fn bind(addr: &str, hub: HubHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self { listener, hub })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; one task per connection.
    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub).await {
                    debug!("Connection from {} ended with error: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, hub: HubHandle) -> ConnectionResult {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    debug!("WebSocket connection established from {}", addr);

    if let Some(reason) = await_handshake(&mut ws_sender, &mut ws_receiver).await? {
        warn!("Rejecting connection from {}: {}", addr, reason);
        let bye = bincode::serialize(&Packet::Disconnected { reason })?;
        ws_sender.send(Message::Binary(bye.into())).await?;
        return Ok(());
    }

    // Register with the hub; it pushes Connected and the initial canvas
    // through the outbound channel before any later broadcast.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let session_id = match hub.connect(outbound_tx).await {
        Some(id) => id,
        None => return Ok(()), // hub shut down
    };
    info!("Session {} established from {}", session_id, addr);

    let result = drive_session(
        &hub,
        session_id,
        &mut ws_sender,
        &mut ws_receiver,
        &mut outbound_rx,
    )
    .await;

    hub.disconnect(session_id);
    info!("Session {} from {} closed", session_id, addr);
    result
}

/// Reads the first protocol frame and checks it against this build's
/// constants. Returns a rejection reason, or `None` when the handshake is
/// accepted. A peer compiled with different grid geometry would desynchronize
/// on every index, so it is turned away here rather than trusted.
async fn await_handshake(
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
    let first = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                break bincode::deserialize::<Packet>(&bytes).ok();
            }
            Some(Ok(Message::Close(_))) | None => return Ok(Some("closed before handshake".into())),
            Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
            Some(Ok(_)) => {} // text and pong frames are not part of the protocol
            Some(Err(e)) => return Err(e.into()),
        }
    };

    let reason = match first {
        Some(Packet::Connect {
            protocol_version,
            pixel_size,
            canvas_size,
            total_grids,
            cooldown_ms,
        }) => {
            if protocol_version != PROTOCOL_VERSION {
                Some(format!("unsupported protocol version {}", protocol_version))
            } else if pixel_size != PIXEL_SIZE
                || canvas_size != CANVAS_SIZE
                || total_grids != TOTAL_GRIDS as u32
                || cooldown_ms != COOLDOWN.as_millis() as u64
            {
                Some("canvas configuration mismatch".to_string())
            } else {
                None
            }
        }
        Some(_) => Some("expected a connect handshake".to_string()),
        None => Some("malformed handshake".to_string()),
    };
    Ok(reason)
}

async fn drive_session(
    hub: &HubHandle,
    session_id: u64,
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
    outbound_rx: &mut mpsc::UnboundedReceiver<Frame>,
) -> ConnectionResult {
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match bincode::deserialize::<Packet>(&bytes) {
                            Ok(packet) => {
                                if !dispatch(hub, session_id, packet) {
                                    return Ok(());
                                }
                            }
                            // Malformed event: drop it, keep the session
                            Err(e) => warn!(
                                "Dropping malformed frame from session {}: {}",
                                session_id, e
                            ),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket error from session {}: {}", session_id, e);
                        return Ok(());
                    }
                }
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => ws_sender.send(Message::Binary(frame.to_vec().into())).await?,
                    None => return Ok(()), // hub dropped the session
                }
            }
        }
    }
}

/// Translates one inbound packet into a hub command. Returns `false` when
/// the session should end (client farewell or hub shutdown).
fn dispatch(hub: &HubHandle, session_id: u64, packet: Packet) -> bool {
    match packet {
        Packet::GetInitialGrid => hub.initial_grid(session_id),
        Packet::Paint {
            grid_index,
            row,
            col,
            color,
        } => hub.paint(session_id, grid_index, row, col, color),
        Packet::Clear => hub.clear(session_id),
        Packet::Disconnect => false,
        Packet::Connect { .. } => {
            warn!("Session {} sent a duplicate handshake", session_id);
            true
        }
        // Server-to-client packets carry no meaning inbound
        Packet::Connected { .. }
        | Packet::Grid { .. }
        | Packet::Rejected { .. }
        | Packet::Disconnected { .. } => {
            warn!("Session {} sent an unexpected packet", session_id);
            true
        }
    }
}
