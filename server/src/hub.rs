//! The session hub: the single serialization point for every mutation.
//!
//! The hub runs as one task draining an mpsc mailbox. Because that task is
//! the only writer of the grid store, each paint or clear runs its whole
//! {validate, rate-check, mutate, persist, broadcast-enqueue} sequence before
//! the next command is looked at — no session can ever observe a
//! half-applied mutation, and broadcasts are enqueued to every session in
//! mutation order. Outbound frames are encoded once and shared via `Arc`;
//! per-session FIFO channels plus ordered transport preserve that order all
//! the way to each client.
//!
//! Persistence is synchronous with respect to the mutation it records: a
//! state is only broadcast after its snapshot append succeeded, so any state
//! a client has ever seen is durable. If the append fails the mutation is
//! rolled back and only the originator is told.

use crate::grid::GridStore;
use crate::limiter::RateLimiter;
use crate::store::{SnapshotStore, StoreError};
use log::{debug, error, info};
use shared::{CanvasState, Color, Packet, Reject, COOLDOWN};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// A pre-encoded outbound packet, shared across all receiving sessions.
pub type Frame = Arc<Vec<u8>>;

/// Commands accepted by the hub mailbox. The gateway translates inbound
/// packets into these; tests drive the hub with them directly.
#[derive(Debug)]
pub enum HubCommand {
    Connect {
        outbound: mpsc::UnboundedSender<Frame>,
        reply: oneshot::Sender<u64>,
    },
    InitialGrid {
        session_id: u64,
    },
    Paint {
        session_id: u64,
        grid_index: u32,
        row: u32,
        col: u32,
        color: Color,
    },
    Clear {
        session_id: u64,
    },
    Disconnect {
        session_id: u64,
    },
}

/// Cloneable sender half used by the gateway and the binaries.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn channel() -> (HubHandle, mpsc::UnboundedReceiver<HubCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (HubHandle { tx }, rx)
    }

    /// Registers a session. The hub pushes `Connected` followed by the
    /// current canvas through `outbound`. Returns `None` if the hub is gone.
    pub async fn connect(&self, outbound: mpsc::UnboundedSender<Frame>) -> Option<u64> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Connect { outbound, reply })
            .ok()?;
        reply_rx.await.ok()
    }

    pub fn initial_grid(&self, session_id: u64) -> bool {
        self.tx.send(HubCommand::InitialGrid { session_id }).is_ok()
    }

    pub fn paint(&self, session_id: u64, grid_index: u32, row: u32, col: u32, color: Color) -> bool {
        self.tx
            .send(HubCommand::Paint {
                session_id,
                grid_index,
                row,
                col,
                color,
            })
            .is_ok()
    }

    pub fn clear(&self, session_id: u64) -> bool {
        self.tx.send(HubCommand::Clear { session_id }).is_ok()
    }

    pub fn disconnect(&self, session_id: u64) {
        let _ = self.tx.send(HubCommand::Disconnect { session_id });
    }
}

pub struct Hub<S> {
    grid: GridStore,
    limiter: RateLimiter,
    store: S,
    sessions: HashMap<u64, mpsc::UnboundedSender<Frame>>,
    next_session_id: u64,
}

impl<S: SnapshotStore> Hub<S> {
    pub fn new(store: S) -> Self {
        Self::with_cooldown(store, COOLDOWN)
    }

    pub fn with_cooldown(store: S, cooldown: Duration) -> Self {
        Self {
            grid: GridStore::new(),
            limiter: RateLimiter::new(cooldown),
            store,
            sessions: HashMap::new(),
            next_session_id: 1,
        }
    }

    /// Loads the most recent persisted snapshot into the grid store.
    /// Returns whether anything was recovered.
    pub fn recover(&mut self) -> Result<bool, StoreError> {
        match self.store.latest()? {
            Some((id, canvas)) => {
                self.grid.replace(canvas);
                info!("Recovered canvas from snapshot {}", id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drains the mailbox until every handle is dropped.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(cmd) = commands.recv().await {
            self.handle_command(cmd);
        }
        info!("Hub mailbox closed, shutting down");
    }

    pub fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Connect { outbound, reply } => self.on_connect(outbound, reply),
            HubCommand::InitialGrid { session_id } => self.on_initial_grid(session_id),
            HubCommand::Paint {
                session_id,
                grid_index,
                row,
                col,
                color,
            } => self.on_paint(session_id, grid_index, row, col, color),
            HubCommand::Clear { session_id } => self.on_clear(session_id),
            HubCommand::Disconnect { session_id } => self.on_disconnect(session_id),
        }
    }

    fn on_connect(&mut self, outbound: mpsc::UnboundedSender<Frame>, reply: oneshot::Sender<u64>) {
        let session_id = self.next_session_id;
        self.next_session_id += 1;
        self.sessions.insert(session_id, outbound);
        let _ = reply.send(session_id);

        // The initial state reflects the latest persisted mutation because
        // this runs after any previously queued paint finished persisting.
        self.send_to(session_id, &Packet::Connected { session_id });
        self.send_to(
            session_id,
            &Packet::Grid {
                canvas: self.grid.snapshot(),
            },
        );
        info!(
            "Session {} connected ({} active)",
            session_id,
            self.sessions.len()
        );
    }

    fn on_initial_grid(&mut self, session_id: u64) {
        self.send_to(
            session_id,
            &Packet::Grid {
                canvas: self.grid.snapshot(),
            },
        );
    }

    fn on_paint(&mut self, session_id: u64, grid_index: u32, row: u32, col: u32, color: Color) {
        let (g, r, c) = (grid_index as usize, row as usize, col as usize);

        if !CanvasState::in_bounds(g, r, c) {
            debug!(
                "Session {} painted out of range ({}, {}, {})",
                session_id, grid_index, row, col
            );
            self.send_to(
                session_id,
                &Packet::Rejected {
                    reason: Reject::OutOfRange,
                },
            );
            return;
        }

        if let Err(remaining) = self.limiter.try_accept(session_id, Instant::now()) {
            self.send_to(
                session_id,
                &Packet::Rejected {
                    reason: Reject::Cooldown {
                        remaining_ms: remaining.as_millis() as u64,
                    },
                },
            );
            return;
        }

        let previous = match self.grid.set_cell(g, r, c, color) {
            Ok(previous) => previous,
            Err(_) => {
                // Unreachable after the bounds check, but reject rather than
                // diverge from the store's own verdict.
                self.send_to(
                    session_id,
                    &Packet::Rejected {
                        reason: Reject::OutOfRange,
                    },
                );
                return;
            }
        };

        match self.store.append(self.grid.canvas()) {
            Ok(id) => {
                debug!(
                    "Session {} painted ({}, {}, {}) {} (snapshot {})",
                    session_id, grid_index, row, col, color, id
                );
                self.broadcast_grid();
            }
            Err(e) => {
                error!("Snapshot append failed, rolling back paint: {}", e);
                self.grid.restore_cell(g, r, c, previous);
                // The acceptance did not take effect, so its cooldown stamp
                // must not stand either.
                self.limiter.forget(session_id);
                self.send_to(
                    session_id,
                    &Packet::Rejected {
                        reason: Reject::Persistence,
                    },
                );
            }
        }
    }

    fn on_clear(&mut self, session_id: u64) {
        // Global reset, exempt from rate limiting.
        let pre_image = self.grid.snapshot();
        self.grid.clear();

        match self.store.append(self.grid.canvas()) {
            Ok(id) => {
                info!("Session {} cleared the canvas (snapshot {})", session_id, id);
                self.broadcast_grid();
            }
            Err(e) => {
                error!("Snapshot append failed, rolling back clear: {}", e);
                self.grid.replace(pre_image);
                self.send_to(
                    session_id,
                    &Packet::Rejected {
                        reason: Reject::Persistence,
                    },
                );
            }
        }
    }

    fn on_disconnect(&mut self, session_id: u64) {
        if self.sessions.remove(&session_id).is_some() {
            self.limiter.forget(session_id);
            info!(
                "Session {} disconnected ({} active)",
                session_id,
                self.sessions.len()
            );
        }
    }

    /// Encodes the current canvas once and enqueues it to every session,
    /// including the originator of the mutation.
    fn broadcast_grid(&mut self) {
        let frame = match encode(&Packet::Grid {
            canvas: self.grid.snapshot(),
        }) {
            Some(frame) => frame,
            None => return,
        };

        // Dead sessions are pruned here; the gateway also reports them via
        // Disconnect, which is idempotent.
        self.sessions
            .retain(|_, outbound| outbound.send(frame.clone()).is_ok());
    }

    fn send_to(&mut self, session_id: u64, packet: &Packet) {
        let Some(frame) = encode(packet) else {
            return;
        };
        if let Some(outbound) = self.sessions.get(&session_id) {
            if outbound.send(frame).is_err() {
                self.sessions.remove(&session_id);
            }
        }
    }
}

fn encode(packet: &Packet) -> Option<Frame> {
    match bincode::serialize(packet) {
        Ok(bytes) => Some(Arc::new(bytes)),
        Err(e) => {
            error!("Failed to encode outbound packet: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySnapshotStore;

    /// A store whose appends always fail, for fail-closed paths.
    struct FailingStore;

    impl SnapshotStore for FailingStore {
        fn append(&mut self, _canvas: &CanvasState) -> Result<u64, StoreError> {
            Err(StoreError::Database("disk on fire".into()))
        }

        fn latest(&self) -> Result<Option<(u64, CanvasState)>, StoreError> {
            Ok(None)
        }
    }

    fn decode(frame: &Frame) -> Packet {
        bincode::deserialize(frame).unwrap()
    }

    fn connect<S: SnapshotStore>(hub: &mut Hub<S>) -> (u64, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (reply, mut reply_rx) = oneshot::channel();
        hub.handle_command(HubCommand::Connect { outbound, reply });
        let session_id = reply_rx.try_recv().unwrap();
        (session_id, rx)
    }

    fn next_packet(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Packet {
        decode(&rx.try_recv().expect("expected a queued frame"))
    }

    fn assert_no_packet(rx: &mut mpsc::UnboundedReceiver<Frame>) {
        assert!(rx.try_recv().is_err(), "expected no queued frame");
    }

    const RED: Color = Color::rgb(0xff, 0x00, 0x00);

    #[test]
    fn test_connect_sends_session_then_state() {
        let mut hub = Hub::new(MemorySnapshotStore::new());
        let (session_id, mut rx) = connect(&mut hub);

        match next_packet(&mut rx) {
            Packet::Connected { session_id: id } => assert_eq!(id, session_id),
            other => panic!("expected Connected, got {:?}", other),
        }
        match next_packet(&mut rx) {
            Packet::Grid { canvas } => assert_eq!(canvas, CanvasState::new()),
            other => panic!("expected Grid, got {:?}", other),
        }
        assert_no_packet(&mut rx);
    }

    #[test]
    fn test_paint_broadcasts_to_all_sessions() {
        let mut hub = Hub::new(MemorySnapshotStore::new());
        let (painter, mut painter_rx) = connect(&mut hub);
        let (_observer, mut observer_rx) = connect(&mut hub);

        // Drain connection traffic
        while painter_rx.try_recv().is_ok() {}
        while observer_rx.try_recv().is_ok() {}

        hub.handle_command(HubCommand::Paint {
            session_id: painter,
            grid_index: 0,
            row: 1,
            col: 2,
            color: RED,
        });

        let mut expected = CanvasState::new();
        expected.set_cell(0, 1, 2, RED);

        for rx in [&mut painter_rx, &mut observer_rx] {
            match next_packet(rx) {
                Packet::Grid { canvas } => assert_eq!(canvas, expected),
                other => panic!("expected Grid, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_out_of_range_rejected_to_sender_only() {
        let mut hub = Hub::new(MemorySnapshotStore::new());
        let (painter, mut painter_rx) = connect(&mut hub);
        let (_observer, mut observer_rx) = connect(&mut hub);
        while painter_rx.try_recv().is_ok() {}
        while observer_rx.try_recv().is_ok() {}

        hub.handle_command(HubCommand::Paint {
            session_id: painter,
            grid_index: shared::TOTAL_GRIDS as u32,
            row: 0,
            col: 0,
            color: RED,
        });

        match next_packet(&mut painter_rx) {
            Packet::Rejected { reason } => assert_eq!(reason, Reject::OutOfRange),
            other => panic!("expected Rejected, got {:?}", other),
        }
        assert_no_packet(&mut observer_rx);
        assert_eq!(hub.grid.snapshot(), CanvasState::new());
        assert!(hub.store.is_empty());
    }

    #[test]
    fn test_second_paint_within_cooldown_rejected() {
        let mut hub = Hub::new(MemorySnapshotStore::new());
        let (painter, mut painter_rx) = connect(&mut hub);
        while painter_rx.try_recv().is_ok() {}

        hub.handle_command(HubCommand::Paint {
            session_id: painter,
            grid_index: 0,
            row: 0,
            col: 0,
            color: RED,
        });
        assert!(matches!(next_packet(&mut painter_rx), Packet::Grid { .. }));

        hub.handle_command(HubCommand::Paint {
            session_id: painter,
            grid_index: 0,
            row: 0,
            col: 1,
            color: RED,
        });
        match next_packet(&mut painter_rx) {
            Packet::Rejected {
                reason: Reject::Cooldown { remaining_ms },
            } => {
                assert!(remaining_ms > 0);
                assert!(remaining_ms <= COOLDOWN.as_millis() as u64);
            }
            other => panic!("expected Cooldown, got {:?}", other),
        }

        // The rejected paint changed nothing and persisted nothing
        assert_eq!(hub.grid.snapshot().get(0, 0, 1), Some(Color::WHITE));
        assert_eq!(hub.store.len(), 1);
    }

    #[test]
    fn test_distinct_sessions_do_not_share_cooldown() {
        let mut hub = Hub::new(MemorySnapshotStore::new());
        let (first, mut first_rx) = connect(&mut hub);
        let (second, mut second_rx) = connect(&mut hub);
        while first_rx.try_recv().is_ok() {}
        while second_rx.try_recv().is_ok() {}

        hub.handle_command(HubCommand::Paint {
            session_id: first,
            grid_index: 0,
            row: 0,
            col: 0,
            color: RED,
        });
        hub.handle_command(HubCommand::Paint {
            session_id: second,
            grid_index: 0,
            row: 0,
            col: 1,
            color: RED,
        });

        // Both accepted: two broadcasts each
        assert!(matches!(next_packet(&mut first_rx), Packet::Grid { .. }));
        assert!(matches!(next_packet(&mut first_rx), Packet::Grid { .. }));
        assert_eq!(hub.store.len(), 2);
    }

    #[test]
    fn test_clear_is_not_rate_limited_and_idempotent() {
        let mut hub = Hub::new(MemorySnapshotStore::new());
        let (session, mut rx) = connect(&mut hub);
        while rx.try_recv().is_ok() {}

        hub.handle_command(HubCommand::Paint {
            session_id: session,
            grid_index: 1,
            row: 1,
            col: 1,
            color: RED,
        });
        // Clear immediately after painting, then clear again
        hub.handle_command(HubCommand::Clear { session_id: session });
        hub.handle_command(HubCommand::Clear { session_id: session });

        assert!(matches!(next_packet(&mut rx), Packet::Grid { .. }));
        for _ in 0..2 {
            match next_packet(&mut rx) {
                Packet::Grid { canvas } => assert_eq!(canvas, CanvasState::new()),
                other => panic!("expected Grid, got {:?}", other),
            }
        }
        assert_eq!(hub.store.len(), 3);
    }

    #[test]
    fn test_persistence_failure_rolls_back_and_rejects() {
        let mut hub = Hub::new(FailingStore);
        let (painter, mut painter_rx) = connect(&mut hub);
        let (_observer, mut observer_rx) = connect(&mut hub);
        while painter_rx.try_recv().is_ok() {}
        while observer_rx.try_recv().is_ok() {}

        hub.handle_command(HubCommand::Paint {
            session_id: painter,
            grid_index: 0,
            row: 5,
            col: 5,
            color: RED,
        });

        match next_packet(&mut painter_rx) {
            Packet::Rejected { reason } => assert_eq!(reason, Reject::Persistence),
            other => panic!("expected Rejected, got {:?}", other),
        }
        assert_no_packet(&mut observer_rx);
        assert_eq!(hub.grid.snapshot(), CanvasState::new());

        // The aborted paint must not leave a cooldown behind: an immediate
        // retry reaches the store again instead of being rate limited.
        hub.handle_command(HubCommand::Paint {
            session_id: painter,
            grid_index: 0,
            row: 5,
            col: 5,
            color: RED,
        });
        match next_packet(&mut painter_rx) {
            Packet::Rejected { reason } => assert_eq!(reason, Reject::Persistence),
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_persistence_failure_rolls_back_clear() {
        let mut hub = Hub::with_cooldown(MemorySnapshotStore::new(), Duration::from_millis(0));
        let (session, mut rx) = connect(&mut hub);
        while rx.try_recv().is_ok() {}

        hub.handle_command(HubCommand::Paint {
            session_id: session,
            grid_index: 2,
            row: 3,
            col: 4,
            color: RED,
        });
        assert!(matches!(next_packet(&mut rx), Packet::Grid { .. }));
        let before = hub.grid.snapshot();

        // Swap in a failing store by moving state over
        let mut failing = Hub::with_cooldown(FailingStore, Duration::from_millis(0));
        failing.grid.replace(before.clone());
        let (session2, mut rx2) = connect(&mut failing);
        while rx2.try_recv().is_ok() {}

        failing.handle_command(HubCommand::Clear {
            session_id: session2,
        });
        match next_packet(&mut rx2) {
            Packet::Rejected { reason } => assert_eq!(reason, Reject::Persistence),
            other => panic!("expected Rejected, got {:?}", other),
        }
        assert_eq!(failing.grid.snapshot(), before);
    }

    #[test]
    fn test_disconnect_stops_broadcasts_and_is_idempotent() {
        let mut hub = Hub::new(MemorySnapshotStore::new());
        let (leaver, mut leaver_rx) = connect(&mut hub);
        let (stayer, mut stayer_rx) = connect(&mut hub);
        while leaver_rx.try_recv().is_ok() {}
        while stayer_rx.try_recv().is_ok() {}

        hub.handle_command(HubCommand::Disconnect { session_id: leaver });
        hub.handle_command(HubCommand::Disconnect { session_id: leaver });

        hub.handle_command(HubCommand::Paint {
            session_id: stayer,
            grid_index: 0,
            row: 0,
            col: 0,
            color: RED,
        });

        assert!(matches!(next_packet(&mut stayer_rx), Packet::Grid { .. }));
        assert_no_packet(&mut leaver_rx);
    }

    #[test]
    fn test_initial_grid_reflects_latest_mutation() {
        let mut hub = Hub::new(MemorySnapshotStore::new());
        let (session, mut rx) = connect(&mut hub);
        while rx.try_recv().is_ok() {}

        hub.handle_command(HubCommand::Paint {
            session_id: session,
            grid_index: 1,
            row: 10,
            col: 20,
            color: RED,
        });
        assert!(matches!(next_packet(&mut rx), Packet::Grid { .. }));

        hub.handle_command(HubCommand::InitialGrid {
            session_id: session,
        });
        match next_packet(&mut rx) {
            Packet::Grid { canvas } => assert_eq!(canvas.get(1, 10, 20), Some(RED)),
            other => panic!("expected Grid, got {:?}", other),
        }
    }

    #[test]
    fn test_recover_restores_persisted_state() {
        let mut store = MemorySnapshotStore::new();
        let mut persisted = CanvasState::new();
        persisted.set_cell(2, 7, 8, RED);
        store.append(&persisted).unwrap();

        let mut hub = Hub::new(store);
        assert!(hub.recover().unwrap());

        let (_session, mut rx) = connect(&mut hub);
        assert!(matches!(next_packet(&mut rx), Packet::Connected { .. }));
        match next_packet(&mut rx) {
            Packet::Grid { canvas } => assert_eq!(canvas, persisted),
            other => panic!("expected Grid, got {:?}", other),
        }
    }
}
