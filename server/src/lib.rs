//! # Canvas Server Library
//!
//! Authoritative server for the shared pixel canvas. It owns the canonical
//! canvas state, serializes every mutation through a single point, persists
//! each accepted change, and broadcasts the resulting state to all connected
//! clients.
//!
//! ## Architecture
//!
//! Every connection is a WebSocket handled by its own task, but none of
//! those tasks touch shared state. They translate inbound frames into
//! commands on the hub's mailbox; the hub task is the sole mutator. For each
//! accepted paint it runs bounds check, rate check, cell mutation, snapshot
//! append and broadcast enqueue back to back, so clients only ever observe
//! fully applied states, in the order they were applied.
//!
//! A state is broadcast only after its snapshot append succeeded: anything a
//! client has ever rendered is already durable, and a restart recovers
//! exactly the last broadcast canvas.
//!
//! ## Module Organization
//!
//! - [`grid`] — in-memory authoritative canvas with point mutations and the
//!   color tally used for the leaderboard
//! - [`limiter`] — per-session paint cooldown (sliding window of one)
//! - [`store`] — append-only snapshot log (RocksDB, plus an in-memory
//!   implementation for tests)
//! - [`hub`] — the session hub: mailbox, session registry, mutation
//!   pipeline, broadcast fan-out
//! - [`network`] — WebSocket gateway: accept loop, config handshake,
//!   frame shuttling; no business logic

pub mod grid;
pub mod hub;
pub mod limiter;
pub mod network;
pub mod store;
