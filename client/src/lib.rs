//! # Canvas Client Library
//!
//! Headless client for the shared pixel canvas server. It owns the WebSocket
//! connection, performs the config handshake, tracks the latest broadcast
//! canvas, and exposes the paint/clear/query actions.
//!
//! The actual display surface (a grid of colored cells and a color picker)
//! is out of scope here; this crate is the programmatic interface the CLI
//! and the integration tests build on.

pub mod network;

pub use network::{CanvasClient, ClientError};
