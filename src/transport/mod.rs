//! Client-facing transport.  Clients stream sample batches over a WebSocket
//! and receive one JSON reply per batch.

pub mod message;
pub mod websocket;
