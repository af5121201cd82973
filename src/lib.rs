//! Per-session EEG buffering, trigger gating and music-generation
//! orchestration.
//!
//! [`engine::Engine`] is the entry point a transport drives; the daemon in
//! `main.rs` wires it to [`transport::websocket`] and an HTTP generator.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod generator;
pub mod governor;
pub mod reaper;
pub mod session;
pub mod transport;
pub mod util;
