//! telemetry-web - HTTP/WebSocket front end for a vehicle telemetry unit.
//!
//! Pages are served through a registry of handlers with per-page
//! authentication. Logged-in browsers hold a live WebSocket that receives
//! metric deltas, events, and configuration changes through a bounded,
//! coalescing push queue per client.

pub mod api;
pub mod command;
pub mod config;
pub mod connection;
pub mod events;
pub mod housekeeping;
pub mod io;
pub mod metrics;
pub mod pages;
pub mod params;
pub mod pty;
pub mod push;
pub mod sender;
pub mod server;
pub mod session;
pub mod shutdown;
