//! Ephemera: a real-time presence and collaborative-typing relay.
//!
//! Clients hold a WebSocket to the relay. The hub tracks who is connected,
//! forwards typing-state events between peers, and redistributes presence
//! snapshots whenever membership changes. Delivery is best-effort: a slow
//! consumer loses messages, it never stalls the hub or its peers.

pub mod api;
pub mod config;
pub mod ws;
