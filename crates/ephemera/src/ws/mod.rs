//! Real-time relay core: the hub registry and per-connection pumps.

pub mod connection;
pub mod hub;
