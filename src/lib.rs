//! tls-session - server session cache and handshake coordination
//!
//! This crate sits between a host binding layer and an external TLS engine.
//! It decides when the engine negotiates, what gets cached for resumption,
//! and what the caller can observe about a negotiated connection.

pub mod ssl;
