//! Reverse tunnel client: keep one registered, multiplexed session to the proxy
//! alive and serve the streams it opens toward us.
//!
//! Wire format: yamux over TCP; every virtual stream starts with a
//! multistream-select 1.0.0 negotiation, after which `/register` and `/ping`
//! exchange a single newline-terminated line each way.

pub mod backoff;
pub mod client;
pub mod dispatch;
pub mod establish;
pub mod heartbeat;
pub mod identity;
pub mod mux;
pub mod protocol;
pub mod register;
pub mod select;
pub mod slot;
pub mod transport;

#[cfg(test)]
pub mod testing;
