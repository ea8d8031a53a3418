//! taskd client library
//!
//! Connects to a taskd server over a unix socket or TCP, performs the
//! acknowledgment handshake, and offers two ways to talk: fire-and-
//! forget [`IpcClient::send`], and correlated [`IpcClient::request`]
//! for query commands. Broadcast events that arrive while a request is
//! in flight are buffered and surfaced later through
//! [`IpcClient::next_event`].

mod client;

pub use client::IpcClient;
