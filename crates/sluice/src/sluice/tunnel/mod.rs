//! Reverse tunnels carried over a single upgraded HTTP(S) connection.
//!
//! Layering, bottom up: [`frame`] encodes the wire frames, [`session`] multiplexes
//! them into [`stream`]s, [`protocol`] runs the control handshake, and
//! [`registry`] binds the listeners each [`spec`] asks for. [`server`] and
//! [`client`] tie those together on either side of a [`transport`].

pub mod client;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod spec;
pub mod stream;
pub mod transport;
