//! WebSocket chat relay: every line a client sends is fanned out to every
//! other connected client.
//!
//! See `README.md` for usage and the text protocol. Each module focuses on a
//! concrete responsibility:
//!
//! - [`cli`] parses the command line; [`config`] turns it into the timings and
//!   limits the relay runs with.
//! - [`hub`] owns membership and serializes register, unregister and
//!   broadcast requests in a single Tokio task.
//! - [`session`] bootstraps each connection and runs its inbound and outbound
//!   pumps.
//! - [`protocol`] normalizes client input and formats the lines clients see.
//! - [`server`] wires the HTTP routes (`/` and `/ws`) onto a listener.
//!
//! Integration tests drive a real relay over WebSockets; unit tests exercise
//! the hub and the pumps against in-memory transports.

pub mod cli;
pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod session;
