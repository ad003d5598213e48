//! Host-side SDK runtime.
//!
//! Lets a backend process expose named actions and pages to a remote
//! orchestrator over a persistent, reconnecting, duplex connection. A
//! [`session::HostSession`] owns the connection lifecycle; handlers are
//! registered against a [`model::RouteTree`] and invoked with a
//! [`ctx::HandlerCtx`] plus an [`io_client::IoClient`] collaborator for
//! prompting the orchestrator mid-transaction.
//!
//! # Layering
//! - [`transport`] — framed, chunked, ack-checked websocket transport.
//! - [`rpc`] — duplex method dispatch over the transport.
//! - [`pending`] — the at-most-once replay store for in-flight artifacts.
//! - [`transaction`] and [`page`] — the two kinds of orchestrator-driven
//!   work a host serves.
//! - [`session`] — ties the above into one reconnecting, resumable
//!   connection with a graceful shutdown path.
//! - [`http`] (feature `http`) — a single-shot adapter for hosts that run
//!   behind a request/response function instead of a long-lived process.

#![cfg_attr(
    test,
    expect(clippy::unwrap_used, reason = "test code can panic")
)]
#![cfg_attr(
    test,
    expect(clippy::indexing_slicing, reason = "test code with known bounds")
)]

pub mod config;
pub mod ctx;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod io_client;
pub mod model;
pub mod page;
pub mod pending;
pub mod rpc;
pub mod session;
mod tagged;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod time;
pub mod transaction;
pub mod transport;

pub use config::HostConfig;
pub use error::{HostError, Result};
pub use session::{HostSession, HostSessionConfig, SessionState};
