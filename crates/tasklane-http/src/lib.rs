//! HTTP transport for tasklane.
//!
//! [`router`] exposes the signed worker trigger and a status listing; [`LoopbackDispatcher`]
//! is the matching [`tasklane_core::Dispatcher`] that posts work requests to that trigger.

mod config;
mod loopback;
mod nonce;
mod server;

pub use config::HttpConfig;
pub use loopback::LoopbackDispatcher;
pub use nonce::{sign, verify};
pub use server::{router, serve, WorkerBody};
