//! Connection session, routing fabric, server loop and configuration —
//! the async, tokio-driven consumer of `aonet-protocol` and
//! `aonet-crypto`.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod fabric;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use error::{ServerError, SessionError, Violation};
pub use fabric::{Fabric, Outbox};
pub use server::Server;
pub use session::Session;
