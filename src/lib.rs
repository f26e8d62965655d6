//! webframe: an embeddable HTTP service framework.
//!
//! A programmable server that accepts HTTP/1.x and HTTP/2 traffic, routes
//! each request to exactly one user-supplied [`service::Resource`] (chosen
//! by regular-expression path match and HTTP method), runs an ordered
//! chain of user-supplied [`service::Filter`]s around it, serializes and
//! deserializes request and response bodies through a pluggable
//! media-type [`registry`], and attaches pluggable [`auth`] schemes — with
//! graceful shutdown, streaming responses (including Server-Sent Events),
//! and per-request resource cleanup.
//!
//! Start with [`request::Request`] and [`args::Arguments`] for what a
//! handler sees, [`service::Service`] for how routes and filters are
//! wired together, and [`server::Server`] for how one or more services
//! are exposed on the network.
#![allow(clippy::unknown_clippy_lints)]

pub mod args;
pub mod auth;
pub mod blob;
pub mod client;
pub mod config;
pub mod error;
pub mod eventstream;
pub mod registry;
pub mod request;
pub mod response;
pub mod server;
pub mod service;
mod utils;

pub use args::Arguments;
pub use config::Config;
pub use error::WebError;
pub use request::Request;
pub use response::Response;
pub use service::{Filter, Resource, Service};

/// Registers every built-in media type, encoding, and auth scheme this
/// crate ships, the same explicit, deterministic startup step the teacher
/// uses for its own `Manager::load` (spec §9: no `ctor`-style implicit
/// registration). Returns the two registries an embedder wires into
/// [`server::Server::with_registry`] and its own credentials providers.
pub fn register_builtins() -> (registry::Registry, auth::AuthRegistry) {
    (registry::register_builtins(), auth::register_builtins())
}
