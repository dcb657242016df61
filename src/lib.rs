//! Parley: a private and group chat server.
//!
//! - [`engine`] is the routing core: the session registry, the message
//!   router and the per-connection state machine, plus the [`ChatStore`]
//!   persistence seam they depend on.
//! - [`db`] implements that seam on SQLite (and in memory for tests).
//! - [`web`] exposes the core over axum: JSON account and group endpoints and
//!   the `/ws` duplex channel.
//! - [`client`] is the interactive terminal front-end.
//!
//! [`ChatStore`]: engine::store::ChatStore

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod db;
pub mod engine;
pub mod web;
