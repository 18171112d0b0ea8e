//! # Service Layer
//!
//! The running server: accept loop, per-connection actors and lifecycle.

pub mod connection;
pub mod server;

pub use server::{Server, ServerHandle};
