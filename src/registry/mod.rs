//! # Shared Registries
//!
//! Process-wide state owned by the server and shared with every connection:
//! bans, sessions and API keys. Each registry guards itself with its own lock;
//! no operation holds two registry locks at once.

pub mod api_key;
pub mod ban;
pub mod session;
