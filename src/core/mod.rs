//! # Core Protocol Components
//!
//! Framing, payload encodings and the data model shared by every layer.
//!
//! ## Components
//! - **Codec**: length-prefixed frame codec for `tokio_util::codec::Framed`
//! - **Serialization**: JSON / MessagePack payload codecs
//! - **Packet / Client**: decoded packets and non-owning connection handles
//! - **Address**: IP patterns used by bans and filters
//!
//! ## Wire Format
//! ```text
//! [Length(1|2|4, big or little endian)] [Payload(Length)]
//! ```
//!
//! ## Security
//! - Maximum payload size enforced on the header, before any payload is buffered
//! - Oversized headers abort the connection instead of resynchronizing

pub mod address;
pub mod client;
pub mod codec;
pub mod packet;
pub mod serialization;
