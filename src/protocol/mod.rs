//! # Protocol Layer
//!
//! Packet routing: filters, handlers, groups and the dispatch algorithm,
//! plus the fault taxonomy reported to the customizable fault hook.
//!
//! ## Dispatch Order
//! ```text
//! priority (desc) -> specificity (desc) -> registration order (asc)
//! ```

pub mod dispatcher;
pub mod fault;
pub mod filter;
pub mod handler;
