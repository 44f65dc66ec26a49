//! Graylog log search over the Model Context Protocol.
//!
//! Searches are shaped for a model's context window: messages can be
//! deduplicated or grouped into templates, projected to chosen fields, and
//! every result is fitted into a byte budget before it is returned.

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod context;
pub mod dedup;
pub mod error;
pub mod fit;
pub mod graylog;
pub mod http;
pub mod mcp;
pub mod model;
pub mod projection;
pub mod search;
pub mod template;
pub mod tools;
