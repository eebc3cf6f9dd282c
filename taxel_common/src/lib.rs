//! Taxel Common Library
//!
//! Shared constants and data layout definitions for the taxel service
//! middleware. This crate is the single source of truth for everything
//! that crosses a process boundary: the element-buffer header, the
//! record schema and the request/response tag values.
//!
//! # Module Structure
//!
//! - [`consts`] - Buffer sizing and naming constants
//! - [`header`] - The shared `BufferHeader` layout
//! - [`record`] - The [`record::Record`] trait and stock record types
//! - [`tags`] - Request/response tag values

pub mod consts;
pub mod header;
pub mod record;
pub mod tags;
