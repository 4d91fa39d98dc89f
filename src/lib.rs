//! Reading, merging and querying of CFGDATA configuration blobs
//!
//! The [`cfg`] module holds the record codec, the blob parser, the array table reconciliation,
//! the multi-platform merge engine and the tag resolver.

pub mod cfg;
mod error;

pub use error::{CapacityError, Error, FormatError, SemanticError};
