//! The on-disk layer: PE envelope, metadata streams, heaps, tables, indices
//! and the byte-level method body formats.

pub mod assembly;
pub mod heaps;
pub mod il;
pub mod indices;
pub mod pe;

pub use crate::utilities::{FromByteStream, ToByteStream};
