//! The mutable object model: an [`image::Image`] owning every entity of an
//! assembly, addressed by lightweight copyable handles.

pub mod body;
pub mod image;
pub mod members;
pub mod signatures;
pub mod types;

pub(crate) mod loader;
