//! Reading and writing of Portable Executable images carrying ECMA-335 CLI
//! metadata.
//!
//! The crate is split in three layers:
//! - [`raw`] mirrors the on-disk layout: streams, heaps, the 45 metadata
//!   tables, coded indices and the byte-level method body formats.
//! - [`structured`] is the mutable object model: an [`Image`] owning classes,
//!   members, signatures and IL bodies, addressed by lightweight handles.
//! - `build` (internal) turns an [`Image`] back into a byte-exact PE image.
//!
//! ```no_run
//! use ilforge::{Image, LoadOptions};
//!
//! let bytes = std::fs::read("Library.dll").unwrap();
//! let image = Image::read(&bytes, &LoadOptions::default()).unwrap();
//! for class in image.classes() {
//! 	println!("{}", image.class_full_name(class));
//! }
//! ```

pub mod errors;
pub mod raw;
pub mod structured;

mod build;
mod utilities;

pub use errors::{Error, Result};
pub use raw::heaps::table::{
	AssemblyFlags, AssemblyHashAlgorithm, EventAttributes, FieldAttributes, FileAttributes,
	GenericParamAttributes, ManifestResourceAttributes, MethodAttributes, MethodImplAttributes,
	MethodSemanticsAttributes, PInvokeAttributes, ParamAttributes, PropertyAttributes,
	TypeAttributes,
};
pub use structured::body::{EhClause, EhKind, Instruction, Label, MethodBody, SwitchTargets};
pub use structured::image::{Image, LoadOptions};
pub use structured::members::*;
pub use structured::signatures::{
	CallingConvention, FieldSig, LocalVar, MemberRefSig, MethodSig, PropertySig,
};
pub use structured::types::*;
