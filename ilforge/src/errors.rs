use thiserror::Error;

use crate::raw::indices::metadata_token::MetadataToken;

/// The error type shared by the load and build pipelines.
///
/// Loads are transactional per image and builds are transactional per
/// emission: on any error the partially constructed state is discarded and no
/// bytes are produced.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
	/// A stream header, row width or heap is inconsistent with the image.
	#[error("malformed image: {0}")]
	MalformedImage(&'static str),

	/// A token or coded index refers to a row that does not exist.
	#[error("token {0:?} is out of range")]
	IndexOutOfRange(MetadataToken),

	/// A blob violates the signature grammar.
	#[error("invalid signature: {0}")]
	Signature(&'static str),

	/// An unknown opcode byte inside a method body.
	#[error("invalid opcode {0:#04x}")]
	InvalidOpcode(u16),

	/// An attempt to add a second field or method with an identical name and
	/// signature to a class. The image is left unchanged; the existing
	/// descriptor can be looked up instead.
	#[error("duplicate descriptor `{0}`")]
	DuplicateDescriptor(String),

	/// A label referenced by an instruction or handler clause was never
	/// bound to a position in the body.
	#[error("unresolved label")]
	UnresolvedLabel(crate::structured::body::Label),

	/// A phase was entered out of order.
	#[error("contract violation: {0}")]
	ContractViolation(&'static str),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	/// Maps low-level stream errors onto [`Error::MalformedImage`], keeping
	/// genuine I/O failures intact.
	pub(crate) fn from_stream(err: std::io::Error, what: &'static str) -> Self {
		use std::io::ErrorKind;
		match err.kind() {
			ErrorKind::UnexpectedEof | ErrorKind::InvalidData | ErrorKind::InvalidInput => {
				Error::MalformedImage(what)
			},
			_ => Error::Io(err),
		}
	}
}
