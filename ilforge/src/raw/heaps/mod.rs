use std::io::Cursor;

pub use crate::raw::heaps::blob::{BlobHeap, UserStringHeap};
pub use crate::raw::heaps::guid::GuidHeap;
pub use crate::raw::heaps::string::StringHeap;

use crate::raw::indices::sizes::{IndexSizes, SizeOf};
use crate::utilities::{read_uint_of_size, write_uint_of_size, FromByteStream, ToByteStream};

pub mod blob;
pub mod guid;
pub mod string;
pub mod table;

macro_rules! define_heap_index {
	($($(#[$attr: meta])* $id: ident => $field: ident),*) => {$(
		$(#[$attr])*
		#[repr(transparent)]
		#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
		pub struct $id(pub u32);

		impl $id {
			#[inline]
			pub fn is_null(&self) -> bool {
				self.0 == 0
			}
		}

		impl FromByteStream for $id {
			type Deps = IndexSizes;
			fn read(stream: &mut Cursor<&[u8]>, sizes: &Self::Deps) -> std::io::Result<Self> {
				Ok(Self(read_uint_of_size(stream, sizes.$field)?))
			}
		}

		impl ToByteStream for $id {
			type Deps = IndexSizes;
			fn write(&self, buf: &mut Vec<u8>, sizes: &Self::Deps) {
				write_uint_of_size(buf, self.0, sizes.$field);
			}
		}

		impl SizeOf<$id> for IndexSizes {
			#[inline]
			fn size_of(&self) -> usize {
				self.$field
			}
		}
	)*};
}

define_heap_index! {
	/// Byte offset into #Strings; 0 is the empty string.
	StringIndex => string,
	/// Byte offset into #Blob; 0 is the empty blob.
	BlobIndex => blob,
	/// 1-based ordinal into #GUID; 0 means absent.
	GuidIndex => guid
}

pub(crate) struct SizeDebugWrapper(pub usize);

impl std::fmt::Debug for SizeDebugWrapper {
	#[inline]
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("[u8; ")?;
		std::fmt::Debug::fmt(&self.0, f)?;
		f.write_str("]")
	}
}
