use std::fmt::{Debug, Formatter};
use std::io::Cursor;

use crate::raw::heaps::{BlobIndex, SizeDebugWrapper};
use crate::utilities::read_compressed_u32;

/// Borrowed view over a #Blob stream: compressed-length-prefixed opaque byte
/// sequences, with the empty blob at offset 0.
#[derive(Copy, Clone)]
pub struct BlobHeap<'l> {
	data: &'l [u8],
}

impl<'l> From<&'l [u8]> for BlobHeap<'l> {
	fn from(data: &'l [u8]) -> Self {
		Self { data }
	}
}

impl<'l> BlobHeap<'l> {
	pub fn get(&self, idx: BlobIndex) -> Option<&'l [u8]> {
		let mut stream = Cursor::new(self.data.get(idx.0 as usize..)?);
		let len = read_compressed_u32(&mut stream).ok()? as usize;
		let start = stream.position() as usize;
		stream.get_ref().get(start..start + len)
	}
}

impl Debug for BlobHeap<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("BlobHeap");
		dbg.field("data", &SizeDebugWrapper(self.data.len()));
		dbg.finish()
	}
}

/// Borrowed view over a #US stream: compressed-length-prefixed UTF-16LE plus
/// a terminal flag byte, addressed by byte offset from IL `ldstr` tokens.
#[derive(Copy, Clone)]
pub struct UserStringHeap<'l> {
	data: &'l [u8],
}

impl<'l> From<&'l [u8]> for UserStringHeap<'l> {
	fn from(data: &'l [u8]) -> Self {
		Self { data }
	}
}

impl<'l> UserStringHeap<'l> {
	pub fn get(&self, offset: u32) -> Option<String> {
		let mut stream = Cursor::new(self.data.get(offset as usize..)?);
		let len = read_compressed_u32(&mut stream).ok()? as usize;
		if len == 0 {
			return Some(String::new());
		}
		// The length covers the UTF-16 bytes plus the flag byte.
		let start = stream.position() as usize;
		let bytes = stream.get_ref().get(start..start + len - 1)?;
		let units: Vec<u16> = bytes
			.chunks_exact(2)
			.map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
			.collect();
		String::from_utf16(&units).ok()
	}
}

impl Debug for UserStringHeap<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("UserStringHeap");
		dbg.field("data", &SizeDebugWrapper(self.data.len()));
		dbg.finish()
	}
}
