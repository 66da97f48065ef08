//! Append-only heap builders for emission. Interning is pure: the same
//! value always yields the same offset, and offset 0 stays reserved for the
//! empty entry.

use fxhash::FxHashMap;
use uuid::Uuid;

use crate::raw::heaps::{BlobIndex, GuidIndex, StringIndex};
use crate::utilities::write_compressed_u32;

#[derive(Debug)]
pub(crate) struct StringsBuilder {
	data: Vec<u8>,
	map: FxHashMap<Box<str>, u32>,
}

impl StringsBuilder {
	pub fn new() -> Self {
		Self {
			data: vec![0],
			map: FxHashMap::default(),
		}
	}

	pub fn intern(&mut self, value: &str) -> StringIndex {
		if value.is_empty() {
			return StringIndex(0);
		}
		if let Some(offset) = self.map.get(value) {
			return StringIndex(*offset);
		}
		let offset = self.data.len() as u32;
		self.data.extend_from_slice(value.as_bytes());
		self.data.push(0);
		self.map.insert(value.into(), offset);
		StringIndex(offset)
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn into_bytes(self) -> Vec<u8> {
		self.data
	}
}

#[derive(Debug)]
pub(crate) struct BlobsBuilder {
	data: Vec<u8>,
	map: FxHashMap<Vec<u8>, u32>,
}

impl BlobsBuilder {
	pub fn new() -> Self {
		Self {
			data: vec![0],
			map: FxHashMap::default(),
		}
	}

	pub fn intern(&mut self, value: &[u8]) -> std::io::Result<BlobIndex> {
		if value.is_empty() {
			return Ok(BlobIndex(0));
		}
		if let Some(offset) = self.map.get(value) {
			return Ok(BlobIndex(*offset));
		}
		let offset = self.data.len() as u32;
		write_compressed_u32(&mut self.data, value.len() as u32)?;
		self.data.extend_from_slice(value);
		self.map.insert(value.to_vec(), offset);
		Ok(BlobIndex(offset))
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn into_bytes(self) -> Vec<u8> {
		self.data
	}
}

#[derive(Debug)]
pub(crate) struct UserStringsBuilder {
	data: Vec<u8>,
	map: FxHashMap<Box<str>, u32>,
}

impl UserStringsBuilder {
	pub fn new() -> Self {
		Self {
			data: vec![0],
			map: FxHashMap::default(),
		}
	}

	/// Interns a string and returns its byte offset, the low 24 bits of the
	/// `ldstr` token referring to it.
	pub fn intern(&mut self, value: &str) -> std::io::Result<u32> {
		if let Some(offset) = self.map.get(value) {
			return Ok(*offset);
		}
		let units: Vec<u16> = value.encode_utf16().collect();
		let offset = self.data.len() as u32;
		write_compressed_u32(&mut self.data, units.len() as u32 * 2 + 1)?;
		for unit in &units {
			self.data.extend_from_slice(&unit.to_le_bytes());
		}
		self.data.push(user_string_flag(&units));
		self.map.insert(value.into(), offset);
		Ok(offset)
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn into_bytes(self) -> Vec<u8> {
		self.data
	}
}

/// The trailing flag byte of a #US entry (ECMA-335 §II.24.2.4): 1 when any
/// UTF-16 unit has bits in its top byte or its low byte needs special
/// handling.
fn user_string_flag(units: &[u16]) -> u8 {
	let special = units.iter().any(|&unit| {
		unit & 0xFF00 != 0
			|| matches!(unit as u8, 0x01..=0x08 | 0x0E..=0x1F | 0x27 | 0x2D | 0x7F)
	});
	special as u8
}

#[derive(Debug)]
pub(crate) struct GuidsBuilder {
	data: Vec<u8>,
	map: FxHashMap<Uuid, u32>,
}

impl GuidsBuilder {
	pub fn new() -> Self {
		Self {
			data: vec![],
			map: FxHashMap::default(),
		}
	}

	pub fn intern(&mut self, value: Uuid) -> GuidIndex {
		if let Some(ordinal) = self.map.get(&value) {
			return GuidIndex(*ordinal);
		}
		let ordinal = self.data.len() as u32 / 16 + 1;
		self.data.extend_from_slice(&value.to_bytes_le());
		self.map.insert(value, ordinal);
		GuidIndex(ordinal)
	}

	pub fn into_bytes(self) -> Vec<u8> {
		self.data
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn string_interning_is_idempotent() {
		let mut strings = StringsBuilder::new();
		assert_eq!(strings.intern(""), StringIndex(0));
		let a = strings.intern("Program");
		let b = strings.intern("Main");
		assert_eq!(strings.intern("Program"), a);
		assert_ne!(a, b);
		let bytes = strings.into_bytes();
		assert_eq!(bytes[0], 0);
		assert_eq!(&bytes[a.0 as usize..a.0 as usize + 8], b"Program\0");
	}

	#[test]
	fn blob_interning_prefixes_length() {
		let mut blobs = BlobsBuilder::new();
		assert_eq!(blobs.intern(&[]).unwrap(), BlobIndex(0));
		let idx = blobs.intern(&[1, 2, 3]).unwrap();
		assert_eq!(blobs.intern(&[1, 2, 3]).unwrap(), idx);
		let bytes = blobs.into_bytes();
		assert_eq!(&bytes[idx.0 as usize..], &[3, 1, 2, 3]);
	}

	#[test]
	fn user_string_entry_layout() {
		let mut us = UserStringsBuilder::new();
		let offset = us.intern("hi").unwrap();
		assert_eq!(us.intern("hi").unwrap(), offset);
		let bytes = us.into_bytes();
		// length 5 = two UTF-16 units + flag byte, flag clear for ASCII.
		assert_eq!(&bytes[offset as usize..], &[5, b'h', 0, b'i', 0, 0]);
	}

	#[test]
	fn user_string_flag_byte() {
		assert_eq!(user_string_flag(&[b'a' as u16]), 0);
		assert_eq!(user_string_flag(&[0x2D]), 1);
		assert_eq!(user_string_flag(&[0x7F]), 1);
		assert_eq!(user_string_flag(&[0x03A9]), 1); // Ω
		assert_eq!(user_string_flag(&[0x7E]), 0);
	}

	#[test]
	fn guid_interning_is_one_based() {
		let mut guids = GuidsBuilder::new();
		let a = guids.intern(Uuid::from_u128(1));
		let b = guids.intern(Uuid::from_u128(2));
		assert_eq!(a, GuidIndex(1));
		assert_eq!(b, GuidIndex(2));
		assert_eq!(guids.intern(Uuid::from_u128(1)), a);
		assert_eq!(guids.into_bytes().len(), 32);
	}
}
