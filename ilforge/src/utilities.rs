use std::io::{Cursor, Error, ErrorKind, Read};
use std::iter::repeat_with;

/// Positioned little-endian decoding out of a byte cursor.
///
/// `Deps` carries whatever sizing context the value needs; plain integers use
/// `()`, index types use the image's index-size record.
pub trait FromByteStream where Self: Sized {
	type Deps;
	fn read(stream: &mut Cursor<&[u8]>, deps: &Self::Deps) -> std::io::Result<Self>;
}

/// The symmetric encoding half. Writers append to a byte buffer; sizing must
/// be final before the first call (index widths never change mid-emission).
pub trait ToByteStream {
	type Deps;
	fn write(&self, buf: &mut Vec<u8>, deps: &Self::Deps);
}

macro_rules! impl_le_byte_stream {
	($($ty: ty),*) => {$(
		impl FromByteStream for $ty {
			type Deps = ();
			#[inline]
			fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
				let mut bytes = [0u8; std::mem::size_of::<Self>()];
				stream.read_exact(&mut bytes)?;
				Ok(Self::from_le_bytes(bytes))
			}
		}

		impl ToByteStream for $ty {
			type Deps = ();
			#[inline]
			fn write(&self, buf: &mut Vec<u8>, _: &Self::Deps) {
				buf.extend_from_slice(&self.to_le_bytes());
			}
		}
	)*};
}

impl_le_byte_stream!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl<const SIZE: usize> FromByteStream for [u8; SIZE] {
	type Deps = ();
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		let mut bytes = [0u8; SIZE];
		stream.read_exact(&mut bytes)?;
		Ok(bytes)
	}
}

impl<const SIZE: usize> ToByteStream for [u8; SIZE] {
	type Deps = ();
	#[inline]
	fn write(&self, buf: &mut Vec<u8>, _: &Self::Deps) {
		buf.extend_from_slice(self);
	}
}

/// Reads a little-endian unsigned value of the given byte width (2 or 4).
#[inline]
pub(crate) fn read_uint_of_size(stream: &mut Cursor<&[u8]>, size: usize) -> std::io::Result<u32> {
	let mut bytes = 0u32.to_le_bytes();
	stream.read_exact(&mut bytes[..size])?;
	Ok(u32::from_le_bytes(bytes))
}

/// Writes a little-endian unsigned value in the given byte width (2 or 4).
/// The value must fit; sizing guarantees it does.
#[inline]
pub(crate) fn write_uint_of_size(buf: &mut Vec<u8>, value: u32, size: usize) {
	debug_assert!(size == 4 || u32::from(value as u16) == value);
	buf.extend_from_slice(&value.to_le_bytes()[..size]);
}

/// The 1/2/4-byte variable-length unsigned encoding of ECMA-335 §II.23.2.
pub fn read_compressed_u32(stream: &mut Cursor<&[u8]>) -> std::io::Result<u32> {
	let first = u8::read(stream, &())?;
	match first {
		0x00..=0x7F => Ok(first as u32),
		0x80..=0xBF => {
			let second = u8::read(stream, &())?;
			Ok(((first as u32 & 0x3F) << 8) | second as u32)
		},
		0xC0..=0xDF => {
			let rest = <[u8; 3]>::read(stream, &())?;
			Ok(((first as u32 & 0x1F) << 24)
				| ((rest[0] as u32) << 16)
				| ((rest[1] as u32) << 8)
				| rest[2] as u32)
		},
		_ => Err(Error::from(ErrorKind::InvalidData)),
	}
}

/// Emits the shortest §II.23.2 encoding; values need at most 29 bits.
pub fn write_compressed_u32(buf: &mut Vec<u8>, value: u32) -> std::io::Result<()> {
	match value {
		0x00..=0x7F => buf.push(value as u8),
		0x80..=0x3FFF => {
			buf.push(0x80 | (value >> 8) as u8);
			buf.push(value as u8);
		},
		0x4000..=0x1FFF_FFFF => {
			buf.push(0xC0 | (value >> 24) as u8);
			buf.push((value >> 16) as u8);
			buf.push((value >> 8) as u8);
			buf.push(value as u8);
		},
		_ => return Err(Error::from(ErrorKind::InvalidInput)),
	}
	Ok(())
}

/// The signed variant: the value is rotated left by one within its width so
/// the sign bit lands in bit 0, then compressed as unsigned.
pub fn read_compressed_i32(stream: &mut Cursor<&[u8]>) -> std::io::Result<i32> {
	let start = stream.position();
	let unsigned = read_compressed_u32(stream)?;
	let width = (stream.position() - start) as u32;
	let payload_bits = match width {
		1 => 7,
		2 => 14,
		_ => 29,
	};
	let mut value = (unsigned >> 1) as i32;
	if unsigned & 1 != 0 {
		value -= 1 << (payload_bits - 1);
	}
	Ok(value)
}

pub fn write_compressed_i32(buf: &mut Vec<u8>, value: i32) -> std::io::Result<()> {
	let sign = (value < 0) as u32;
	let rotated = |bits: u32| ((value as u32) << 1 | sign) & ((1u32 << bits) - 1);
	// The rotated payload keeps its width even when the high bits are zero;
	// a narrower encoding would decode with the wrong sign position.
	match value {
		-0x40..=0x3F => buf.push(rotated(7) as u8),
		-0x2000..=0x1FFF => {
			let v = rotated(14);
			buf.push(0x80 | (v >> 8) as u8);
			buf.push(v as u8);
		},
		-0x1000_0000..=0x0FFF_FFFF => {
			let v = rotated(29);
			buf.push(0xC0 | (v >> 24) as u8);
			buf.push((v >> 16) as u8);
			buf.push((v >> 8) as u8);
			buf.push(v as u8);
		},
		_ => return Err(Error::from(ErrorKind::InvalidInput)),
	}
	Ok(())
}

#[inline]
pub(crate) const fn round_to_multiple_of<const MULTIPLE: usize>(value: usize) -> usize {
	((value + (MULTIPLE - 1)) / MULTIPLE) * MULTIPLE
}

/// Pads with zero bytes up to the next multiple of `MULTIPLE`.
pub(crate) fn pad_to_multiple_of<const MULTIPLE: usize>(buf: &mut Vec<u8>) {
	buf.resize(round_to_multiple_of::<MULTIPLE>(buf.len()), 0);
}

pub(crate) fn enumerate_set_bits(mut value: u64) -> impl Iterator<Item = usize> {
	repeat_with(move || match value.trailing_zeros() {
		64 => usize::MAX,
		idx => {
			value &= !(1u64 << idx);
			idx as usize
		},
	})
	.take_while(|i| *i != usize::MAX)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn u32_round_trip(value: u32) -> (u32, usize) {
		let mut buf = vec![];
		write_compressed_u32(&mut buf, value).unwrap();
		let len = buf.len();
		let mut stream = Cursor::new(buf.as_slice());
		(read_compressed_u32(&mut stream).unwrap(), len)
	}

	#[test]
	fn compressed_u32_boundaries() {
		for (value, len) in [
			(0u32, 1),
			(0x7F, 1),
			(0x80, 2),
			(0x3FFF, 2),
			(0x4000, 4),
			(0x1FFF_FFFE, 4),
		] {
			assert_eq!(u32_round_trip(value), (value, len));
		}
	}

	#[test]
	fn compressed_u32_rejects_out_of_range() {
		let mut buf = vec![];
		assert!(write_compressed_u32(&mut buf, 0x2000_0000).is_err());
	}

	#[test]
	fn compressed_i32_round_trips() {
		for value in [0, 1, -1, 3, -3, 63, -64, 64, -65, 8191, -8192, 8192, -8193,
			0x0FFF_FFFF, -0x1000_0000]
		{
			let mut buf = vec![];
			write_compressed_i32(&mut buf, value).unwrap();
			let mut stream = Cursor::new(buf.as_slice());
			assert_eq!(read_compressed_i32(&mut stream).unwrap(), value);
		}
	}

	#[test]
	fn compressed_i32_known_encodings() {
		// Worked examples from ECMA-335 §II.23.2.
		let mut buf = vec![];
		write_compressed_i32(&mut buf, 3).unwrap();
		assert_eq!(buf, [0x06]);
		buf.clear();
		write_compressed_i32(&mut buf, -3).unwrap();
		assert_eq!(buf, [0x7B]);
		buf.clear();
		write_compressed_i32(&mut buf, -8192).unwrap();
		assert_eq!(buf, [0x80, 0x01]);
	}

	#[test]
	fn set_bits_enumeration() {
		let bits: Vec<_> = enumerate_set_bits(0b1010_0001).collect();
		assert_eq!(bits, [0, 5, 7]);
		assert_eq!(enumerate_set_bits(0).count(), 0);
		assert_eq!(enumerate_set_bits(1 << 63).next(), Some(63));
	}
}
