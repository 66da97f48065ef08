//! The CLI header and the metadata root: the stream directory that locates
//! `#~`, `#Strings`, `#US`, `#GUID` and `#Blob` inside the image.

use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};

use crate::raw::pe::DataDirectory;
use crate::utilities::{pad_to_multiple_of, round_to_multiple_of, FromByteStream, ToByteStream};

pub const METADATA_SIGNATURE: u32 = 0x424A_5342;
pub const METADATA_VERSION: &str = "v2.0.50727";
pub const CLI_HEADER_SIZE: u32 = 72;

pub const RUNTIME_FLAG_IL_ONLY: u32 = 0x0000_0001;
pub const RUNTIME_FLAG_STRONG_NAME_SIGNED: u32 = 0x0000_0008;

/// The fixed-size CLI header the PE's 15th data directory points at.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct CliHeader {
	pub major_runtime_version: u16,
	pub minor_runtime_version: u16,
	pub metadata: DataDirectory,
	pub flags: u32,
	pub entry_point_token: u32,
	pub resources: DataDirectory,
	pub strong_name_signature: DataDirectory,
}

impl FromByteStream for CliHeader {
	type Deps = ();
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		if u32::read(stream, &())? != CLI_HEADER_SIZE {
			return Err(ErrorKind::InvalidData.into());
		}
		let header = Self {
			major_runtime_version: u16::read(stream, &())?,
			minor_runtime_version: u16::read(stream, &())?,
			metadata: DataDirectory::read(stream, &())?,
			flags: u32::read(stream, &())?,
			entry_point_token: u32::read(stream, &())?,
			resources: DataDirectory::read(stream, &())?,
			strong_name_signature: DataDirectory::read(stream, &())?,
		};
		// CodeManagerTable, VTableFixups, ExportAddressTableJumps and
		// ManagedNativeHeader are reserved.
		stream.seek(SeekFrom::Current(32))?;
		Ok(header)
	}
}

impl ToByteStream for CliHeader {
	type Deps = ();
	fn write(&self, buf: &mut Vec<u8>, _: &Self::Deps) {
		CLI_HEADER_SIZE.write(buf, &());
		self.major_runtime_version.write(buf, &());
		self.minor_runtime_version.write(buf, &());
		self.metadata.write(buf, &());
		self.flags.write(buf, &());
		self.entry_point_token.write(buf, &());
		self.resources.write(buf, &());
		self.strong_name_signature.write(buf, &());
		buf.extend_from_slice(&[0u8; 32]);
	}
}

/// The parsed metadata root: version string plus the named stream slices.
#[derive(Debug)]
pub struct MetadataRoot<'l> {
	pub major_version: u16,
	pub minor_version: u16,
	pub version: &'l str,
	pub streams: Vec<(&'l str, &'l [u8])>,
}

impl<'l> MetadataRoot<'l> {
	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn read(data: &'l [u8]) -> std::io::Result<Self> {
		let mut stream = Cursor::new(data);
		if u32::read(&mut stream, &())? != METADATA_SIGNATURE {
			return Err(ErrorKind::InvalidData.into());
		}
		let major_version = u16::read(&mut stream, &())?;
		let minor_version = u16::read(&mut stream, &())?;
		stream.seek(SeekFrom::Current(4))?; // Reserved

		let length = round_to_multiple_of::<4>(u32::read(&mut stream, &())? as usize);
		let mut bytes = vec![0u8; length];
		stream.read_exact(&mut bytes)?;
		let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
		let start = stream.position() as usize - length;
		let Ok(version) = std::str::from_utf8(&data[start..start + end]) else {
			return Err(ErrorKind::InvalidData.into());
		};

		let _flags = u16::read(&mut stream, &())?;
		let stream_count = u16::read(&mut stream, &())? as usize;

		let mut streams = Vec::with_capacity(stream_count);
		for _ in 0..stream_count {
			let offset = u32::read(&mut stream, &())? as usize;
			let size = u32::read(&mut stream, &())? as usize;

			let name_start = stream.position() as usize;
			let name_bytes = data.get(name_start..).ok_or(ErrorKind::UnexpectedEof)?;
			let name_end = name_bytes
				.iter()
				.take(32)
				.position(|b| *b == 0)
				.ok_or(ErrorKind::InvalidData)?;
			let Ok(name) = std::str::from_utf8(&name_bytes[..name_end]) else {
				return Err(ErrorKind::InvalidData.into());
			};
			stream.seek(SeekFrom::Start(
				(name_start + round_to_multiple_of::<4>(name_end + 1)) as u64,
			))?;

			let Some(bytes) = data.get(offset..offset + size) else {
				return Err(ErrorKind::InvalidData.into());
			};
			streams.push((name, bytes));
		}

		Ok(Self {
			major_version,
			minor_version,
			version,
			streams,
		})
	}

	/// Looks a stream up by name; `#~` also answers for the legacy `#-`
	/// spelling.
	pub fn stream(&self, name: &str) -> Option<&'l [u8]> {
		self.streams.iter().find_map(|(n, bytes)| match *n == name {
			true => Some(*bytes),
			false => (name == "#~" && *n == "#-").then_some(*bytes),
		})
	}
}

/// Assembles the metadata root around the given streams, each padded to a
/// 4-byte boundary. Stream order is the caller's; the canonical emission
/// order is `#~`, `#Strings`, `#US`, `#GUID`, `#Blob`.
pub fn write_metadata_root(buf: &mut Vec<u8>, streams: &[(&str, &[u8])]) {
	let version_field = round_to_multiple_of::<4>(METADATA_VERSION.len() + 1);
	let mut directory_size = 0;
	for (name, _) in streams {
		directory_size += 8 + round_to_multiple_of::<4>(name.len() + 1);
	}
	let header_size = 16 + version_field + 4 + directory_size;

	let start = buf.len();
	METADATA_SIGNATURE.write(buf, &());
	1u16.write(buf, &());
	1u16.write(buf, &());
	0u32.write(buf, &());
	(version_field as u32).write(buf, &());
	buf.extend_from_slice(METADATA_VERSION.as_bytes());
	buf.resize(start + 16 + version_field, 0);
	0u16.write(buf, &());
	(streams.len() as u16).write(buf, &());

	let mut offset = header_size;
	for (name, bytes) in streams {
		(offset as u32).write(buf, &());
		let padded = round_to_multiple_of::<4>(bytes.len());
		(padded as u32).write(buf, &());
		buf.extend_from_slice(name.as_bytes());
		buf.push(0);
		pad_to_multiple_of::<4>(buf);
		offset += padded;
	}

	for (_, bytes) in streams {
		buf.extend_from_slice(bytes);
		pad_to_multiple_of::<4>(buf);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cli_header_round_trips() {
		let header = CliHeader {
			major_runtime_version: 2,
			minor_runtime_version: 5,
			metadata: DataDirectory { virtual_address: 0x2100, size: 0x400 },
			flags: RUNTIME_FLAG_IL_ONLY,
			entry_point_token: 0x0600_0001,
			resources: DataDirectory::default(),
			strong_name_signature: DataDirectory::default(),
		};
		let mut buf = vec![];
		header.write(&mut buf, &());
		assert_eq!(buf.len(), CLI_HEADER_SIZE as usize);
		let mut stream = Cursor::new(buf.as_slice());
		assert_eq!(CliHeader::read(&mut stream, &()).unwrap(), header);
	}

	#[test]
	fn metadata_root_round_trips() {
		let tables = [1u8, 2, 3];
		let strings = [0u8, b'a', 0];
		let mut buf = vec![];
		write_metadata_root(&mut buf, &[("#~", &tables), ("#Strings", &strings)]);

		let root = MetadataRoot::read(&buf).unwrap();
		assert_eq!(root.version, METADATA_VERSION);
		assert_eq!(root.streams.len(), 2);
		assert_eq!(&root.stream("#~").unwrap()[..3], &tables);
		assert_eq!(&root.stream("#Strings").unwrap()[..3], &strings);
	}

	#[test]
	fn stream_lookup_accepts_legacy_tables_name() {
		let tables = [9u8];
		let mut buf = vec![];
		write_metadata_root(&mut buf, &[("#-", &tables)]);
		let root = MetadataRoot::read(&buf).unwrap();
		assert_eq!(root.stream("#~").unwrap()[0], 9);
	}
}
