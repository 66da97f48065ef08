//! The PE/COFF envelope around the CLI metadata: just enough structure to
//! map RVAs into section bytes on read, and a minimal single-section image
//! writer for emission.

use std::io::{Cursor, Error, ErrorKind, Seek, SeekFrom};

use crate::utilities::{pad_to_multiple_of, round_to_multiple_of, FromByteStream, ToByteStream};

pub const DOS_MAGIC: u16 = 0x5A4D;
pub const PE_MAGIC: u32 = 0x0000_4550;
pub const OPTIONAL_MAGIC_PE32: u16 = 0x010B;
pub const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x020B;

/// Index of the CLI header entry in the optional header's directory table.
pub const CLI_HEADER_DIRECTORY: usize = 14;

pub const SECTION_ALIGNMENT: u32 = 0x2000;
pub const FILE_ALIGNMENT: u32 = 0x200;
pub const IMAGE_BASE: u32 = 0x0040_0000;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct DataDirectory {
	pub virtual_address: u32,
	pub size: u32,
}

impl FromByteStream for DataDirectory {
	type Deps = ();
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		Ok(Self {
			virtual_address: u32::read(stream, &())?,
			size: u32::read(stream, &())?,
		})
	}
}

impl ToByteStream for DataDirectory {
	type Deps = ();
	fn write(&self, buf: &mut Vec<u8>, _: &Self::Deps) {
		self.virtual_address.write(buf, &());
		self.size.write(buf, &());
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SectionHeader {
	pub name: [u8; 8],
	pub virtual_size: u32,
	pub virtual_address: u32,
	pub size_of_raw_data: u32,
	pub pointer_to_raw_data: u32,
	pub pointer_to_relocations: u32,
	pub pointer_to_line_numbers: u32,
	pub number_of_relocations: u16,
	pub number_of_line_numbers: u16,
	pub characteristics: u32,
}

impl FromByteStream for SectionHeader {
	type Deps = ();
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		Ok(Self {
			name: <[u8; 8]>::read(stream, &())?,
			virtual_size: u32::read(stream, &())?,
			virtual_address: u32::read(stream, &())?,
			size_of_raw_data: u32::read(stream, &())?,
			pointer_to_raw_data: u32::read(stream, &())?,
			pointer_to_relocations: u32::read(stream, &())?,
			pointer_to_line_numbers: u32::read(stream, &())?,
			number_of_relocations: u16::read(stream, &())?,
			number_of_line_numbers: u16::read(stream, &())?,
			characteristics: u32::read(stream, &())?,
		})
	}
}

impl ToByteStream for SectionHeader {
	type Deps = ();
	fn write(&self, buf: &mut Vec<u8>, _: &Self::Deps) {
		self.name.write(buf, &());
		self.virtual_size.write(buf, &());
		self.virtual_address.write(buf, &());
		self.size_of_raw_data.write(buf, &());
		self.pointer_to_raw_data.write(buf, &());
		self.pointer_to_relocations.write(buf, &());
		self.pointer_to_line_numbers.write(buf, &());
		self.number_of_relocations.write(buf, &());
		self.number_of_line_numbers.write(buf, &());
		self.characteristics.write(buf, &());
	}
}

#[derive(Debug)]
pub struct Section<'l> {
	pub header: SectionHeader,
	pub data: &'l [u8],
}

impl Section<'_> {
	fn contains_rva(&self, rva: u32) -> bool {
		let size = self.header.virtual_size.max(self.header.size_of_raw_data);
		rva >= self.header.virtual_address && rva - self.header.virtual_address < size
	}
}

/// A parsed PE image: section table plus the optional header's directory
/// entries, borrowing the backing buffer.
#[derive(Debug)]
pub struct PeFile<'l> {
	pub machine: u16,
	pub characteristics: u16,
	pub data_directories: Vec<DataDirectory>,
	pub sections: Vec<Section<'l>>,
}

impl<'l> PeFile<'l> {
	/// Maps an RVA to the bytes from that address to the end of its section.
	pub fn resolve_rva(&self, rva: u32) -> Option<&'l [u8]> {
		let section = self.sections.iter().find(|s| s.contains_rva(rva))?;
		let offset = (rva - section.header.virtual_address) as usize;
		section.data.get(offset..)
	}

	pub fn cli_header_directory(&self) -> Option<DataDirectory> {
		let dir = *self.data_directories.get(CLI_HEADER_DIRECTORY)?;
		(dir.virtual_address != 0).then_some(dir)
	}

	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn read(data: &'l [u8]) -> std::io::Result<Self> {
		let mut stream = Cursor::new(data);
		if u16::read(&mut stream, &())? != DOS_MAGIC {
			return Err(ErrorKind::InvalidData.into());
		}
		stream.seek(SeekFrom::Start(0x3C))?;
		let new_header_start = u32::read(&mut stream, &())?;
		stream.seek(SeekFrom::Start(new_header_start as u64))?;
		if u32::read(&mut stream, &())? != PE_MAGIC {
			return Err(ErrorKind::InvalidData.into());
		}

		let machine = u16::read(&mut stream, &())?;
		let number_of_sections = u16::read(&mut stream, &())?;
		let _time_date_stamp = u32::read(&mut stream, &())?;
		let _pointer_to_symbol_table = u32::read(&mut stream, &())?;
		let _number_of_symbols = u32::read(&mut stream, &())?;
		let size_of_optional_header = u16::read(&mut stream, &())?;
		let characteristics = u16::read(&mut stream, &())?;

		let optional_start = stream.position();
		let magic = u16::read(&mut stream, &())?;
		let directories_offset = match magic {
			OPTIONAL_MAGIC_PE32 => 96,
			OPTIONAL_MAGIC_PE32_PLUS => 112,
			_ => return Err(Error::from(ErrorKind::InvalidData)),
		};

		stream.seek(SeekFrom::Start(optional_start + directories_offset - 4))?;
		let directory_count = u32::read(&mut stream, &())? as usize;
		if directories_offset as usize + directory_count * 8
			> size_of_optional_header as usize
		{
			return Err(Error::from(ErrorKind::InvalidData));
		}
		let mut data_directories = Vec::with_capacity(directory_count);
		for _ in 0..directory_count {
			data_directories.push(DataDirectory::read(&mut stream, &())?);
		}

		stream.seek(SeekFrom::Start(optional_start + size_of_optional_header as u64))?;
		let mut sections = Vec::with_capacity(number_of_sections as usize);
		for _ in 0..number_of_sections {
			let header = SectionHeader::read(&mut stream, &())?;
			let start = header.pointer_to_raw_data as usize;
			let end = start + header.size_of_raw_data as usize;
			let Some(section_data) = data.get(start..end) else {
				return Err(Error::from(ErrorKind::InvalidData));
			};
			sections.push(Section {
				header,
				data: section_data,
			});
		}

		Ok(Self {
			machine,
			characteristics,
			data_directories,
			sections,
		})
	}
}

/// The canonical MS-DOS stub every emitted image carries (header + code that
/// prints "This program cannot be run in DOS mode").
const DOS_STUB: [u8; 128] = [
	0x4D, 0x5A, 0x90, 0x00, 0x03, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00,
	0xB8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
	0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
	0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00,
	0x0E, 0x1F, 0xBA, 0x0E, 0x00, 0xB4, 0x09, 0xCD, 0x21, 0xB8, 0x01, 0x4C, 0xCD, 0x21, 0x54, 0x68,
	0x69, 0x73, 0x20, 0x70, 0x72, 0x6F, 0x67, 0x72, 0x61, 0x6D, 0x20, 0x63, 0x61, 0x6E, 0x6E, 0x6F,
	0x74, 0x20, 0x62, 0x65, 0x20, 0x72, 0x75, 0x6E, 0x20, 0x69, 0x6E, 0x20, 0x44, 0x4F, 0x53, 0x20,
	0x6D, 0x6F, 0x64, 0x65, 0x2E, 0x0D, 0x0D, 0x0A, 0x24, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
const IMAGE_FILE_32BIT_MACHINE: u16 = 0x0100;
const IMAGE_FILE_DLL: u16 = 0x2000;

const TEXT_CHARACTERISTICS: u32 = 0x6000_0020; // code | execute | read

/// The RVA where the single `.text` section (and thus the CLI header) lands.
pub const TEXT_RVA: u32 = SECTION_ALIGNMENT;

/// Wraps a finished `.text` payload (CLI header first) into a deterministic
/// PE32 image with a single section.
pub fn write_image(text: &[u8], dll: bool) -> Vec<u8> {
	let headers_size = FILE_ALIGNMENT as usize;
	let text_raw_size = round_to_multiple_of::<{ FILE_ALIGNMENT as usize }>(text.len());
	let size_of_image = TEXT_RVA
		+ round_to_multiple_of::<{ SECTION_ALIGNMENT as usize }>(text.len()) as u32;

	let mut buf = Vec::with_capacity(headers_size + text_raw_size);
	buf.extend_from_slice(&DOS_STUB);

	PE_MAGIC.write(&mut buf, &());
	0x014Cu16.write(&mut buf, &()); // i386
	1u16.write(&mut buf, &()); // one section
	0u32.write(&mut buf, &()); // timestamp fixed for reproducible output
	0u32.write(&mut buf, &());
	0u32.write(&mut buf, &());
	0x00E0u16.write(&mut buf, &()); // PE32 optional header size
	let mut characteristics = IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_32BIT_MACHINE;
	if dll {
		characteristics |= IMAGE_FILE_DLL;
	}
	characteristics.write(&mut buf, &());

	OPTIONAL_MAGIC_PE32.write(&mut buf, &());
	buf.push(8); // linker major
	buf.push(0); // linker minor
	(text_raw_size as u32).write(&mut buf, &()); // size of code
	0u32.write(&mut buf, &()); // size of initialized data
	0u32.write(&mut buf, &()); // size of uninitialized data
	0u32.write(&mut buf, &()); // entry point: managed images start via the CLI header
	TEXT_RVA.write(&mut buf, &()); // base of code
	0u32.write(&mut buf, &()); // base of data
	IMAGE_BASE.write(&mut buf, &());
	SECTION_ALIGNMENT.write(&mut buf, &());
	FILE_ALIGNMENT.write(&mut buf, &());
	4u16.write(&mut buf, &()); // OS major
	0u16.write(&mut buf, &());
	0u16.write(&mut buf, &()); // image version
	0u16.write(&mut buf, &());
	4u16.write(&mut buf, &()); // subsystem major
	0u16.write(&mut buf, &());
	0u32.write(&mut buf, &()); // win32 version
	size_of_image.write(&mut buf, &());
	(headers_size as u32).write(&mut buf, &());
	0u32.write(&mut buf, &()); // checksum
	3u16.write(&mut buf, &()); // console subsystem
	0x0540u16.write(&mut buf, &()); // dynamic base | NX compatible | no SEH
	0x0010_0000u32.write(&mut buf, &()); // stack reserve
	0x0000_1000u32.write(&mut buf, &()); // stack commit
	0x0010_0000u32.write(&mut buf, &()); // heap reserve
	0x0000_1000u32.write(&mut buf, &()); // heap commit
	0u32.write(&mut buf, &()); // loader flags
	16u32.write(&mut buf, &()); // directory count

	for i in 0..16 {
		let dir = match i {
			CLI_HEADER_DIRECTORY => DataDirectory {
				virtual_address: TEXT_RVA,
				size: super::assembly::CLI_HEADER_SIZE,
			},
			_ => DataDirectory::default(),
		};
		dir.write(&mut buf, &());
	}

	SectionHeader {
		name: *b".text\0\0\0",
		virtual_size: text.len() as u32,
		virtual_address: TEXT_RVA,
		size_of_raw_data: text_raw_size as u32,
		pointer_to_raw_data: headers_size as u32,
		pointer_to_relocations: 0,
		pointer_to_line_numbers: 0,
		number_of_relocations: 0,
		number_of_line_numbers: 0,
		characteristics: TEXT_CHARACTERISTICS,
	}
	.write(&mut buf, &());

	buf.resize(headers_size, 0);
	buf.extend_from_slice(text);
	pad_to_multiple_of::<{ FILE_ALIGNMENT as usize }>(&mut buf);
	buf
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn written_image_parses_back() {
		let text = vec![0xABu8; 100];
		let bytes = write_image(&text, true);
		let pe = PeFile::read(&bytes).unwrap();
		assert_eq!(pe.sections.len(), 1);
		assert_eq!(pe.cli_header_directory().unwrap().virtual_address, TEXT_RVA);
		let resolved = pe.resolve_rva(TEXT_RVA).unwrap();
		assert_eq!(&resolved[..100], text.as_slice());
		assert_eq!(pe.characteristics & IMAGE_FILE_DLL, IMAGE_FILE_DLL);
	}

	#[test]
	fn rva_resolution_bounds() {
		let bytes = write_image(&[1, 2, 3], false);
		let pe = PeFile::read(&bytes).unwrap();
		assert!(pe.resolve_rva(0x1000).is_none());
		assert_eq!(pe.resolve_rva(TEXT_RVA + 2).unwrap()[0], 3);
	}
}
