//! Byte-level method body formats: the tiny and fat headers and the
//! exception-handling data sections that may trail the IL.

use std::io::{Cursor, Error, ErrorKind, Seek, SeekFrom};

use crate::utilities::{FromByteStream, ToByteStream};

pub const HEADER_TINY: u8 = 0x2;
pub const HEADER_FAT: u8 = 0x3;

pub const FAT_FLAG_MORE_SECTS: u16 = 0x08;
pub const FAT_FLAG_INIT_LOCALS: u16 = 0x10;

pub const SECTION_EH_TABLE: u8 = 0x01;
pub const SECTION_OPT_IL_TABLE: u8 = 0x02;
pub const SECTION_FAT_FORMAT: u8 = 0x40;
pub const SECTION_MORE_SECTS: u8 = 0x80;

pub const EH_CLAUSE_EXCEPTION: u32 = 0x0000;
pub const EH_CLAUSE_FILTER: u32 = 0x0001;
pub const EH_CLAUSE_FINALLY: u32 = 0x0002;
pub const EH_CLAUSE_FAULT: u32 = 0x0004;

/// The decoded header of either body format. Tiny bodies surface as
/// `max_stack == 8`, no locals token and no sections.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BodyHeader {
	pub max_stack: u16,
	pub code_size: u32,
	pub local_var_token: u32,
	pub init_locals: bool,
	pub has_sections: bool,
}

impl BodyHeader {
	pub fn read(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
		let first = u8::read(stream, &())?;
		match first & 0x3 {
			HEADER_TINY => Ok(Self {
				max_stack: 8,
				code_size: (first >> 2) as u32,
				local_var_token: 0,
				init_locals: false,
				has_sections: false,
			}),
			HEADER_FAT => {
				stream.seek(SeekFrom::Current(-1))?;
				let flags = u16::read(stream, &())?;
				if flags >> 12 != 3 {
					return Err(Error::from(ErrorKind::InvalidData));
				}
				Ok(Self {
					max_stack: u16::read(stream, &())?,
					code_size: u32::read(stream, &())?,
					local_var_token: u32::read(stream, &())?,
					init_locals: flags & FAT_FLAG_INIT_LOCALS != 0,
					has_sections: flags & FAT_FLAG_MORE_SECTS != 0,
				})
			},
			_ => Err(Error::from(ErrorKind::InvalidData)),
		}
	}

	/// True when the body qualifies for the single-byte tiny header.
	pub fn is_tiny(&self) -> bool {
		self.code_size < 64
			&& self.local_var_token == 0
			&& self.max_stack <= 8
			&& !self.has_sections
	}

	pub fn write(&self, buf: &mut Vec<u8>) {
		if self.is_tiny() {
			buf.push(HEADER_TINY | (self.code_size as u8) << 2);
			return;
		}
		let mut flags = HEADER_FAT as u16 | (3 << 12);
		if self.init_locals {
			flags |= FAT_FLAG_INIT_LOCALS;
		}
		if self.has_sections {
			flags |= FAT_FLAG_MORE_SECTS;
		}
		flags.write(buf, &());
		self.max_stack.write(buf, &());
		self.code_size.write(buf, &());
		self.local_var_token.write(buf, &());
	}
}

/// One exception-handling clause in offset form, shared by the small and fat
/// section encodings. `class_token_or_filter` carries a type token for
/// Exception clauses, a filter IL offset for Filter clauses and 0 otherwise.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RawEhClause {
	pub flags: u32,
	pub try_offset: u32,
	pub try_length: u32,
	pub handler_offset: u32,
	pub handler_length: u32,
	pub class_token_or_filter: u32,
}

impl RawEhClause {
	fn fits_small(&self) -> bool {
		self.try_offset <= 0xFFFF
			&& self.try_length <= 0xFF
			&& self.handler_offset <= 0xFFFF
			&& self.handler_length <= 0xFF
	}
}

/// The small section holds at most 20 clauses (its byte count is a u8).
const SMALL_SECTION_MAX_CLAUSES: usize = 20;

pub fn eh_needs_fat(clauses: &[RawEhClause]) -> bool {
	clauses.len() > SMALL_SECTION_MAX_CLAUSES || clauses.iter().any(|c| !c.fits_small())
}

/// Reads every data section trailing a fat body, collecting EH clauses and
/// skipping the obsolete OptIL tables. The cursor must sit on the first
/// section (4-byte aligned).
pub fn read_eh_sections(stream: &mut Cursor<&[u8]>) -> std::io::Result<Vec<RawEhClause>> {
	let mut clauses = vec![];
	loop {
		let kind = u8::read(stream, &())?;
		let more = kind & SECTION_MORE_SECTS != 0;
		let fat = kind & SECTION_FAT_FORMAT != 0;

		let data_size = match fat {
			false => {
				let size = u8::read(stream, &())? as u32;
				let _reserved = u16::read(stream, &())?;
				size
			},
			true => {
				let size = <[u8; 3]>::read(stream, &())?;
				u32::from_le_bytes([size[0], size[1], size[2], 0])
			},
		};

		match kind & 0x3F {
			SECTION_EH_TABLE => {
				let row = if fat { 24u32 } else { 12 };
				let count = data_size.saturating_sub(4) / row;
				clauses.reserve(count as usize);
				for _ in 0..count {
					clauses.push(match fat {
						true => RawEhClause {
							flags: u32::read(stream, &())?,
							try_offset: u32::read(stream, &())?,
							try_length: u32::read(stream, &())?,
							handler_offset: u32::read(stream, &())?,
							handler_length: u32::read(stream, &())?,
							class_token_or_filter: u32::read(stream, &())?,
						},
						false => RawEhClause {
							flags: u16::read(stream, &())? as u32,
							try_offset: u16::read(stream, &())? as u32,
							try_length: u8::read(stream, &())? as u32,
							handler_offset: u16::read(stream, &())? as u32,
							handler_length: u8::read(stream, &())? as u32,
							class_token_or_filter: u32::read(stream, &())?,
						},
					});
				}
			},
			SECTION_OPT_IL_TABLE => {
				stream.seek(SeekFrom::Current(data_size.saturating_sub(4) as i64))?;
			},
			_ => return Err(Error::from(ErrorKind::InvalidData)),
		}

		if !more {
			return Ok(clauses);
		}
	}
}

/// Emits one EH section, choosing the fat form only when a clause field
/// overflows the small encoding or there are more than 20 clauses.
pub fn write_eh_section(buf: &mut Vec<u8>, clauses: &[RawEhClause]) {
	if eh_needs_fat(clauses) {
		buf.push(SECTION_EH_TABLE | SECTION_FAT_FORMAT);
		let data_size = clauses.len() as u32 * 24 + 4;
		buf.extend_from_slice(&data_size.to_le_bytes()[..3]);
		for clause in clauses {
			clause.flags.write(buf, &());
			clause.try_offset.write(buf, &());
			clause.try_length.write(buf, &());
			clause.handler_offset.write(buf, &());
			clause.handler_length.write(buf, &());
			clause.class_token_or_filter.write(buf, &());
		}
	} else {
		buf.push(SECTION_EH_TABLE);
		buf.push((clauses.len() * 12 + 4) as u8);
		0u16.write(buf, &());
		for clause in clauses {
			(clause.flags as u16).write(buf, &());
			(clause.try_offset as u16).write(buf, &());
			buf.push(clause.try_length as u8);
			(clause.handler_offset as u16).write(buf, &());
			buf.push(clause.handler_length as u8);
			clause.class_token_or_filter.write(buf, &());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tiny_header_round_trips() {
		let header = BodyHeader {
			max_stack: 8,
			code_size: 5,
			local_var_token: 0,
			init_locals: false,
			has_sections: false,
		};
		assert!(header.is_tiny());
		let mut buf = vec![];
		header.write(&mut buf);
		assert_eq!(buf, [0x16]);
		let mut stream = Cursor::new(buf.as_slice());
		assert_eq!(BodyHeader::read(&mut stream).unwrap(), header);
	}

	#[test]
	fn fat_header_round_trips() {
		let header = BodyHeader {
			max_stack: 4,
			code_size: 100,
			local_var_token: 0x1100_0001,
			init_locals: true,
			has_sections: true,
		};
		assert!(!header.is_tiny());
		let mut buf = vec![];
		header.write(&mut buf);
		assert_eq!(buf.len(), 12);
		let mut stream = Cursor::new(buf.as_slice());
		assert_eq!(BodyHeader::read(&mut stream).unwrap(), header);
	}

	#[test]
	fn small_code_with_locals_is_fat() {
		let header = BodyHeader {
			max_stack: 8,
			code_size: 3,
			local_var_token: 0x1100_0001,
			init_locals: true,
			has_sections: false,
		};
		assert!(!header.is_tiny());
	}

	#[test]
	fn eh_section_form_selection() {
		let small = RawEhClause {
			flags: EH_CLAUSE_FINALLY,
			try_offset: 0,
			try_length: 10,
			handler_offset: 10,
			handler_length: 5,
			class_token_or_filter: 0,
		};
		assert!(!eh_needs_fat(&[small; 20]));
		assert!(eh_needs_fat(&[small; 21]));
		let long_try = RawEhClause { try_length: 0x100, ..small };
		assert!(eh_needs_fat(&[long_try]));
	}

	#[test]
	fn eh_sections_round_trip_both_forms() {
		for clause in [
			RawEhClause {
				flags: EH_CLAUSE_EXCEPTION,
				try_offset: 0,
				try_length: 8,
				handler_offset: 8,
				handler_length: 4,
				class_token_or_filter: 0x0100_0001,
			},
			RawEhClause {
				flags: EH_CLAUSE_FILTER,
				try_offset: 0x1_0000,
				try_length: 8,
				handler_offset: 0x1_0010,
				handler_length: 4,
				class_token_or_filter: 0x1_0008,
			},
		] {
			let mut buf = vec![];
			write_eh_section(&mut buf, &[clause]);
			let mut stream = Cursor::new(buf.as_slice());
			assert_eq!(read_eh_sections(&mut stream).unwrap(), vec![clause]);
		}
	}
}
