pub mod metadata_token {
	use std::fmt::{Debug, Formatter};
	use std::io::{Cursor, ErrorKind};

	use crate::utilities::{FromByteStream, ToByteStream};

	macro_rules! define_metadata_token {
		($($id: ident = $discriminant: literal),*) => {
			#[repr(u32)]
			#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
			pub enum MetadataTokenKind {
				$($id = $discriminant),*
			}

			/// A 32-bit metadata token: table tag in the high byte, 1-based
			/// row number (or #US byte offset) in the low 24 bits. Row 0 is
			/// the null reference.
			#[repr(transparent)]
			#[derive(Copy, Clone, Eq, PartialEq, Hash)]
			pub struct MetadataToken(u32);

			impl MetadataToken {
				pub fn new(kind: MetadataTokenKind, index: u32) -> Self {
					debug_assert!(index <= 0x00FF_FFFF);
					Self(((kind as u32) << 24) | index)
				}

				pub fn kind(&self) -> MetadataTokenKind {
					match self.0 >> 24 {
						$($discriminant => MetadataTokenKind::$id,)*
						_ => unreachable!(),
					}
				}

				#[inline]
				pub fn index(&self) -> u32 {
					self.0 & 0x00FF_FFFF
				}

				#[inline]
				pub fn is_null(&self) -> bool {
					self.index() == 0
				}

				#[inline]
				pub fn raw(&self) -> u32 {
					self.0
				}
			}

			impl TryFrom<u32> for MetadataToken {
				type Error = ();
				fn try_from(value: u32) -> Result<Self, Self::Error> {
					match value >> 24 {
						$($discriminant => Ok(Self(value)),)*
						_ => Err(())
					}
				}
			}
		};
	}

	impl Debug for MetadataToken {
		fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
			write!(f, "MetadataToken::{:?}(", self.kind())?;
			self.index().fmt(f)?;
			write!(f, ")")
		}
	}

	impl FromByteStream for MetadataToken {
		type Deps = ();
		fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
			let value = u32::read(stream, &())?;
			MetadataToken::try_from(value).map_err(|_| ErrorKind::InvalidData.into())
		}
	}

	impl ToByteStream for MetadataToken {
		type Deps = ();
		fn write(&self, buf: &mut Vec<u8>, _: &Self::Deps) {
			self.0.write(buf, &());
		}
	}

	define_metadata_token! {
		Module = 0x00,
		TypeRef = 0x01,
		TypeDef = 0x02,
		Field = 0x04,
		MethodDef = 0x06,
		Param = 0x08,
		InterfaceImpl = 0x09,
		MemberRef = 0x0a,
		Constant = 0x0b,
		CustomAttribute = 0x0c,
		DeclSecurity = 0x0e,
		StandAloneSig = 0x11,
		Event = 0x14,
		Property = 0x17,
		ModuleRef = 0x1a,
		TypeSpec = 0x1b,
		Assembly = 0x20,
		AssemblyRef = 0x23,
		File = 0x26,
		ExportedType = 0x27,
		ManifestResource = 0x28,
		GenericParam = 0x2a,
		MethodSpec = 0x2b,
		GenericParamConstraint = 0x2c,

		String = 0x70
	}
}

pub mod coded_index {
	use std::fmt::{Debug, Formatter};
	use std::io::{Cursor, ErrorKind};

	use crate::raw::heaps::table::TableKind;
	use crate::raw::indices::sizes::{IndexSizes, SizeOf};
	use crate::utilities::{
		read_compressed_u32, read_uint_of_size, write_compressed_u32, write_uint_of_size,
		FromByteStream, ToByteStream,
	};

	macro_rules! define_coded_index {
		($($id: ident: [$($variant: ident),*]),*) => {
			#[repr(u32)]
			#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
			pub enum CodedIndexKind {
				$($id),*
			}

			impl CodedIndexKind {
				pub const ALL: &'static [CodedIndexKind] = &[$(CodedIndexKind::$id),*];
			}

			$(
				/// A packed table-set reference: low `k` tag bits select the
				/// target table, the high bits hold the row number.
				#[repr(transparent)]
				#[derive(Copy, Clone, Eq, PartialEq, Hash)]
				pub struct $id(u32);

				impl Debug for $id {
					fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
						let (table, row) = self.decode();
						write!(f, "{}({:?}:{})", stringify!($id), table, row)
					}
				}

				impl TryFrom<u32> for $id {
					type Error = ();
					fn try_from(value: u32) -> Result<Self, Self::Error> {
						match CodedIndexKind::$id.is_valid(value) {
							false => Err(()),
							true => Ok(Self(value)),
						}
					}
				}

				impl FromByteStream for $id {
					type Deps = IndexSizes;
					fn read(stream: &mut Cursor<&[u8]>, sizes: &Self::Deps) -> std::io::Result<Self> {
						let size = <IndexSizes as SizeOf<$id>>::size_of(sizes);
						let value = read_uint_of_size(stream, size)?;
						Self::try_from(value).map_err(|_| ErrorKind::InvalidData.into())
					}
				}

				impl ToByteStream for $id {
					type Deps = IndexSizes;
					fn write(&self, buf: &mut Vec<u8>, sizes: &Self::Deps) {
						let size = <IndexSizes as SizeOf<$id>>::size_of(sizes);
						write_uint_of_size(buf, self.0, size);
					}
				}

				impl SizeOf<$id> for IndexSizes {
					fn size_of(&self) -> usize {
						self.coded[CodedIndexKind::$id as usize]
					}
				}

				impl $id {
					pub const NULL: $id = $id(0);

					/// Packs `(table, row)`; `None` if the table is not part
					/// of this coded-index space.
					pub fn encode(table: TableKind, row: u32) -> Option<Self> {
						const KIND: CodedIndexKind = CodedIndexKind::$id;
						let tag = KIND.tag_of(table)?;
						Some(Self((row << KIND.mask_bits()) | tag))
					}

					pub fn decode(&self) -> (TableKind, u32) {
						const KIND: CodedIndexKind = CodedIndexKind::$id;
						(KIND.table_kind(self.0), self.0 >> KIND.mask_bits())
					}

					#[inline]
					pub fn is_null(&self) -> bool {
						const KIND: CodedIndexKind = CodedIndexKind::$id;
						self.0 >> KIND.mask_bits() == 0
					}

					/// The raw packed value; also the mandated sort key for
					/// tables ordered by a column of this space.
					#[inline]
					pub fn raw(&self) -> u32 {
						self.0
					}

					pub fn read_compressed(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
						let value = read_compressed_u32(stream)?;
						Self::try_from(value).map_err(|_| ErrorKind::InvalidData.into())
					}

					pub fn write_compressed(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
						write_compressed_u32(buf, self.0)
					}
				}
			)*

			const TABLES: &[&[TableKind]] = &[$(&[$(TableKind::$variant),*]),*];
		};
	}

	define_coded_index! {
		TypeDefOrRef: [TypeDef, TypeRef, TypeSpec],
		HasConstant: [Field, Param, Property],
		HasCustomAttribute: [
			MethodDef, Field, TypeRef, TypeDef, Param, InterfaceImpl, MemberRef,
			Module, DeclSecurity, Property, Event, StandAloneSig, ModuleRef,
			TypeSpec, Assembly, AssemblyRef, File, ExportedType,
			ManifestResource, GenericParam, GenericParamConstraint, MethodSpec
		],
		HasFieldMarshal: [Field, Param],
		HasDeclSecurity: [TypeDef, MethodDef, Assembly],
		MemberRefParent: [TypeDef, TypeRef, ModuleRef, MethodDef, TypeSpec],
		HasSemantics: [Event, Property],
		MethodDefOrRef: [MethodDef, MemberRef],
		MemberForwarded: [Field, MethodDef],
		Implementation: [File, AssemblyRef, ExportedType],
		CustomAttributeType: [MethodDef, MemberRef],
		ResolutionScope: [Module, ModuleRef, AssemblyRef, TypeRef],
		TypeOrMethodDef: [TypeDef, MethodDef]
	}

	impl CodedIndexKind {
		/// The on-disk width of this coded index given the final row counts:
		/// 2 bytes unless any target table's rows overflow the 16-k bit
		/// row-number field.
		pub const fn get_size(&self, table_rows: &[u32; 64]) -> usize {
			let mut i = 0;
			let mut max = 0u32;
			let bits = self.mask_bits();
			let tables = TABLES[*self as usize];
			while i < tables.len() {
				let rows = table_rows[tables[i] as usize];
				if max < rows {
					max = rows;
				}
				i += 1;
			}

			2 + 2 * (max >= (1 << (16 - bits))) as usize
		}

		pub const fn mask(&self) -> u32 {
			(1 << self.mask_bits()) - 1
		}

		pub const fn mask_bits(&self) -> u32 {
			match self {
				// Reserves tags for the unused Not-used/TypeRef/TypeDef slots.
				CodedIndexKind::CustomAttributeType => 3,
				_ => {
					let tables = TABLES[*self as usize];
					32 - (tables.len() as u32 - 1).leading_zeros()
				},
			}
		}

		pub const fn is_valid(&self, value: u32) -> bool {
			let discriminant = value & self.mask();
			match self {
				CodedIndexKind::CustomAttributeType => matches!(discriminant, 2 | 3),
				_ => (discriminant as usize) < TABLES[*self as usize].len(),
			}
		}

		pub const fn table_kind(&self, value: u32) -> TableKind {
			let discriminant = value & self.mask();
			match self {
				CodedIndexKind::CustomAttributeType => match discriminant {
					2 => TableKind::MethodDef,
					3 => TableKind::MemberRef,
					_ => unreachable!(),
				},
				_ => TABLES[*self as usize][discriminant as usize],
			}
		}

		pub const fn tag_of(&self, table: TableKind) -> Option<u32> {
			if let CodedIndexKind::CustomAttributeType = self {
				return match table {
					TableKind::MethodDef => Some(2),
					TableKind::MemberRef => Some(3),
					_ => None,
				};
			}
			let tables = TABLES[*self as usize];
			let mut i = 0;
			while i < tables.len() {
				if tables[i] as u32 == table as u32 {
					return Some(i as u32);
				}
				i += 1;
			}
			None
		}
	}
}

pub mod sizes {
	use std::io::Cursor;

	use crate::raw::heaps::table::TableKind;
	use crate::raw::indices::coded_index::CodedIndexKind;
	use crate::utilities::{read_uint_of_size, write_uint_of_size, FromByteStream, ToByteStream};

	/// Heap-size flags from the `#~` header, mapped to the byte width of the
	/// respective heap index columns.
	pub const HEAP_WIDE_STRING: u8 = 0x1;
	pub const HEAP_WIDE_GUID: u8 = 0x2;
	pub const HEAP_WIDE_BLOB: u8 = 0x4;

	/// Every index width of a metadata stream, fixed once after the header
	/// is parsed (read path) or after sizing (write path).
	#[derive(Debug, Clone)]
	pub struct IndexSizes {
		pub string: usize,
		pub guid: usize,
		pub blob: usize,
		pub coded: [usize; 13],
		pub tables: [usize; 64],
		pub rows: [u32; 64],
	}

	pub trait SizeOf<T> {
		fn size_of(&self) -> usize;
	}

	impl IndexSizes {
		pub fn new(heap_sizes: u8, rows: [u32; 64]) -> Self {
			Self {
				string: 2 + 2 * ((heap_sizes & HEAP_WIDE_STRING) != 0) as usize,
				guid: 2 + 2 * ((heap_sizes & HEAP_WIDE_GUID) != 0) as usize,
				blob: 2 + 2 * ((heap_sizes & HEAP_WIDE_BLOB) != 0) as usize,
				tables: {
					let mut tables = [0; 64];
					for (size, len) in tables.iter_mut().zip(rows) {
						*size = 2 + 2 * (len >= 0x10000) as usize;
					}
					tables
				},
				coded: {
					let mut coded = [0; 13];
					for (size, kind) in coded.iter_mut().zip(CodedIndexKind::ALL) {
						*size = kind.get_size(&rows);
					}
					coded
				},
				rows,
			}
		}

		#[inline]
		pub fn table(&self, kind: TableKind) -> usize {
			self.tables[kind as usize]
		}

		#[inline]
		pub fn row_count(&self, kind: TableKind) -> u32 {
			self.rows[kind as usize]
		}
	}

	impl AsRef<()> for IndexSizes {
		#[inline]
		fn as_ref(&self) -> &() {
			&()
		}
	}

	impl AsRef<IndexSizes> for IndexSizes {
		#[inline]
		fn as_ref(&self) -> &Self {
			self
		}
	}

	impl SizeOf<()> for IndexSizes {
		#[inline]
		fn size_of(&self) -> usize {
			0
		}
	}

	impl<const S: usize> SizeOf<[u8; S]> for IndexSizes {
		#[inline]
		fn size_of(&self) -> usize {
			S
		}
	}

	macro_rules! impl_size_of_scalar {
		($($ty: ty),*) => {$(
			impl SizeOf<$ty> for IndexSizes {
				#[inline]
				fn size_of(&self) -> usize {
					std::mem::size_of::<$ty>()
				}
			}
		)*};
	}

	impl_size_of_scalar!(u8, u16, u32, u64);

	macro_rules! define_table_index {
		($($(#[$attr: meta])* $id: ident => $table: ident),*) => {$(
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
					let size = sizes.table(TableKind::$table);
					Ok(Self(read_uint_of_size(stream, size)?))
				}
			}

			impl ToByteStream for $id {
				type Deps = IndexSizes;
				fn write(&self, buf: &mut Vec<u8>, sizes: &Self::Deps) {
					write_uint_of_size(buf, self.0, sizes.table(TableKind::$table));
				}
			}

			impl SizeOf<$id> for IndexSizes {
				#[inline]
				fn size_of(&self) -> usize {
					self.table(TableKind::$table)
				}
			}
		)*};
	}

	define_table_index! {
		/// 1-based row number into TypeDef.
		TypeDefIndex => TypeDef,
		/// 1-based row number into Field.
		FieldIndex => Field,
		/// 1-based row number into MethodDef.
		MethodDefIndex => MethodDef,
		/// 1-based row number into Param.
		ParamIndex => Param,
		/// 1-based row number into Event.
		EventIndex => Event,
		/// 1-based row number into Property.
		PropertyIndex => Property,
		/// 1-based row number into ModuleRef.
		ModuleRefIndex => ModuleRef,
		/// 1-based row number into GenericParam.
		GenericParamIndex => GenericParam,
		/// 1-based row number into AssemblyRef.
		AssemblyRefIndex => AssemblyRef
	}
}

#[cfg(test)]
mod tests {
	use super::coded_index::*;
	use super::sizes::IndexSizes;
	use crate::raw::heaps::table::TableKind;

	#[test]
	fn coded_index_packs_tag_and_row() {
		let idx = TypeDefOrRef::encode(TableKind::TypeRef, 5).unwrap();
		assert_eq!(idx.decode(), (TableKind::TypeRef, 5));
		assert_eq!(idx.raw(), (5 << 2) | 1);
		assert!(!idx.is_null());
		assert!(TypeDefOrRef::NULL.is_null());
	}

	#[test]
	fn custom_attribute_type_tags() {
		let ctor = CustomAttributeType::encode(TableKind::MemberRef, 1).unwrap();
		assert_eq!(ctor.decode(), (TableKind::MemberRef, 1));
		assert_eq!(ctor.raw(), (1 << 3) | 3);
		assert!(CustomAttributeType::encode(TableKind::TypeDef, 1).is_none());
		assert!(CustomAttributeType::try_from(0u32).is_err());
	}

	#[test]
	fn coded_index_width_grows_with_tables() {
		let mut rows = [0u32; 64];
		rows[TableKind::TypeDef as usize] = (1 << 14) - 1;
		assert_eq!(CodedIndexKind::TypeDefOrRef.get_size(&rows), 2);
		rows[TableKind::TypeDef as usize] = 1 << 14;
		assert_eq!(CodedIndexKind::TypeDefOrRef.get_size(&rows), 4);
	}

	#[test]
	fn simple_index_width_threshold() {
		let mut rows = [0u32; 64];
		rows[TableKind::Field as usize] = 0xFFFF;
		let sizes = IndexSizes::new(0, rows);
		assert_eq!(sizes.table(TableKind::Field), 2);
		rows[TableKind::Field as usize] = 0x10000;
		let sizes = IndexSizes::new(0, rows);
		assert_eq!(sizes.table(TableKind::Field), 4);
	}

	#[test]
	fn has_custom_attribute_round_trips_every_target() {
		for table in [
			TableKind::MethodDef, TableKind::Field, TableKind::TypeRef, TableKind::TypeDef,
			TableKind::Param, TableKind::InterfaceImpl, TableKind::MemberRef, TableKind::Module,
			TableKind::DeclSecurity, TableKind::Property, TableKind::Event,
			TableKind::StandAloneSig, TableKind::ModuleRef, TableKind::TypeSpec,
			TableKind::Assembly, TableKind::AssemblyRef, TableKind::File,
			TableKind::ExportedType, TableKind::ManifestResource, TableKind::GenericParam,
			TableKind::GenericParamConstraint, TableKind::MethodSpec,
		] {
			let idx = HasCustomAttribute::encode(table, 42).unwrap();
			assert_eq!(idx.decode(), (table, 42));
		}
	}
}
