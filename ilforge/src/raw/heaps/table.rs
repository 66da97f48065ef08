use std::io::{Cursor, Error, ErrorKind};

use bitflags::bitflags;
use paste::paste;

use crate::raw::heaps::{BlobIndex, GuidIndex, StringIndex};
use crate::raw::indices::coded_index::{
	CustomAttributeType, HasConstant, HasCustomAttribute, HasDeclSecurity, HasFieldMarshal,
	HasSemantics, Implementation, MemberForwarded, MemberRefParent, MethodDefOrRef,
	ResolutionScope, TypeDefOrRef, TypeOrMethodDef,
};
use crate::raw::indices::sizes::{
	AssemblyRefIndex, EventIndex, FieldIndex, GenericParamIndex, IndexSizes, MethodDefIndex,
	ModuleRefIndex, ParamIndex, PropertyIndex, SizeOf, TypeDefIndex,
};
use crate::utilities::{enumerate_set_bits, FromByteStream, ToByteStream};

macro_rules! impl_flags_byte_stream {
	($($ty: ident: $repr: ty),*) => {$(
		impl FromByteStream for $ty {
			type Deps = ();
			#[inline]
			fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
				// Reserved bits survive a round-trip unchanged.
				Ok(Self::from_bits_retain(<$repr>::read(stream, &())?))
			}
		}

		impl ToByteStream for $ty {
			type Deps = ();
			#[inline]
			fn write(&self, buf: &mut Vec<u8>, _: &Self::Deps) {
				self.bits().write(buf, &());
			}
		}

		impl SizeOf<$ty> for IndexSizes {
			#[inline]
			fn size_of(&self) -> usize {
				std::mem::size_of::<$repr>()
			}
		}
	)*};
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct TypeAttributes: u32 {
		// #### Visibility attributes ####
		/// Use this mask to retrieve visibility information.
		const VISIBILITY_MASK = 0x00000007;
		/// Class has no public scope.
		const NOT_PUBLIC = 0x00000000;
		/// Class has public scope.
		const PUBLIC = 0x00000001;
		/// Class is nested with public visibility.
		const NESTED_PUBLIC = 0x00000002;
		/// Class is nested with private visibility.
		const NESTED_PRIVATE = 0x00000003;
		/// Class is nested with family visibility.
		const NESTED_FAMILY = 0x00000004;
		/// Class is nested with assembly visibility.
		const NESTED_ASSEMBLY = 0x00000005;
		/// Class is nested with family and assembly.
		const NESTED_FAMILY_AND_ASSEMBLY = 0x00000006;
		/// Class is nested with family or assembly.
		const NESTED_FAMILY_OR_ASSEMBLY = 0x00000007;

		// #### Class layout attributes ####
		/// Use this mask to retrieve class layout information.
		const LAYOUT_MASK = 0x00000018;
		/// Class fields are auto-laid out.
		const AUTO_LAYOUT = 0x00000000;
		/// Class fields are laid out sequentially.
		const SEQUENTIAL_LAYOUT = 0x00000008;
		/// Layout is supplied explicitly.
		const EXPLICIT_LAYOUT = 0x00000010;

		// #### Class semantics attributes ####
		/// Use this mask to retrieve class semantics information.
		const CLASS_SEMANTICS_MASK = 0x00000020;
		/// Type is a class.
		const CLASS = 0x00000000;
		/// Type is an interface.
		const INTERFACE = 0x00000020;

		// #### Special semantics in addition to class semantics ####
		/// Class is abstract.
		const ABSTRACT = 0x00000080;
		/// Class cannot be extended.
		const SEALED = 0x00000100;
		/// Class name is special.
		const SPECIAL_NAME = 0x00000400;

		// #### Implementation attributes ####
		/// Class/Interface is imported.
		const IMPORTED = 0x00001000;
		/// Instances of the type can be serialized.
		const SERIALIZABLE = 0x00002000;

		// #### String formatting attributes ####
		/// Use this mask to retrieve string information for native interop.
		const STRING_FORMAT_MASK = 0x00030000;
		/// LPSTR is interpreted as ANSI.
		const ANSI_CLASS = 0x00000000;
		/// LPSTR is interpreted as Unicode.
		const UNICODE_CLASS = 0x00010000;
		/// LPSTR is interpreted automatically.
		const AUTO_CLASS = 0x00020000;
		/// A non-standard encoding specified by CUSTOM_STRING_FORMAT_MASK.
		const CUSTOM_FORMAT_CLASS = 0x00030000;
		/// Use this mask to retrieve non-standard encoding information for native interop.
		const CUSTOM_STRING_FORMAT_MASK = 0x00C00000;

		// #### Class initialization attributes ####
		/// Initialize the class before first static field access.
		const BEFORE_FIELD_INIT = 0x00100000;

		// #### Additional attributes ####
		/// CLI provides 'special' behavior, depending upon the name of the type.
		const RT_SPECIAL_NAME = 0x00000800;
		/// Type has security associated with it.
		const HAS_SECURITY = 0x00040000;
		/// This ExportedType entry is a type forwarder.
		const IS_TYPE_FORWARDER = 0x00200000;
	}

	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct FieldAttributes: u16 {
		/// Use this mask to retrieve access information.
		const FIELD_ACCESS_MASK = 0x0007;
		/// Member not referenceable.
		const COMPILER_CONTROLLED = 0x0000;
		/// Accessible only by the parent type.
		const PRIVATE = 0x0001;
		/// Accessible by sub-types only in this assembly.
		const FAMILY_AND_ASSEMBLY = 0x0002;
		/// Accessible by anyone in the assembly.
		const ASSEMBLY = 0x0003;
		/// Accessible only by type and sub-types.
		const FAMILY = 0x0004;
		/// Accessible by sub-types anywhere, plus anyone in assembly.
		const FAMILY_OR_ASSEMBLY = 0x0005;
		/// Accessible by anyone who has visibility to this scope.
		const PUBLIC = 0x0006;
		/// Defined on type, else per instance.
		const STATIC = 0x0010;
		/// Field can only be initialized, not written to after init.
		const INIT_ONLY = 0x0020;
		/// Value is a compile-time constant.
		const LITERAL = 0x0040;
		/// Reserved.
		const NOT_SERIALIZED = 0x0080;
		/// Field is special.
		const SPECIAL_NAME = 0x0200;
		/// Implementation is forwarded through PInvoke.
		const PINVOKE_IMPL = 0x2000;
		/// CLI provides 'special' behavior, depending upon the name of the field.
		const RT_SPECIAL_NAME = 0x0400;
		/// Field has marshalling information.
		const HAS_FIELD_MARSHAL = 0x1000;
		/// Field has a default value.
		const HAS_DEFAULT = 0x8000;
		/// Field has an RVA.
		const HAS_FIELD_RVA = 0x0100;
	}

	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodAttributes: u16 {
		/// Use this mask to retrieve accessibility information.
		const MEMBER_ACCESS_MASK = 0x0007;
		/// Member not referenceable.
		const COMPILER_CONTROLLED = 0x0000;
		/// Accessible only by the parent type.
		const PRIVATE = 0x0001;
		/// Accessible by sub-types only in this assembly.
		const FAMILY_AND_ASSEMBLY = 0x0002;
		/// Accessible by anyone in the assembly.
		const ASSEMBLY = 0x0003;
		/// Accessible only by type and sub-types.
		const FAMILY = 0x0004;
		/// Accessible by sub-types anywhere, plus anyone in assembly.
		const FAMILY_OR_ASSEMBLY = 0x0005;
		/// Accessible by anyone who has visibility to this scope.
		const PUBLIC = 0x0006;
		/// Defined on type, else per instance.
		const STATIC = 0x0010;
		/// Method cannot be overridden.
		const FINAL = 0x0020;
		/// Method is virtual.
		const VIRTUAL = 0x0040;
		/// Method hides by name and signature, else just by name.
		const HIDE_BY_SIG = 0x0080;
		/// Use this mask to retrieve vtable attributes.
		const VTABLE_LAYOUT_MASK = 0x0100;
		/// Method reuses existing slot in vtable.
		const REUSE_SLOT = 0x0000;
		/// Method always gets a new slot in the vtable.
		const NEW_SLOT = 0x0100;
		/// Method can only be overridden if also accessible.
		const STRICT = 0x0200;
		/// Method does not provide an implementation.
		const ABSTRACT = 0x0400;
		/// Method is special.
		const SPECIAL_NAME = 0x0800;
		/// Implementation is forwarded through PInvoke.
		const PINVOKE_IMPL = 0x2000;
		/// Reserved: shall be zero for conforming implementations.
		const UNMANAGED_EXPORT = 0x0008;
		/// CLI provides 'special' behavior, depending upon the name of the method.
		const RT_SPECIAL_NAME = 0x1000;
		/// Method has security associated with it.
		const HAS_SECURITY = 0x4000;
		/// Method calls another method containing security code.
		const REQUIRE_SEC_OBJECT = 0x8000;
	}

	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodImplAttributes: u16 {
		/// Use this mask to retrieve the code type.
		const CODE_TYPE_MASK = 0x0003;
		/// Method implementation is CIL.
		const IL = 0x0000;
		/// Method implementation is native.
		const NATIVE = 0x0001;
		/// Reserved: shall be zero in conforming implementations.
		const OPTIL = 0x0002;
		/// Method implementation is provided by the runtime.
		const RUNTIME = 0x0003;
		/// Method implementation is unmanaged.
		const UNMANAGED = 0x0004;
		/// Method cannot be inlined.
		const NO_INLINING = 0x0008;
		/// Method is defined, but the body is provided elsewhere.
		const FORWARD_REF = 0x0010;
		/// Method is single-threaded through the body.
		const SYNCHRONIZED = 0x0020;
		/// Method will not be optimized when generating native code.
		const NO_OPTIMIZATION = 0x0040;
		/// Reserved: conforming implementations can ignore.
		const PRESERVE_SIG = 0x0080;
		/// Reserved: shall be zero in conforming implementations.
		const INTERNAL_CALL = 0x1000;
	}

	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct ParamAttributes: u16 {
		/// Param is [In].
		const IN = 0x0001;
		/// Param is [Out].
		const OUT = 0x0002;
		/// Param is optional.
		const OPTIONAL = 0x0010;
		/// Param has a default value.
		const HAS_DEFAULT = 0x1000;
		/// Param has field marshalling information.
		const HAS_FIELD_MARSHAL = 0x2000;
	}

	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct EventAttributes: u16 {
		/// Event is special.
		const SPECIAL_NAME = 0x0200;
		/// CLI provides 'special' behavior, depending upon the name of the event.
		const RT_SPECIAL_NAME = 0x0400;
	}

	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct PropertyAttributes: u16 {
		/// Property is special.
		const SPECIAL_NAME = 0x0200;
		/// CLI provides 'special' behavior, depending upon the name of the property.
		const RT_SPECIAL_NAME = 0x0400;
		/// Property has a default value.
		const HAS_DEFAULT = 0x1000;
	}

	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodSemanticsAttributes: u16 {
		/// Setter for property.
		const SETTER = 0x0001;
		/// Getter for property.
		const GETTER = 0x0002;
		/// Other method for property or event.
		const OTHER = 0x0004;
		/// AddOn method for event.
		const ADD_ON = 0x0008;
		/// RemoveOn method for event.
		const REMOVE_ON = 0x0010;
		/// Fire method for event.
		const FIRE = 0x0020;
	}

	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct PInvokeAttributes: u16 {
		/// PInvoke is to use the member name as specified.
		const NO_MANGLE = 0x0001;
		/// Use this mask to retrieve the character set information.
		const CHAR_SET_MASK = 0x0006;
		const CHAR_SET_NOT_SPEC = 0x0000;
		const CHAR_SET_ANSI = 0x0002;
		const CHAR_SET_UNICODE = 0x0004;
		const CHAR_SET_AUTO = 0x0006;
		/// Information about target function: supports last error querying.
		const SUPPORTS_LAST_ERROR = 0x0040;
		/// Use this mask to retrieve the calling convention.
		const CALL_CONV_MASK = 0x0700;
		const CALL_CONV_PLATFORMAPI = 0x0100;
		const CALL_CONV_CDECL = 0x0200;
		const CALL_CONV_STDCALL = 0x0300;
		const CALL_CONV_THISCALL = 0x0400;
		const CALL_CONV_FASTCALL = 0x0500;
		/// Best-fit mapping behavior when converting Unicode to ANSI.
		const BEST_FIT_MASK = 0x0030;
		/// Throw on unmappable Unicode characters.
		const THROW_ON_UNMAPPABLE_CHAR_MASK = 0x3000;
	}

	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct GenericParamAttributes: u16 {
		/// Use this mask to retrieve variance information.
		const VARIANCE_MASK = 0x0003;
		const NONE = 0x0000;
		/// The generic parameter is covariant.
		const COVARIANT = 0x0001;
		/// The generic parameter is contravariant.
		const CONTRAVARIANT = 0x0002;
		/// Use this mask to retrieve special constraint information.
		const SPECIAL_CONSTRAINT_MASK = 0x001C;
		/// The generic parameter has the class special constraint.
		const REFERENCE_TYPE_CONSTRAINT = 0x0004;
		/// The generic parameter has the valuetype special constraint.
		const NOT_NULLABLE_VALUE_TYPE_CONSTRAINT = 0x0008;
		/// The generic parameter has the .ctor special constraint.
		const DEFAULT_CONSTRUCTOR_CONSTRAINT = 0x0010;
	}

	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct ManifestResourceAttributes: u32 {
		/// Use this mask to retrieve visibility information.
		const VISIBILITY_MASK = 0x0007;
		/// The resource is exported from the assembly.
		const PUBLIC = 0x0001;
		/// The resource is private to the assembly.
		const PRIVATE = 0x0002;
	}

	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct FileAttributes: u32 {
		/// This is not a resource file.
		const CONTAINS_META_DATA = 0x0000;
		/// This is a resource file or other non-metadata-containing file.
		const CONTAINS_NO_META_DATA = 0x0001;
	}

	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct AssemblyFlags: u32 {
		/// The assembly reference holds the full (unhashed) public key.
		const PUBLIC_KEY = 0x0001;
		/// The implementation of this assembly used at runtime is not expected to match the version seen at compile time.
		const RETARGETABLE = 0x0100;
		/// Reserved: a conforming implementation of the CLI can ignore this setting on read.
		const DISABLE_JIT_COMPILE_OPTIMIZER = 0x4000;
		/// Reserved: a conforming implementation of the CLI can ignore this setting on read.
		const ENABLE_JIT_COMPILE_TRACKING = 0x8000;
	}
}

impl_flags_byte_stream! {
	TypeAttributes: u32,
	FieldAttributes: u16,
	MethodAttributes: u16,
	MethodImplAttributes: u16,
	ParamAttributes: u16,
	EventAttributes: u16,
	PropertyAttributes: u16,
	MethodSemanticsAttributes: u16,
	PInvokeAttributes: u16,
	GenericParamAttributes: u16,
	ManifestResourceAttributes: u32,
	FileAttributes: u32,
	AssemblyFlags: u32
}

#[repr(u32)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AssemblyHashAlgorithm {
	#[default]
	None = 0x0000,
	MD5 = 0x8003,
	SHA1 = 0x8004,
	SHA256 = 0x800C,
	SHA384 = 0x800D,
	SHA512 = 0x800E,
}

impl FromByteStream for AssemblyHashAlgorithm {
	type Deps = ();
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		match u32::read(stream, &())? {
			0x0000 => Ok(Self::None),
			0x8003 => Ok(Self::MD5),
			0x8004 => Ok(Self::SHA1),
			0x800C => Ok(Self::SHA256),
			0x800D => Ok(Self::SHA384),
			0x800E => Ok(Self::SHA512),
			_ => Err(ErrorKind::InvalidData.into()),
		}
	}
}

impl ToByteStream for AssemblyHashAlgorithm {
	type Deps = ();
	fn write(&self, buf: &mut Vec<u8>, _: &Self::Deps) {
		(*self as u32).write(buf, &());
	}
}

impl SizeOf<AssemblyHashAlgorithm> for IndexSizes {
	#[inline]
	fn size_of(&self) -> usize {
		4
	}
}

macro_rules! define_tables {
	($(
		$(#[$attr: meta])*
		$id: ident = $discriminant: literal {
			$($field: ident: $ty: ty),* $(,)?
		}
	)*) => { paste! {
		/// Identifies one of the 45 metadata tables (ids 0x00–0x2C).
		#[repr(usize)]
		#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
		pub enum TableKind {
			$($id = $discriminant),*
		}

		impl TableKind {
			pub fn from_repr(value: usize) -> Option<Self> {
				match value {
					$($discriminant => Some(TableKind::$id),)*
					_ => None,
				}
			}
		}

		$(
			$(#[$attr])*
			#[derive(Debug, Clone, Eq, PartialEq)]
			pub struct $id {
				$(pub $field: $ty),*
			}

			impl FromByteStream for $id {
				type Deps = IndexSizes;
				fn read(stream: &mut Cursor<&[u8]>, sizes: &Self::Deps) -> std::io::Result<Self> {
					Ok(Self {
						$($field: <$ty as FromByteStream>::read(stream, sizes.as_ref())?),*
					})
				}
			}

			impl ToByteStream for $id {
				type Deps = IndexSizes;
				fn write(&self, buf: &mut Vec<u8>, sizes: &Self::Deps) {
					$(ToByteStream::write(&self.$field, buf, sizes.as_ref());)*
				}
			}

			impl $id {
				pub const KIND: TableKind = TableKind::$id;

				/// The byte width of one row once index sizes are final.
				pub fn row_size(sizes: &IndexSizes) -> usize {
					0 $(+ <IndexSizes as SizeOf<$ty>>::size_of(sizes))*
				}
			}
		)*

		/// All 45 tables in one record keyed by table id, each a homogeneous
		/// row vector in row-number order (row `n` lives at index `n - 1`).
		#[derive(Debug, Default, Clone, Eq, PartialEq)]
		pub struct Tables {
			$(pub [<$id: snake>]: Vec<$id>,)*
		}

		impl Tables {
			pub fn row_counts(&self) -> [u32; 64] {
				let mut counts = [0u32; 64];
				$(counts[$discriminant] = self.[<$id: snake>].len() as u32;)*
				counts
			}

			pub fn valid_mask(&self) -> u64 {
				let mut mask = 0u64;
				$(if !self.[<$id: snake>].is_empty() {
					mask |= 1 << $discriminant;
				})*
				mask
			}

			fn read_rows(&mut self, stream: &mut Cursor<&[u8]>, sizes: &IndexSizes) -> std::io::Result<()> {
				$(
					let count = sizes.rows[$discriminant] as usize;
					self.[<$id: snake>].reserve_exact(count);
					for _ in 0..count {
						self.[<$id: snake>].push(<$id>::read(stream, sizes)?);
					}
				)*
				Ok(())
			}

			fn write_rows(&self, buf: &mut Vec<u8>, sizes: &IndexSizes) {
				$(for row in &self.[<$id: snake>] {
					row.write(buf, sizes);
				})*
			}
		}
	}};
}

define_tables! {
	Module = 0x00 {
		generation: u16,
		name: StringIndex,
		mv_id: GuidIndex,
		enc_id: GuidIndex,
		enc_base_id: GuidIndex,
	}
	TypeRef = 0x01 {
		resolution_scope: ResolutionScope,
		type_name: StringIndex,
		type_namespace: StringIndex,
	}
	TypeDef = 0x02 {
		flags: TypeAttributes,
		type_name: StringIndex,
		type_namespace: StringIndex,
		extends: TypeDefOrRef,
		field_list: FieldIndex,
		method_list: MethodDefIndex,
	}
	FieldPtr = 0x03 {
		field: FieldIndex,
	}
	Field = 0x04 {
		flags: FieldAttributes,
		name: StringIndex,
		signature: BlobIndex,
	}
	MethodPtr = 0x05 {
		method: MethodDefIndex,
	}
	MethodDef = 0x06 {
		rva: u32,
		impl_flags: MethodImplAttributes,
		flags: MethodAttributes,
		name: StringIndex,
		signature: BlobIndex,
		param_list: ParamIndex,
	}
	ParamPtr = 0x07 {
		param: ParamIndex,
	}
	Param = 0x08 {
		flags: ParamAttributes,
		sequence: u16,
		name: StringIndex,
	}
	InterfaceImpl = 0x09 {
		class: TypeDefIndex,
		interface: TypeDefOrRef,
	}
	MemberRef = 0x0a {
		class: MemberRefParent,
		name: StringIndex,
		signature: BlobIndex,
	}
	Constant = 0x0b {
		ty: [u8; 2],
		parent: HasConstant,
		value: BlobIndex,
	}
	CustomAttribute = 0x0c {
		parent: HasCustomAttribute,
		ty: CustomAttributeType,
		value: BlobIndex,
	}
	FieldMarshal = 0x0d {
		parent: HasFieldMarshal,
		native_type: BlobIndex,
	}
	DeclSecurity = 0x0e {
		action: u16,
		parent: HasDeclSecurity,
		permission_set: BlobIndex,
	}
	ClassLayout = 0x0f {
		packing_size: u16,
		class_size: u32,
		parent: TypeDefIndex,
	}
	FieldLayout = 0x10 {
		offset: u32,
		field: FieldIndex,
	}
	StandAloneSig = 0x11 {
		signature: BlobIndex,
	}
	EventMap = 0x12 {
		parent: TypeDefIndex,
		event_list: EventIndex,
	}
	EventPtr = 0x13 {
		event: EventIndex,
	}
	Event = 0x14 {
		flags: EventAttributes,
		name: StringIndex,
		event_type: TypeDefOrRef,
	}
	PropertyMap = 0x15 {
		parent: TypeDefIndex,
		property_list: PropertyIndex,
	}
	PropertyPtr = 0x16 {
		property: PropertyIndex,
	}
	Property = 0x17 {
		flags: PropertyAttributes,
		name: StringIndex,
		ty: BlobIndex,
	}
	MethodSemantics = 0x18 {
		flags: MethodSemanticsAttributes,
		method: MethodDefIndex,
		association: HasSemantics,
	}
	MethodImpl = 0x19 {
		class: TypeDefIndex,
		body: MethodDefOrRef,
		declaration: MethodDefOrRef,
	}
	ModuleRef = 0x1a {
		name: StringIndex,
	}
	TypeSpec = 0x1b {
		signature: BlobIndex,
	}
	ImplMap = 0x1c {
		flags: PInvokeAttributes,
		member_forwarded: MemberForwarded,
		import_name: StringIndex,
		import_scope: ModuleRefIndex,
	}
	FieldRVA = 0x1d {
		rva: u32,
		field: FieldIndex,
	}
	EncLog = 0x1e {
		token: u32,
		func_code: u32,
	}
	EncMap = 0x1f {
		token: u32,
	}
	Assembly = 0x20 {
		hash_algorithm: AssemblyHashAlgorithm,
		major_version: u16,
		minor_version: u16,
		build_number: u16,
		revision_number: u16,
		flags: AssemblyFlags,
		public_key: BlobIndex,
		name: StringIndex,
		culture: StringIndex,
	}
	AssemblyProcessor = 0x21 {
		processor: u32,
	}
	AssemblyOS = 0x22 {
		os_platform_id: u32,
		os_major_version: u32,
		os_minor_version: u32,
	}
	AssemblyRef = 0x23 {
		major_version: u16,
		minor_version: u16,
		build_number: u16,
		revision_number: u16,
		flags: AssemblyFlags,
		public_key_or_token: BlobIndex,
		name: StringIndex,
		culture: StringIndex,
		hash_value: BlobIndex,
	}
	AssemblyRefProcessor = 0x24 {
		processor: u32,
		assembly_ref: AssemblyRefIndex,
	}
	AssemblyRefOS = 0x25 {
		os_platform_id: u32,
		os_major_version: u32,
		os_minor_version: u32,
		assembly_ref: AssemblyRefIndex,
	}
	File = 0x26 {
		flags: FileAttributes,
		name: StringIndex,
		hash_value: BlobIndex,
	}
	ExportedType = 0x27 {
		flags: TypeAttributes,
		type_def_id: u32,
		type_name: StringIndex,
		type_namespace: StringIndex,
		implementation: Implementation,
	}
	ManifestResource = 0x28 {
		offset: u32,
		flags: ManifestResourceAttributes,
		name: StringIndex,
		implementation: Implementation,
	}
	NestedClass = 0x29 {
		nested_class: TypeDefIndex,
		enclosing_class: TypeDefIndex,
	}
	GenericParam = 0x2a {
		number: u16,
		flags: GenericParamAttributes,
		owner: TypeOrMethodDef,
		name: StringIndex,
	}
	MethodSpec = 0x2b {
		method: MethodDefOrRef,
		instantiation: BlobIndex,
	}
	GenericParamConstraint = 0x2c {
		owner: GenericParamIndex,
		constraint: TypeDefOrRef,
	}
}

/// Tables whose rows ECMA-335 §II.22 requires to be sorted, and whose bits
/// make up the `Sorted` vector of the `#~` header.
pub const SORTED_TABLES: &[TableKind] = &[
	TableKind::InterfaceImpl,
	TableKind::Constant,
	TableKind::CustomAttribute,
	TableKind::FieldMarshal,
	TableKind::DeclSecurity,
	TableKind::ClassLayout,
	TableKind::FieldLayout,
	TableKind::MethodSemantics,
	TableKind::MethodImpl,
	TableKind::ImplMap,
	TableKind::FieldRVA,
	TableKind::NestedClass,
	TableKind::GenericParam,
	TableKind::GenericParamConstraint,
];

pub const fn sorted_mask() -> u64 {
	let mut mask = 0u64;
	let mut i = 0;
	while i < SORTED_TABLES.len() {
		mask |= 1 << SORTED_TABLES[i] as usize;
		i += 1;
	}
	mask
}

impl Tables {
	/// Re-establishes the §II.22 mandated ordering for the tables that are
	/// not referenced by any index column. Stable, so ties keep insertion
	/// order. GenericParam and MemberRef rows are referenced by other rows
	/// and must already be in mandated order when they are appended.
	pub fn sort_required(&mut self) {
		self.interface_impl.sort_by_key(|r| (r.class, r.interface.raw()));
		self.constant.sort_by_key(|r| r.parent.raw());
		self.custom_attribute.sort_by_key(|r| r.parent.raw());
		self.field_marshal.sort_by_key(|r| r.parent.raw());
		self.decl_security.sort_by_key(|r| r.parent.raw());
		self.class_layout.sort_by_key(|r| r.parent);
		self.field_layout.sort_by_key(|r| r.field);
		self.method_semantics.sort_by_key(|r| r.association.raw());
		self.method_impl.sort_by_key(|r| r.class);
		self.impl_map.sort_by_key(|r| r.member_forwarded.raw());
		self.field_r_v_a.sort_by_key(|r| r.field);
		self.nested_class.sort_by_key(|r| r.nested_class);
		self.generic_param_constraint.sort_by_key(|r| r.owner);
	}
}

/// The parsed `#~` (or `#-`) stream: header fields plus the materialised
/// row vectors.
#[derive(Debug)]
pub struct TablesStream {
	pub major_version: u8,
	pub minor_version: u8,
	pub heap_sizes: u8,
	pub sorted: u64,
	pub sizes: IndexSizes,
	pub tables: Tables,
}

impl TablesStream {
	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn read(data: &[u8]) -> std::io::Result<Self> {
		let mut stream = Cursor::new(data);
		let _reserved = u32::read(&mut stream, &())?;
		let major_version = u8::read(&mut stream, &())?;
		let minor_version = u8::read(&mut stream, &())?;
		let heap_sizes = u8::read(&mut stream, &())?;
		let _reserved = u8::read(&mut stream, &())?;
		let valid = u64::read(&mut stream, &())?;
		let sorted = u64::read(&mut stream, &())?;

		let mut rows = [0u32; 64];
		for i in enumerate_set_bits(valid) {
			if TableKind::from_repr(i).is_none() {
				return Err(Error::from(ErrorKind::InvalidData));
			}
			rows[i] = u32::read(&mut stream, &())?;
		}

		let sizes = IndexSizes::new(heap_sizes, rows);
		let mut tables = Tables::default();
		tables.read_rows(&mut stream, &sizes)?;

		Ok(Self {
			major_version,
			minor_version,
			heap_sizes,
			sorted,
			sizes,
			tables,
		})
	}

	/// Emits the `#~` stream. Index widths derive from the final row counts
	/// and the given heap-size flags; appending rows after this call has no
	/// effect on the produced bytes.
	pub fn write(buf: &mut Vec<u8>, tables: &Tables, heap_sizes: u8) {
		let rows = tables.row_counts();
		let valid = tables.valid_mask();
		let sizes = IndexSizes::new(heap_sizes, rows);

		0u32.write(buf, &());
		2u8.write(buf, &());
		0u8.write(buf, &());
		heap_sizes.write(buf, &());
		1u8.write(buf, &());
		valid.write(buf, &());
		sorted_mask().write(buf, &());
		for i in enumerate_set_bits(valid) {
			rows[i].write(buf, &());
		}
		tables.write_rows(buf, &sizes);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sizes_with(rows: [u32; 64]) -> IndexSizes {
		IndexSizes::new(0, rows)
	}

	#[test]
	fn row_sizes_follow_index_widths() {
		let narrow = sizes_with([0; 64]);
		// flags(4) + name(2) + namespace(2) + extends(2) + fields(2) + methods(2)
		assert_eq!(TypeDef::row_size(&narrow), 14);
		assert_eq!(Module::row_size(&narrow), 10);
		assert_eq!(MethodDef::row_size(&narrow), 14);

		let mut rows = [0u32; 64];
		rows[TableKind::TypeDef as usize] = 1 << 14;
		let wide = sizes_with(rows);
		// TypeDefOrRef now needs 4 bytes.
		assert_eq!(TypeDef::row_size(&wide), 16);
	}

	#[test]
	fn stream_round_trips_rows() {
		let mut tables = Tables::default();
		tables.module.push(Module {
			generation: 0,
			name: StringIndex(1),
			mv_id: GuidIndex(1),
			enc_id: GuidIndex(0),
			enc_base_id: GuidIndex(0),
		});
		tables.type_def.push(TypeDef {
			flags: TypeAttributes::PUBLIC,
			type_name: StringIndex(10),
			type_namespace: StringIndex(20),
			extends: TypeDefOrRef::NULL,
			field_list: FieldIndex(1),
			method_list: MethodDefIndex(1),
		});

		let mut buf = vec![];
		TablesStream::write(&mut buf, &tables, 0);
		let stream = TablesStream::read(&buf).unwrap();
		assert_eq!(stream.major_version, 2);
		assert_eq!(stream.tables, tables);
		assert_eq!(stream.sorted, sorted_mask());
	}

	#[test]
	fn sort_orders_by_mandated_keys() {
		let mut tables = Tables::default();
		tables.nested_class.push(NestedClass {
			nested_class: TypeDefIndex(3),
			enclosing_class: TypeDefIndex(1),
		});
		tables.nested_class.push(NestedClass {
			nested_class: TypeDefIndex(2),
			enclosing_class: TypeDefIndex(1),
		});
		tables.sort_required();
		assert_eq!(tables.nested_class[0].nested_class, TypeDefIndex(2));
		assert_eq!(tables.nested_class[1].nested_class, TypeDefIndex(3));
	}
}
