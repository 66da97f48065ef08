//! The entities hanging off an [`crate::Image`]: assembly identity, classes,
//! members, generic parameters, constants and custom attributes.

use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::raw::heaps::table::{
	AssemblyFlags, AssemblyHashAlgorithm, EventAttributes, FieldAttributes, FileAttributes,
	GenericParamAttributes, ManifestResourceAttributes, MethodAttributes, MethodImplAttributes,
	MethodSemanticsAttributes, ParamAttributes, PInvokeAttributes, PropertyAttributes,
	TypeAttributes,
};
use crate::structured::body::MethodBody;
use crate::structured::signatures::{FieldSig, MemberRefSig, MethodSig, PropertySig};
use crate::structured::signatures::LocalVar;
use crate::structured::types::{
	AssemblyRefHandle, ClassDefHandle, ClassRefHandle, EventHandle, ExportedTypeHandle,
	FieldHandle, FileHandle, MemberRefHandle, MethodHandle, MethodSpecHandle, ModuleRefHandle,
	PropertyHandle, ResourceHandle, StandAloneSigHandle, TypeHandle, TypeSpecHandle,
};

/// The assembly manifest of an image.
#[derive(Debug, Clone, Default)]
pub struct AssemblyDef {
	pub name: String,
	pub version: (u16, u16, u16, u16),
	pub flags: AssemblyFlags,
	pub hash_algorithm: AssemblyHashAlgorithm,
	/// Empty when culture-neutral.
	pub culture: String,
	/// Empty when the assembly carries no public key.
	pub public_key: Vec<u8>,
}

impl AssemblyDef {
	pub fn new(name: impl Into<String>, version: (u16, u16, u16, u16)) -> Self {
		Self {
			name: name.into(),
			version,
			hash_algorithm: AssemblyHashAlgorithm::SHA1,
			..Default::default()
		}
	}
}

/// A reference to another assembly.
#[derive(Debug, Clone, Default)]
pub struct AssemblyRefDef {
	pub name: String,
	pub version: (u16, u16, u16, u16),
	pub flags: AssemblyFlags,
	pub culture: String,
	pub public_key_or_token: Vec<u8>,
	pub hash_value: Vec<u8>,
}

impl AssemblyRefDef {
	pub fn new(name: impl Into<String>, version: (u16, u16, u16, u16)) -> Self {
		Self {
			name: name.into(),
			version,
			..Default::default()
		}
	}
}

/// The single Module row of an image.
#[derive(Debug, Clone)]
pub struct ModuleDef {
	pub name: String,
	pub mvid: Uuid,
	pub generation: u16,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ModuleRefDef {
	pub name: String,
}

/// Where a [`ClassRef`] resolves: another assembly, another module of this
/// assembly, or the class enclosing a nested reference. A TypeRef whose
/// scope is the Module table itself is rejected as malformed on load.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ResolutionScopeRef {
	ModuleRef(ModuleRefHandle),
	AssemblyRef(AssemblyRefHandle),
	Nested(ClassRefHandle),
}

/// A class in another scope (a TypeRef row). Deduplicated structurally.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ClassRef {
	pub scope: ResolutionScopeRef,
	pub namespace: String,
	pub name: String,
}

/// Explicit layout information from the ClassLayout table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ClassLayoutInfo {
	pub packing_size: u16,
	pub class_size: u32,
}

/// A class defined in this image. Owns its members exclusively; the member
/// rows of consecutive classes are contiguous in the emitted tables.
#[derive(Debug, Clone)]
pub struct ClassDef {
	pub flags: TypeAttributes,
	pub namespace: String,
	pub name: String,
	pub extends: Option<TypeHandle>,
	pub generic_params: Vec<GenericParamDef>,
	pub interfaces: Vec<TypeHandle>,
	pub layout: Option<ClassLayoutInfo>,
	/// Explicit overrides (MethodImpl rows): `(body, declaration)` pairs.
	pub overrides: Vec<(MethodRef, MethodRef)>,
	pub(crate) fields: Vec<FieldHandle>,
	pub(crate) methods: Vec<MethodHandle>,
	pub(crate) properties: Vec<PropertyHandle>,
	pub(crate) events: Vec<EventHandle>,
	pub(crate) enclosing: Option<ClassDefHandle>,
	pub(crate) nested: Vec<ClassDefHandle>,
}

impl ClassDef {
	pub(crate) fn new(
		namespace: impl Into<String>,
		name: impl Into<String>,
		flags: TypeAttributes,
		extends: Option<TypeHandle>,
	) -> Self {
		Self {
			flags,
			namespace: namespace.into(),
			name: name.into(),
			extends,
			generic_params: vec![],
			interfaces: vec![],
			layout: None,
			overrides: vec![],
			fields: vec![],
			methods: vec![],
			properties: vec![],
			events: vec![],
			enclosing: None,
			nested: vec![],
		}
	}

	pub fn fields(&self) -> &[FieldHandle] {
		&self.fields
	}

	pub fn methods(&self) -> &[MethodHandle] {
		&self.methods
	}

	pub fn properties(&self) -> &[PropertyHandle] {
		&self.properties
	}

	pub fn events(&self) -> &[EventHandle] {
		&self.events
	}

	pub fn enclosing(&self) -> Option<ClassDefHandle> {
		self.enclosing
	}

	pub fn nested(&self) -> &[ClassDefHandle] {
		&self.nested
	}

	pub fn is_nested(&self) -> bool {
		self.enclosing.is_some()
	}
}

/// A field of a class.
#[derive(Debug, Clone)]
pub struct FieldDef {
	pub flags: FieldAttributes,
	pub name: String,
	pub sig: FieldSig,
	pub constant: Option<ConstantValue>,
	/// Opaque marshalling descriptor (FieldMarshal.NativeType blob).
	pub marshal: Option<Vec<u8>>,
	/// Explicit byte offset within the class (FieldLayout row).
	pub layout_offset: Option<u32>,
	/// Initial data placed in the image and referenced by a FieldRVA row.
	pub rva_data: Option<Vec<u8>>,
}

impl FieldDef {
	pub fn new(name: impl Into<String>, flags: FieldAttributes, sig: FieldSig) -> Self {
		Self {
			flags,
			name: name.into(),
			sig,
			constant: None,
			marshal: None,
			layout_offset: None,
			rva_data: None,
		}
	}
}

/// PInvoke information for a method forwarded to native code.
#[derive(Debug, Clone)]
pub struct PInvokeInfo {
	pub flags: PInvokeAttributes,
	pub import_name: String,
	pub import_scope: ModuleRefHandle,
}

/// A method of a class, owning its parameters and IL body.
#[derive(Debug, Clone)]
pub struct MethodDef {
	pub flags: MethodAttributes,
	pub impl_flags: MethodImplAttributes,
	pub name: String,
	pub sig: MethodSig,
	pub params: Vec<ParamDef>,
	pub body: Option<MethodBody>,
	pub pinvoke: Option<PInvokeInfo>,
	pub generic_params: Vec<GenericParamDef>,
}

impl MethodDef {
	pub fn new(name: impl Into<String>, flags: MethodAttributes, sig: MethodSig) -> Self {
		Self {
			flags,
			impl_flags: MethodImplAttributes::IL,
			name: name.into(),
			sig,
			params: vec![],
			body: None,
			pinvoke: None,
			generic_params: vec![],
		}
	}

	/// Appends a named parameter row; `sequence` 1 is the first parameter,
	/// 0 names the return value.
	pub fn with_param(mut self, sequence: u16, name: impl Into<String>) -> Self {
		self.params.push(ParamDef {
			flags: ParamAttributes::default(),
			sequence,
			name: name.into(),
			constant: None,
			marshal: None,
		});
		self
	}
}

#[derive(Debug, Clone)]
pub struct ParamDef {
	pub flags: ParamAttributes,
	pub sequence: u16,
	pub name: String,
	pub constant: Option<ConstantValue>,
	pub marshal: Option<Vec<u8>>,
}

/// A generic parameter owned by a class or method, with its constraints.
#[derive(Debug, Clone)]
pub struct GenericParamDef {
	pub number: u16,
	pub flags: GenericParamAttributes,
	pub name: String,
	pub constraints: Vec<TypeHandle>,
}

impl GenericParamDef {
	pub fn new(number: u16, name: impl Into<String>) -> Self {
		Self {
			number,
			flags: GenericParamAttributes::default(),
			name: name.into(),
			constraints: vec![],
		}
	}
}

/// A property and its accessor bindings (MethodSemantics rows).
#[derive(Debug, Clone)]
pub struct PropertyDef {
	pub flags: PropertyAttributes,
	pub name: String,
	pub sig: PropertySig,
	pub constant: Option<ConstantValue>,
	pub accessors: Vec<(MethodSemanticsAttributes, MethodHandle)>,
}

/// An event and its accessor bindings.
#[derive(Debug, Clone)]
pub struct EventDef {
	pub flags: EventAttributes,
	pub name: String,
	pub event_type: Option<TypeHandle>,
	pub accessors: Vec<(MethodSemanticsAttributes, MethodHandle)>,
}

/// The parent of a MemberRef row.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemberRefParentRef {
	ClassDef(ClassDefHandle),
	ClassRef(ClassRefHandle),
	ModuleRef(ModuleRefHandle),
	Method(MethodHandle),
	TypeSpec(TypeSpecHandle),
}

/// An imported field or method. Deduplicated structurally, which requires
/// the structural equality of [`crate::TypeSig`].
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct MemberRefDef {
	pub parent: MemberRefParentRef,
	pub name: String,
	pub sig: MemberRefSig,
}

/// A MethodDefOrRef target: the two tables a method reference may point at.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MethodRef {
	Def(MethodHandle),
	Ref(MemberRefHandle),
}

/// A field as an IL token operand (`ldfld` and friends).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FieldItem {
	Def(FieldHandle),
	Ref(MemberRefHandle),
}

/// A method as an IL token operand (`call`, `callvirt`, `newobj`, ...).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MethodItem {
	Def(MethodHandle),
	Ref(MemberRefHandle),
	Spec(MethodSpecHandle),
}

/// Anything `ldtoken` can name: a type, field or method row.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CodeItem {
	Type(TypeHandle),
	Field(FieldItem),
	Method(MethodItem),
}

/// A generic method instantiation (MethodSpec row).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct MethodSpecDef {
	pub method: MethodRef,
	pub args: Vec<crate::structured::types::TypeSig>,
}

/// A StandAloneSig row: either a local-variable signature or a call-site
/// signature for `calli`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum StandAloneSigDef {
	Locals(Vec<LocalVar>),
	Method(MethodSig),
}

/// A file of a multi-file assembly.
#[derive(Debug, Clone)]
pub struct FileDef {
	pub flags: FileAttributes,
	pub name: String,
	pub hash_value: Vec<u8>,
}

/// The Implementation coded targets.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ImplementationRef {
	File(FileHandle),
	AssemblyRef(AssemblyRefHandle),
	ExportedType(ExportedTypeHandle),
}

/// A type exported from another file or forwarded to another assembly.
#[derive(Debug, Clone)]
pub struct ExportedTypeDef {
	pub flags: TypeAttributes,
	pub type_def_id: u32,
	pub namespace: String,
	pub name: String,
	pub implementation: ImplementationRef,
}

/// A manifest resource row. The byte offset points into the resources blob,
/// which lives outside the metadata streams.
#[derive(Debug, Clone)]
pub struct ManifestResourceDef {
	pub offset: u32,
	pub flags: ManifestResourceAttributes,
	pub name: String,
	/// `None` marks a resource embedded in this file.
	pub implementation: Option<ImplementationRef>,
}

/// The parent of a DeclSecurity row.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SecurityOwner {
	Assembly,
	Class(ClassDefHandle),
	Method(MethodHandle),
}

/// A declarative security row; the permission set stays an opaque blob.
#[derive(Debug, Clone)]
pub struct DeclSecurityDef {
	pub action: u16,
	pub permission_set: Vec<u8>,
}

/// The owner of a generic parameter (TypeOrMethodDef coded targets).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum GenericParamOwner {
	Class(ClassDefHandle),
	Method(MethodHandle),
}

/// Everything a custom attribute can be attached to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AttributeOwner {
	Assembly,
	Module,
	Class(ClassDefHandle),
	ClassRef(ClassRefHandle),
	TypeSpec(TypeSpecHandle),
	Field(FieldHandle),
	Method(MethodHandle),
	/// A parameter, addressed by method and index into its parameter list.
	Param(MethodHandle, u16),
	Property(PropertyHandle),
	Event(EventHandle),
	GenericParam(GenericParamOwner, u16),
	MemberRef(MemberRefHandle),
	AssemblyRef(AssemblyRefHandle),
	ModuleRef(ModuleRefHandle),
	File(FileHandle),
	ExportedType(ExportedTypeHandle),
	ManifestResource(ResourceHandle),
	StandAloneSig(StandAloneSigHandle),
	MethodSpec(MethodSpecHandle),
}

/// A custom attribute: constructor plus the raw value blob. The blob keeps
/// its encoded form; named-argument decoding is not this crate's concern.
#[derive(Debug, Clone)]
pub struct CustomAttributeDef {
	pub ctor: MethodRef,
	pub value: Vec<u8>,
}

/// A compile-time constant from the Constant table.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
	Bool(bool),
	Char(u16),
	I1(i8),
	U1(u8),
	I2(i16),
	U2(u16),
	I4(i32),
	U4(u32),
	I8(i64),
	U8(u64),
	R4(f32),
	R8(f64),
	String(String),
	/// The null reference, encoded as a CLASS-typed zero.
	Null,
}

impl ConstantValue {
	pub(crate) fn elem_type(&self) -> u8 {
		use crate::structured::signatures::elem;
		match self {
			ConstantValue::Bool(_) => elem::BOOLEAN,
			ConstantValue::Char(_) => elem::CHAR,
			ConstantValue::I1(_) => elem::I1,
			ConstantValue::U1(_) => elem::U1,
			ConstantValue::I2(_) => elem::I2,
			ConstantValue::U2(_) => elem::U2,
			ConstantValue::I4(_) => elem::I4,
			ConstantValue::U4(_) => elem::U4,
			ConstantValue::I8(_) => elem::I8,
			ConstantValue::U8(_) => elem::U8,
			ConstantValue::R4(_) => elem::R4,
			ConstantValue::R8(_) => elem::R8,
			ConstantValue::String(_) => elem::STRING,
			ConstantValue::Null => elem::CLASS,
		}
	}

	pub(crate) fn to_blob(&self) -> Vec<u8> {
		match self {
			ConstantValue::Bool(v) => vec![*v as u8],
			ConstantValue::Char(v) => v.to_le_bytes().to_vec(),
			ConstantValue::I1(v) => v.to_le_bytes().to_vec(),
			ConstantValue::U1(v) => v.to_le_bytes().to_vec(),
			ConstantValue::I2(v) => v.to_le_bytes().to_vec(),
			ConstantValue::U2(v) => v.to_le_bytes().to_vec(),
			ConstantValue::I4(v) => v.to_le_bytes().to_vec(),
			ConstantValue::U4(v) => v.to_le_bytes().to_vec(),
			ConstantValue::I8(v) => v.to_le_bytes().to_vec(),
			ConstantValue::U8(v) => v.to_le_bytes().to_vec(),
			ConstantValue::R4(v) => v.to_le_bytes().to_vec(),
			ConstantValue::R8(v) => v.to_le_bytes().to_vec(),
			ConstantValue::String(v) => {
				v.encode_utf16().flat_map(u16::to_le_bytes).collect()
			},
			ConstantValue::Null => vec![0; 4],
		}
	}

	pub(crate) fn from_row(elem_type: u8, blob: &[u8]) -> Result<Self> {
		use crate::structured::signatures::elem;

		fn array<const N: usize>(blob: &[u8]) -> Result<[u8; N]> {
			blob.try_into()
				.map_err(|_| Error::MalformedImage("constant blob width mismatch"))
		}

		Ok(match elem_type {
			elem::BOOLEAN => ConstantValue::Bool(array::<1>(blob)?[0] != 0),
			elem::CHAR => ConstantValue::Char(u16::from_le_bytes(array(blob)?)),
			elem::I1 => ConstantValue::I1(i8::from_le_bytes(array(blob)?)),
			elem::U1 => ConstantValue::U1(array::<1>(blob)?[0]),
			elem::I2 => ConstantValue::I2(i16::from_le_bytes(array(blob)?)),
			elem::U2 => ConstantValue::U2(u16::from_le_bytes(array(blob)?)),
			elem::I4 => ConstantValue::I4(i32::from_le_bytes(array(blob)?)),
			elem::U4 => ConstantValue::U4(u32::from_le_bytes(array(blob)?)),
			elem::I8 => ConstantValue::I8(i64::from_le_bytes(array(blob)?)),
			elem::U8 => ConstantValue::U8(u64::from_le_bytes(array(blob)?)),
			elem::R4 => ConstantValue::R4(f32::from_le_bytes(array(blob)?)),
			elem::R8 => ConstantValue::R8(f64::from_le_bytes(array(blob)?)),
			elem::STRING => {
				let units: Vec<u16> = blob
					.chunks_exact(2)
					.map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
					.collect();
				ConstantValue::String(
					String::from_utf16(&units)
						.map_err(|_| Error::MalformedImage("constant string not UTF-16"))?,
				)
			},
			elem::CLASS => ConstantValue::Null,
			_ => return Err(Error::MalformedImage("unknown constant element type")),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn constant_blobs_round_trip() {
		for value in [
			ConstantValue::Bool(true),
			ConstantValue::Char(0x03A9),
			ConstantValue::I4(-5),
			ConstantValue::I8(1 << 40),
			ConstantValue::R8(1.5),
			ConstantValue::String("päivää".into()),
			ConstantValue::Null,
		] {
			let blob = value.to_blob();
			let back = ConstantValue::from_row(value.elem_type(), &blob).unwrap();
			assert_eq!(back, value);
		}
	}

	#[test]
	fn constant_rejects_width_mismatch() {
		assert!(ConstantValue::from_row(crate::structured::signatures::elem::I4, &[1, 2]).is_err());
	}
}
