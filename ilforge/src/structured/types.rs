use crate::structured::signatures::MethodSig;

macro_rules! define_handles {
	($($(#[$attr: meta])* $id: ident),*) => {$(
		$(#[$attr])*
		#[repr(transparent)]
		#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
		pub struct $id(pub(crate) u32);

		impl $id {
			#[inline]
			pub(crate) fn new(index: usize) -> Self {
				Self(index as u32)
			}

			#[inline]
			pub(crate) fn index(self) -> usize {
				self.0 as usize
			}

			/// The 1-based row number this entity occupies in its table.
			#[inline]
			pub(crate) fn row(self) -> u32 {
				self.0 + 1
			}
		}
	)*};
}

define_handles! {
	/// A class defined in this image (a TypeDef row).
	ClassDefHandle,
	/// A class living in another scope (a TypeRef row).
	ClassRefHandle,
	FieldHandle,
	MethodHandle,
	PropertyHandle,
	EventHandle,
	MemberRefHandle,
	/// An interned constructed type (a TypeSpec row).
	TypeSpecHandle,
	MethodSpecHandle,
	StandAloneSigHandle,
	AssemblyRefHandle,
	ModuleRefHandle,
	FileHandle,
	ExportedTypeHandle,
	ResourceHandle
}

/// A reference to a type row: defined here, imported, or constructed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TypeHandle {
	Def(ClassDefHandle),
	Ref(ClassRefHandle),
	Spec(TypeSpecHandle),
}

/// The shape suffix of a general (multi-dimensional) array.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct ArrayShape {
	pub rank: u32,
	pub sizes: Vec<u32>,
	pub lo_bounds: Vec<i32>,
}

/// A type as it appears inside signature blobs. Equality and hashing are
/// structural, which is what the MemberRef and TypeSpec dedup maps rely on.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum TypeSig {
	Void,
	Bool,
	Char,
	I1,
	U1,
	I2,
	U2,
	I4,
	U4,
	I8,
	U8,
	R4,
	R8,
	String,
	Object,
	/// System.TypedReference.
	TypedRef,
	/// System.IntPtr.
	IntPtr,
	/// System.UIntPtr.
	UIntPtr,
	/// A reference type, by TypeDef/Ref/Spec.
	Class(TypeHandle),
	/// A value type, by TypeDef/Ref/Spec.
	ValueType(TypeHandle),
	/// Unmanaged pointer to the inner type.
	Ptr(Box<TypeSig>),
	/// Managed by-ref to the inner type.
	ByRef(Box<TypeSig>),
	/// A local variable pinning its referent.
	Pinned(Box<TypeSig>),
	/// Single-dimensional, zero-based array.
	SzArray(Box<TypeSig>),
	/// General array with explicit shape.
	Array(Box<TypeSig>, ArrayShape),
	/// Generic parameter of the enclosing type, by index.
	Var(u32),
	/// Generic parameter of the enclosing method, by index.
	MVar(u32),
	/// An instantiation of a generic type definition.
	GenericInst {
		value_type: bool,
		ty: TypeHandle,
		args: Vec<TypeSig>,
	},
	/// Pointer to a function with the given signature.
	FnPtr(Box<MethodSig>),
	/// Required custom modifier preceding the inner type.
	CModReqd(TypeHandle, Box<TypeSig>),
	/// Optional custom modifier preceding the inner type.
	CModOpt(TypeHandle, Box<TypeSig>),
}

impl TypeSig {
	pub fn class(handle: TypeHandle) -> Self {
		TypeSig::Class(handle)
	}

	pub fn value_type(handle: TypeHandle) -> Self {
		TypeSig::ValueType(handle)
	}

	pub fn sz_array(element: TypeSig) -> Self {
		TypeSig::SzArray(Box::new(element))
	}

	pub fn by_ref(inner: TypeSig) -> Self {
		TypeSig::ByRef(Box::new(inner))
	}

	pub fn ptr(inner: TypeSig) -> Self {
		TypeSig::Ptr(Box::new(inner))
	}
}
