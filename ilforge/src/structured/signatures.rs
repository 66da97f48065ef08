//! The blob signature codec: field, method, property, local-variable,
//! TypeSpec and MethodSpec signatures, in both directions.

use std::io::Cursor;

use bitflags::bitflags;

use crate::errors::{Error, Result};
use crate::raw::heaps::table::TableKind;
use crate::raw::indices::coded_index::TypeDefOrRef;
use crate::structured::types::{ArrayShape, TypeHandle, TypeSig};
use crate::utilities::{
	read_compressed_i32, read_compressed_u32, write_compressed_i32, write_compressed_u32,
	FromByteStream,
};

/// ELEMENT_TYPE_* constants (ECMA-335 §II.23.1.16).
pub(crate) mod elem {
	pub const END: u8 = 0x00;
	pub const VOID: u8 = 0x01;
	pub const BOOLEAN: u8 = 0x02;
	pub const CHAR: u8 = 0x03;
	pub const I1: u8 = 0x04;
	pub const U1: u8 = 0x05;
	pub const I2: u8 = 0x06;
	pub const U2: u8 = 0x07;
	pub const I4: u8 = 0x08;
	pub const U4: u8 = 0x09;
	pub const I8: u8 = 0x0A;
	pub const U8: u8 = 0x0B;
	pub const R4: u8 = 0x0C;
	pub const R8: u8 = 0x0D;
	pub const STRING: u8 = 0x0E;
	pub const PTR: u8 = 0x0F;
	pub const BYREF: u8 = 0x10;
	pub const VALUETYPE: u8 = 0x11;
	pub const CLASS: u8 = 0x12;
	pub const VAR: u8 = 0x13;
	pub const ARRAY: u8 = 0x14;
	pub const GENERICINST: u8 = 0x15;
	pub const TYPEDBYREF: u8 = 0x16;
	pub const I: u8 = 0x18;
	pub const U: u8 = 0x19;
	pub const FNPTR: u8 = 0x1B;
	pub const OBJECT: u8 = 0x1C;
	pub const SZARRAY: u8 = 0x1D;
	pub const MVAR: u8 = 0x1E;
	pub const CMOD_REQD: u8 = 0x1F;
	pub const CMOD_OPT: u8 = 0x20;
	pub const SENTINEL: u8 = 0x41;
	pub const PINNED: u8 = 0x45;
}

/// Leading bytes of non-method signature blobs.
pub(crate) const SIG_FIELD: u8 = 0x06;
pub(crate) const SIG_LOCALS: u8 = 0x07;
pub(crate) const SIG_PROPERTY: u8 = 0x08;
pub(crate) const SIG_GENERIC_INST: u8 = 0x0A;
pub(crate) const SIG_HAS_THIS: u8 = 0x20;

bitflags! {
	/// The first byte of a method signature.
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct CallingConvention: u8 {
		const DEFAULT = 0x0;
		const C = 0x1;
		const STD_CALL = 0x2;
		const THIS_CALL = 0x3;
		const FAST_CALL = 0x4;
		const VAR_ARG = 0x5;
		const GENERIC = 0x10;
		const HAS_THIS = 0x20;
		const EXPLICIT_THIS = 0x40;
	}
}

impl CallingConvention {
	/// The low nibble, which is a plain enumeration rather than a bit set.
	#[inline]
	pub fn kind(&self) -> u8 {
		self.bits() & 0x0F
	}

	pub fn is_vararg(&self) -> bool {
		self.kind() == Self::VAR_ARG.bits()
	}
}

/// Resolution of coded type tokens found inside signature blobs; implemented
/// by the load pipeline, which knows the final row counts.
pub(crate) trait SigDecode {
	fn type_handle(&self, coded: TypeDefOrRef) -> Result<TypeHandle>;
}

/// Packs a type handle into the compressed TypeDefOrRef form used inside
/// blobs. Row numbers equal arena order for all three target tables, so no
/// build state is needed.
pub(crate) fn encode_type_handle(handle: TypeHandle) -> TypeDefOrRef {
	let (kind, row) = match handle {
		TypeHandle::Def(h) => (TableKind::TypeDef, h.row()),
		TypeHandle::Ref(h) => (TableKind::TypeRef, h.row()),
		TypeHandle::Spec(h) => (TableKind::TypeSpec, h.row()),
	};
	TypeDefOrRef::encode(kind, row).unwrap()
}

fn truncated(err: std::io::Error) -> Error {
	let _ = err;
	Error::Signature("truncated signature blob")
}

impl TypeSig {
	pub(crate) fn encode(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
		match self {
			TypeSig::Void => buf.push(elem::VOID),
			TypeSig::Bool => buf.push(elem::BOOLEAN),
			TypeSig::Char => buf.push(elem::CHAR),
			TypeSig::I1 => buf.push(elem::I1),
			TypeSig::U1 => buf.push(elem::U1),
			TypeSig::I2 => buf.push(elem::I2),
			TypeSig::U2 => buf.push(elem::U2),
			TypeSig::I4 => buf.push(elem::I4),
			TypeSig::U4 => buf.push(elem::U4),
			TypeSig::I8 => buf.push(elem::I8),
			TypeSig::U8 => buf.push(elem::U8),
			TypeSig::R4 => buf.push(elem::R4),
			TypeSig::R8 => buf.push(elem::R8),
			TypeSig::String => buf.push(elem::STRING),
			TypeSig::Object => buf.push(elem::OBJECT),
			TypeSig::TypedRef => buf.push(elem::TYPEDBYREF),
			TypeSig::IntPtr => buf.push(elem::I),
			TypeSig::UIntPtr => buf.push(elem::U),
			TypeSig::Class(handle) => {
				buf.push(elem::CLASS);
				encode_type_handle(*handle).write_compressed(buf)?;
			},
			TypeSig::ValueType(handle) => {
				buf.push(elem::VALUETYPE);
				encode_type_handle(*handle).write_compressed(buf)?;
			},
			TypeSig::Ptr(inner) => {
				buf.push(elem::PTR);
				inner.encode(buf)?;
			},
			TypeSig::ByRef(inner) => {
				buf.push(elem::BYREF);
				inner.encode(buf)?;
			},
			TypeSig::Pinned(inner) => {
				buf.push(elem::PINNED);
				inner.encode(buf)?;
			},
			TypeSig::SzArray(element) => {
				buf.push(elem::SZARRAY);
				element.encode(buf)?;
			},
			TypeSig::Array(element, shape) => {
				buf.push(elem::ARRAY);
				element.encode(buf)?;
				write_compressed_u32(buf, shape.rank)?;
				write_compressed_u32(buf, shape.sizes.len() as u32)?;
				for size in &shape.sizes {
					write_compressed_u32(buf, *size)?;
				}
				write_compressed_u32(buf, shape.lo_bounds.len() as u32)?;
				for bound in &shape.lo_bounds {
					write_compressed_i32(buf, *bound)?;
				}
			},
			TypeSig::Var(number) => {
				buf.push(elem::VAR);
				write_compressed_u32(buf, *number)?;
			},
			TypeSig::MVar(number) => {
				buf.push(elem::MVAR);
				write_compressed_u32(buf, *number)?;
			},
			TypeSig::GenericInst { value_type, ty, args } => {
				buf.push(elem::GENERICINST);
				buf.push(if *value_type { elem::VALUETYPE } else { elem::CLASS });
				encode_type_handle(*ty).write_compressed(buf)?;
				write_compressed_u32(buf, args.len() as u32)?;
				for arg in args {
					arg.encode(buf)?;
				}
			},
			TypeSig::FnPtr(sig) => {
				buf.push(elem::FNPTR);
				sig.encode(buf)?;
			},
			TypeSig::CModReqd(modifier, inner) => {
				buf.push(elem::CMOD_REQD);
				encode_type_handle(*modifier).write_compressed(buf)?;
				inner.encode(buf)?;
			},
			TypeSig::CModOpt(modifier, inner) => {
				buf.push(elem::CMOD_OPT);
				encode_type_handle(*modifier).write_compressed(buf)?;
				inner.encode(buf)?;
			},
		}
		Ok(())
	}

	pub(crate) fn decode(stream: &mut Cursor<&[u8]>, ctx: &impl SigDecode) -> Result<TypeSig> {
		let tag = u8::read(stream, &()).map_err(truncated)?;
		let read_type_handle = |stream: &mut Cursor<&[u8]>| -> Result<TypeHandle> {
			let coded = TypeDefOrRef::read_compressed(stream)
				.map_err(|_| Error::Signature("invalid coded type token"))?;
			ctx.type_handle(coded)
		};
		Ok(match tag {
			elem::VOID => TypeSig::Void,
			elem::BOOLEAN => TypeSig::Bool,
			elem::CHAR => TypeSig::Char,
			elem::I1 => TypeSig::I1,
			elem::U1 => TypeSig::U1,
			elem::I2 => TypeSig::I2,
			elem::U2 => TypeSig::U2,
			elem::I4 => TypeSig::I4,
			elem::U4 => TypeSig::U4,
			elem::I8 => TypeSig::I8,
			elem::U8 => TypeSig::U8,
			elem::R4 => TypeSig::R4,
			elem::R8 => TypeSig::R8,
			elem::STRING => TypeSig::String,
			elem::OBJECT => TypeSig::Object,
			elem::TYPEDBYREF => TypeSig::TypedRef,
			elem::I => TypeSig::IntPtr,
			elem::U => TypeSig::UIntPtr,
			elem::CLASS => TypeSig::Class(read_type_handle(stream)?),
			elem::VALUETYPE => TypeSig::ValueType(read_type_handle(stream)?),
			elem::PTR => TypeSig::Ptr(Box::new(TypeSig::decode(stream, ctx)?)),
			elem::BYREF => TypeSig::ByRef(Box::new(TypeSig::decode(stream, ctx)?)),
			elem::PINNED => TypeSig::Pinned(Box::new(TypeSig::decode(stream, ctx)?)),
			elem::SZARRAY => TypeSig::SzArray(Box::new(TypeSig::decode(stream, ctx)?)),
			elem::ARRAY => {
				let element = TypeSig::decode(stream, ctx)?;
				let rank = read_compressed_u32(stream).map_err(truncated)?;
				let size_count = read_compressed_u32(stream).map_err(truncated)?;
				let mut sizes = Vec::with_capacity(size_count as usize);
				for _ in 0..size_count {
					sizes.push(read_compressed_u32(stream).map_err(truncated)?);
				}
				let bound_count = read_compressed_u32(stream).map_err(truncated)?;
				let mut lo_bounds = Vec::with_capacity(bound_count as usize);
				for _ in 0..bound_count {
					lo_bounds.push(read_compressed_i32(stream).map_err(truncated)?);
				}
				TypeSig::Array(Box::new(element), ArrayShape { rank, sizes, lo_bounds })
			},
			elem::VAR => TypeSig::Var(read_compressed_u32(stream).map_err(truncated)?),
			elem::MVAR => TypeSig::MVar(read_compressed_u32(stream).map_err(truncated)?),
			elem::GENERICINST => {
				let kind = u8::read(stream, &()).map_err(truncated)?;
				let value_type = match kind {
					elem::CLASS => false,
					elem::VALUETYPE => true,
					_ => return Err(Error::Signature("invalid generic instantiation kind")),
				};
				let ty = read_type_handle(stream)?;
				let count = read_compressed_u32(stream).map_err(truncated)?;
				let mut args = Vec::with_capacity(count as usize);
				for _ in 0..count {
					args.push(TypeSig::decode(stream, ctx)?);
				}
				TypeSig::GenericInst { value_type, ty, args }
			},
			elem::FNPTR => TypeSig::FnPtr(Box::new(MethodSig::decode(stream, ctx)?)),
			elem::CMOD_REQD => {
				let modifier = read_type_handle(stream)?;
				TypeSig::CModReqd(modifier, Box::new(TypeSig::decode(stream, ctx)?))
			},
			elem::CMOD_OPT => {
				let modifier = read_type_handle(stream)?;
				TypeSig::CModOpt(modifier, Box::new(TypeSig::decode(stream, ctx)?))
			},
			_ => return Err(Error::Signature("unknown ELEMENT_TYPE tag")),
		})
	}
}

/// A field signature: the field's type, custom modifiers included.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct FieldSig {
	pub ty: TypeSig,
}

impl FieldSig {
	pub fn new(ty: TypeSig) -> Self {
		Self { ty }
	}

	pub(crate) fn to_blob(&self) -> std::io::Result<Vec<u8>> {
		let mut buf = vec![SIG_FIELD];
		self.ty.encode(&mut buf)?;
		Ok(buf)
	}

	pub(crate) fn from_blob(blob: &[u8], ctx: &impl SigDecode) -> Result<Self> {
		let mut stream = Cursor::new(blob);
		if u8::read(&mut stream, &()).map_err(truncated)? != SIG_FIELD {
			return Err(Error::Signature("field signature must start with 0x06"));
		}
		Ok(Self {
			ty: TypeSig::decode(&mut stream, ctx)?,
		})
	}
}

/// A method signature, shared by MethodDef, MemberRef and StandAloneSig
/// (calli) blobs. `varargs` holds the parameters following the sentinel in
/// vararg call-site signatures.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct MethodSig {
	pub call_conv: CallingConvention,
	pub generic_param_count: u32,
	pub return_type: TypeSig,
	pub params: Vec<TypeSig>,
	pub varargs: Vec<TypeSig>,
}

impl MethodSig {
	/// A static method with the default managed calling convention.
	pub fn static_method(return_type: TypeSig, params: Vec<TypeSig>) -> Self {
		Self {
			call_conv: CallingConvention::DEFAULT,
			generic_param_count: 0,
			return_type,
			params,
			varargs: vec![],
		}
	}

	/// An instance method (`HASTHIS` set).
	pub fn instance_method(return_type: TypeSig, params: Vec<TypeSig>) -> Self {
		Self {
			call_conv: CallingConvention::HAS_THIS,
			..Self::static_method(return_type, params)
		}
	}

	pub fn with_generic_params(mut self, count: u32) -> Self {
		self.call_conv |= CallingConvention::GENERIC;
		self.generic_param_count = count;
		self
	}

	pub(crate) fn encode(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
		buf.push(self.call_conv.bits());
		if self.call_conv.contains(CallingConvention::GENERIC) {
			write_compressed_u32(buf, self.generic_param_count)?;
		}
		write_compressed_u32(buf, (self.params.len() + self.varargs.len()) as u32)?;
		self.return_type.encode(buf)?;
		for param in &self.params {
			param.encode(buf)?;
		}
		if !self.varargs.is_empty() {
			buf.push(elem::SENTINEL);
			for param in &self.varargs {
				param.encode(buf)?;
			}
		}
		Ok(())
	}

	pub(crate) fn decode(stream: &mut Cursor<&[u8]>, ctx: &impl SigDecode) -> Result<Self> {
		let call_conv =
			CallingConvention::from_bits_retain(u8::read(stream, &()).map_err(truncated)?);
		let generic_param_count = match call_conv.contains(CallingConvention::GENERIC) {
			true => read_compressed_u32(stream).map_err(truncated)?,
			false => 0,
		};
		let param_count = read_compressed_u32(stream).map_err(truncated)?;
		let return_type = TypeSig::decode(stream, ctx)?;

		let mut params = Vec::with_capacity(param_count as usize);
		let mut varargs = vec![];
		let mut past_sentinel = false;
		for _ in 0..param_count {
			let position = stream.position();
			if u8::read(stream, &()).map_err(truncated)? == elem::SENTINEL {
				if past_sentinel {
					return Err(Error::Signature("duplicate vararg sentinel"));
				}
				past_sentinel = true;
			} else {
				stream.set_position(position);
			}
			let param = TypeSig::decode(stream, ctx)?;
			match past_sentinel {
				true => varargs.push(param),
				false => params.push(param),
			}
		}

		Ok(Self {
			call_conv,
			generic_param_count,
			return_type,
			params,
			varargs,
		})
	}

	pub(crate) fn to_blob(&self) -> std::io::Result<Vec<u8>> {
		let mut buf = vec![];
		self.encode(&mut buf)?;
		Ok(buf)
	}

	pub(crate) fn from_blob(blob: &[u8], ctx: &impl SigDecode) -> Result<Self> {
		Self::decode(&mut Cursor::new(blob), ctx)
	}
}

/// A property signature: property type plus the indexer parameters.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PropertySig {
	pub has_this: bool,
	pub ty: TypeSig,
	pub params: Vec<TypeSig>,
}

impl PropertySig {
	pub fn new(has_this: bool, ty: TypeSig) -> Self {
		Self { has_this, ty, params: vec![] }
	}

	pub(crate) fn to_blob(&self) -> std::io::Result<Vec<u8>> {
		let mut buf = vec![SIG_PROPERTY | if self.has_this { SIG_HAS_THIS } else { 0 }];
		write_compressed_u32(&mut buf, self.params.len() as u32)?;
		self.ty.encode(&mut buf)?;
		for param in &self.params {
			param.encode(&mut buf)?;
		}
		Ok(buf)
	}

	pub(crate) fn from_blob(blob: &[u8], ctx: &impl SigDecode) -> Result<Self> {
		let mut stream = Cursor::new(blob);
		let first = u8::read(&mut stream, &()).map_err(truncated)?;
		if first & !SIG_HAS_THIS != SIG_PROPERTY {
			return Err(Error::Signature("property signature must start with 0x08"));
		}
		let count = read_compressed_u32(&mut stream).map_err(truncated)?;
		let ty = TypeSig::decode(&mut stream, ctx)?;
		let mut params = Vec::with_capacity(count as usize);
		for _ in 0..count {
			params.push(TypeSig::decode(&mut stream, ctx)?);
		}
		Ok(Self {
			has_this: first & SIG_HAS_THIS != 0,
			ty,
			params,
		})
	}
}

/// One local variable slot; pinning and by-ref are expressed through the
/// [`TypeSig::Pinned`] and [`TypeSig::ByRef`] wrappers.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct LocalVar {
	pub ty: TypeSig,
}

impl LocalVar {
	pub fn new(ty: TypeSig) -> Self {
		Self { ty }
	}
}

pub(crate) fn locals_to_blob(locals: &[LocalVar]) -> std::io::Result<Vec<u8>> {
	let mut buf = vec![SIG_LOCALS];
	write_compressed_u32(&mut buf, locals.len() as u32)?;
	for local in locals {
		local.ty.encode(&mut buf)?;
	}
	Ok(buf)
}

pub(crate) fn locals_from_blob(blob: &[u8], ctx: &impl SigDecode) -> Result<Vec<LocalVar>> {
	let mut stream = Cursor::new(blob);
	if u8::read(&mut stream, &()).map_err(truncated)? != SIG_LOCALS {
		return Err(Error::Signature("local signature must start with 0x07"));
	}
	let count = read_compressed_u32(&mut stream).map_err(truncated)?;
	let mut locals = Vec::with_capacity(count as usize);
	for _ in 0..count {
		locals.push(LocalVar {
			ty: TypeSig::decode(&mut stream, ctx)?,
		});
	}
	Ok(locals)
}

pub(crate) fn method_spec_to_blob(args: &[TypeSig]) -> std::io::Result<Vec<u8>> {
	let mut buf = vec![SIG_GENERIC_INST];
	write_compressed_u32(&mut buf, args.len() as u32)?;
	for arg in args {
		arg.encode(&mut buf)?;
	}
	Ok(buf)
}

pub(crate) fn method_spec_from_blob(blob: &[u8], ctx: &impl SigDecode) -> Result<Vec<TypeSig>> {
	let mut stream = Cursor::new(blob);
	if u8::read(&mut stream, &()).map_err(truncated)? != SIG_GENERIC_INST {
		return Err(Error::Signature("method instantiation must start with 0x0A"));
	}
	let count = read_compressed_u32(&mut stream).map_err(truncated)?;
	let mut args = Vec::with_capacity(count as usize);
	for _ in 0..count {
		args.push(TypeSig::decode(&mut stream, ctx)?);
	}
	Ok(args)
}

/// The signature of a MemberRef row, which may refer to either a method or
/// a field.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum MemberRefSig {
	Method(MethodSig),
	Field(FieldSig),
}

impl MemberRefSig {
	pub(crate) fn to_blob(&self) -> std::io::Result<Vec<u8>> {
		match self {
			MemberRefSig::Method(sig) => sig.to_blob(),
			MemberRefSig::Field(sig) => sig.to_blob(),
		}
	}

	pub(crate) fn from_blob(blob: &[u8], ctx: &impl SigDecode) -> Result<Self> {
		match blob.first() {
			Some(&SIG_FIELD) => Ok(MemberRefSig::Field(FieldSig::from_blob(blob, ctx)?)),
			Some(_) => Ok(MemberRefSig::Method(MethodSig::from_blob(blob, ctx)?)),
			None => Err(Error::Signature("empty member signature")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::structured::types::ClassRefHandle;

	struct Unchecked;

	impl SigDecode for Unchecked {
		fn type_handle(&self, coded: TypeDefOrRef) -> Result<TypeHandle> {
			let (kind, row) = coded.decode();
			Ok(match kind {
				TableKind::TypeDef => {
					TypeHandle::Def(crate::structured::types::ClassDefHandle(row - 1))
				},
				TableKind::TypeRef => TypeHandle::Ref(ClassRefHandle(row - 1)),
				_ => TypeHandle::Spec(crate::structured::types::TypeSpecHandle(row - 1)),
			})
		}
	}

	fn round_trip_method(sig: &MethodSig) -> MethodSig {
		MethodSig::from_blob(&sig.to_blob().unwrap(), &Unchecked).unwrap()
	}

	#[test]
	fn static_void_method_sig() {
		let sig = MethodSig::static_method(TypeSig::Void, vec![TypeSig::String]);
		let blob = sig.to_blob().unwrap();
		assert_eq!(blob, [0x00, 0x01, elem::VOID, elem::STRING]);
		assert_eq!(round_trip_method(&sig), sig);
	}

	#[test]
	fn generic_method_sig_keeps_var_numbers() {
		let sig = MethodSig::instance_method(TypeSig::Void, vec![TypeSig::Var(0)]);
		let blob = sig.to_blob().unwrap();
		assert_eq!(blob, [0x20, 0x01, elem::VOID, elem::VAR, 0x00]);
		assert_eq!(round_trip_method(&sig), sig);
	}

	#[test]
	fn vararg_sentinel_round_trips() {
		let mut sig = MethodSig::static_method(TypeSig::Void, vec![TypeSig::I4]);
		sig.call_conv = CallingConvention::VAR_ARG;
		sig.varargs = vec![TypeSig::R8, TypeSig::String];
		let back = round_trip_method(&sig);
		assert_eq!(back.params, sig.params);
		assert_eq!(back.varargs, sig.varargs);
	}

	#[test]
	fn array_shape_round_trips() {
		let ty = TypeSig::Array(
			Box::new(TypeSig::I4),
			ArrayShape {
				rank: 2,
				sizes: vec![3, 4],
				lo_bounds: vec![0, -1],
			},
		);
		let sig = FieldSig::new(ty.clone());
		let back = FieldSig::from_blob(&sig.to_blob().unwrap(), &Unchecked).unwrap();
		assert_eq!(back.ty, ty);
	}

	#[test]
	fn custom_modifiers_are_preserved_in_order() {
		let modifier = TypeHandle::Ref(ClassRefHandle(0));
		let ty = TypeSig::CModReqd(
			modifier,
			Box::new(TypeSig::CModOpt(modifier, Box::new(TypeSig::I4))),
		);
		let sig = FieldSig::new(ty.clone());
		let back = FieldSig::from_blob(&sig.to_blob().unwrap(), &Unchecked).unwrap();
		assert_eq!(back.ty, ty);
	}

	#[test]
	fn locals_round_trip_with_pinned() {
		let locals = vec![
			LocalVar::new(TypeSig::I4),
			LocalVar::new(TypeSig::Pinned(Box::new(TypeSig::by_ref(TypeSig::I4)))),
		];
		let blob = locals_to_blob(&locals).unwrap();
		assert_eq!(blob[0], SIG_LOCALS);
		assert_eq!(locals_from_blob(&blob, &Unchecked).unwrap(), locals);
	}
}
