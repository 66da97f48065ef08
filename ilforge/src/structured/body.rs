//! The IL method body model: canonical instructions whose branch operands
//! are labels bound to positions in the instruction list, exception-handling
//! clauses over the same labels, and the codec translating to and from the
//! byte formats in [`crate::raw::il`].
//!
//! Emission walks `Assembling → Resolved → Serialised`: labels are resolved
//! to byte offsets (growing short branches to their long forms until the
//! displacements settle), then bytes are produced. An unresolved label is
//! fatal to emission.

use std::fmt::{Debug, Formatter};
use std::io::Cursor;

use bitflags::bitflags;
use derivative::Derivative;
use nohash_hasher::IntMap;

use crate::errors::{Error, Result};
use crate::raw::il::{
	self, BodyHeader, RawEhClause, EH_CLAUSE_EXCEPTION, EH_CLAUSE_FAULT, EH_CLAUSE_FILTER,
	EH_CLAUSE_FINALLY,
};
use crate::raw::indices::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::structured::members::{CodeItem, FieldItem, MethodItem};
use crate::structured::signatures::LocalVar;
use crate::structured::types::{StandAloneSigHandle, TypeHandle};
use crate::utilities::{pad_to_multiple_of, FromByteStream};

/// A position in a method body's instruction list. Labels are created and
/// bound through [`MethodBody`]; branch operands and handler boundaries
/// refer to them instead of byte offsets.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Label(pub(crate) u32);

/// The jump table of a `switch` instruction.
#[derive(Clone, Eq, PartialEq)]
pub struct SwitchTargets(pub Vec<Label>);

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct SkipFaultCheckFlags: u8 {
		const TYPE_CHECK = 0x1;
		const RANGE_CHECK = 0x2;
		const NULL_CHECK = 0x4;
	}
}

/// One exception-handling clause. All boundaries are labels; `try_end` and
/// `handler_end` point one past the last protected instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct EhClause {
	pub try_start: Label,
	pub try_end: Label,
	pub handler_start: Label,
	pub handler_end: Label,
	pub kind: EhKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EhKind {
	Exception(TypeHandle),
	Filter(Label),
	Finally,
	Fault,
}

/// Resolves raw IL tokens into model references while a body is decoded.
pub(crate) trait TokenSource {
	fn type_item(&self, token: u32) -> Result<TypeHandle>;
	fn field_item(&self, token: u32) -> Result<FieldItem>;
	fn method_item(&self, token: u32) -> Result<MethodItem>;
	fn code_item(&self, token: u32) -> Result<CodeItem>;
	fn call_site(&self, token: u32) -> Result<StandAloneSigHandle>;
	fn user_string(&self, token: u32) -> Result<String>;
}

/// Produces raw IL tokens from model references while a body is serialised.
/// String interning happens here, so the #US heap grows during body
/// emission and is sized afterwards.
pub(crate) trait TokenSink {
	fn type_token(&mut self, handle: TypeHandle) -> u32;
	fn field_token(&mut self, item: &FieldItem) -> Result<u32>;
	fn method_token(&mut self, item: &MethodItem) -> Result<u32>;
	fn code_token(&mut self, item: &CodeItem) -> Result<u32>;
	fn call_site_token(&mut self, handle: StandAloneSigHandle) -> u32;
	fn string_token(&mut self, value: &str) -> Result<u32>;
}

pub(crate) struct BodyReader<'l> {
	stream: Cursor<&'l [u8]>,
	tokens: &'l dyn TokenSource,
	label_offsets: Vec<u32>,
	label_by_offset: IntMap<u32, Label>,
}

impl<'l> BodyReader<'l> {
	fn new(code: &'l [u8], tokens: &'l dyn TokenSource) -> Self {
		Self {
			stream: Cursor::new(code),
			tokens,
			label_offsets: vec![],
			label_by_offset: IntMap::default(),
		}
	}

	fn byte(&mut self) -> Result<u8> {
		<u8 as FromByteStream>::read(&mut self.stream, &()).map_err(|_| Error::MalformedImage("truncated method body"))
	}

	fn read_scalar<T: FromByteStream<Deps = ()>>(&mut self) -> Result<T> {
		T::read(&mut self.stream, &()).map_err(|_| Error::MalformedImage("truncated method body"))
	}

	fn label_at(&mut self, offset: u32) -> Label {
		if let Some(label) = self.label_by_offset.get(&offset) {
			return *label;
		}
		let label = Label(self.label_offsets.len() as u32);
		self.label_offsets.push(offset);
		self.label_by_offset.insert(offset, label);
		label
	}
}

pub(crate) struct BodyWriter<'l> {
	buf: Vec<u8>,
	tokens: &'l mut dyn TokenSink,
	/// Byte offset of each instruction, plus the final code size.
	offsets: Vec<u32>,
	/// Resolved byte offset per label id.
	label_offsets: Vec<u32>,
	/// Branch instructions that outgrew the short displacement.
	long: Vec<bool>,
	current: usize,
}

impl BodyWriter<'_> {
	fn branch(&mut self, op: u8, short_op: u8, label: Label) -> Result<()> {
		let target = self.label_offsets[label.0 as usize] as i64;
		let end = self.offsets[self.current + 1] as i64;
		let displacement = target - end;
		match self.long[self.current] {
			true => {
				self.buf.push(op);
				self.buf.extend_from_slice(&(displacement as i32).to_le_bytes());
			},
			false => {
				self.buf.push(short_op);
				self.buf.push(displacement as i8 as u8);
			},
		}
		Ok(())
	}
}

pub(crate) trait Operand: Sized {
	fn size(&self) -> usize;
	fn read(dec: &mut BodyReader<'_>) -> Result<Self>;
	fn write(&self, enc: &mut BodyWriter<'_>) -> Result<()>;

	/// The short-form variant, used by the one-byte branch encodings.
	fn read_short(dec: &mut BodyReader<'_>) -> Result<Self> {
		Self::read(dec)
	}
}

macro_rules! impl_scalar_operand {
	($($ty: ty),*) => {$(
		impl Operand for $ty {
			fn size(&self) -> usize {
				std::mem::size_of::<$ty>()
			}

			fn read(dec: &mut BodyReader<'_>) -> Result<Self> {
				dec.read_scalar()
			}

			fn write(&self, enc: &mut BodyWriter<'_>) -> Result<()> {
				enc.buf.extend_from_slice(&self.to_le_bytes());
				Ok(())
			}
		}
	)*};
}

impl_scalar_operand!(u8, i8, u16, i32, i64, f32, f64);

impl Operand for SkipFaultCheckFlags {
	fn size(&self) -> usize {
		1
	}

	fn read(dec: &mut BodyReader<'_>) -> Result<Self> {
		Ok(Self::from_bits_retain(dec.byte()?))
	}

	fn write(&self, enc: &mut BodyWriter<'_>) -> Result<()> {
		enc.buf.push(self.bits());
		Ok(())
	}
}

impl Operand for Label {
	fn size(&self) -> usize {
		4
	}

	fn read(dec: &mut BodyReader<'_>) -> Result<Self> {
		let displacement: i32 = dec.read_scalar()?;
		let next = dec.stream.position() as i64;
		offset_label(dec, next + displacement as i64)
	}

	fn read_short(dec: &mut BodyReader<'_>) -> Result<Self> {
		let displacement: i8 = dec.read_scalar()?;
		let next = dec.stream.position() as i64;
		offset_label(dec, next + displacement as i64)
	}

	fn write(&self, _: &mut BodyWriter<'_>) -> Result<()> {
		// Branches write through BodyWriter::branch; switch targets through
		// SwitchTargets::write.
		unreachable!()
	}
}

fn offset_label(dec: &mut BodyReader<'_>, target: i64) -> Result<Label> {
	let code_len = dec.stream.get_ref().len() as i64;
	if target < 0 || target > code_len {
		return Err(Error::MalformedImage("branch target outside method body"));
	}
	Ok(dec.label_at(target as u32))
}

impl Operand for SwitchTargets {
	fn size(&self) -> usize {
		4 + 4 * self.0.len()
	}

	fn read(dec: &mut BodyReader<'_>) -> Result<Self> {
		let count: u32 = dec.read_scalar()?;
		let mut displacements = Vec::with_capacity(count as usize);
		for _ in 0..count {
			displacements.push(dec.read_scalar::<i32>()?);
		}
		let end = dec.stream.position() as i64;
		let mut targets = Vec::with_capacity(displacements.len());
		for displacement in displacements {
			targets.push(offset_label(dec, end + displacement as i64)?);
		}
		Ok(Self(targets))
	}

	fn write(&self, enc: &mut BodyWriter<'_>) -> Result<()> {
		let end = enc.offsets[enc.current + 1] as i64;
		enc.buf.extend_from_slice(&(self.0.len() as u32).to_le_bytes());
		for label in &self.0 {
			let displacement = enc.label_offsets[label.0 as usize] as i64 - end;
			enc.buf.extend_from_slice(&(displacement as i32).to_le_bytes());
		}
		Ok(())
	}
}

impl Operand for TypeHandle {
	fn size(&self) -> usize {
		4
	}

	fn read(dec: &mut BodyReader<'_>) -> Result<Self> {
		let token: u32 = dec.read_scalar()?;
		dec.tokens.type_item(token)
	}

	fn write(&self, enc: &mut BodyWriter<'_>) -> Result<()> {
		let token = enc.tokens.type_token(*self);
		enc.buf.extend_from_slice(&token.to_le_bytes());
		Ok(())
	}
}

impl Operand for StandAloneSigHandle {
	fn size(&self) -> usize {
		4
	}

	fn read(dec: &mut BodyReader<'_>) -> Result<Self> {
		let token: u32 = dec.read_scalar()?;
		dec.tokens.call_site(token)
	}

	fn write(&self, enc: &mut BodyWriter<'_>) -> Result<()> {
		let token = enc.tokens.call_site_token(*self);
		enc.buf.extend_from_slice(&token.to_le_bytes());
		Ok(())
	}
}

impl Operand for String {
	fn size(&self) -> usize {
		4
	}

	fn read(dec: &mut BodyReader<'_>) -> Result<Self> {
		let token: u32 = dec.read_scalar()?;
		dec.tokens.user_string(token)
	}

	fn write(&self, enc: &mut BodyWriter<'_>) -> Result<()> {
		let token = enc.tokens.string_token(self)?;
		enc.buf.extend_from_slice(&token.to_le_bytes());
		Ok(())
	}
}

macro_rules! impl_item_operand {
	($($ty: ty => $source: ident / $sink: ident),*) => {$(
		impl Operand for $ty {
			fn size(&self) -> usize {
				4
			}

			fn read(dec: &mut BodyReader<'_>) -> Result<Self> {
				let token: u32 = dec.read_scalar()?;
				dec.tokens.$source(token)
			}

			fn write(&self, enc: &mut BodyWriter<'_>) -> Result<()> {
				let token = enc.tokens.$sink(self)?;
				enc.buf.extend_from_slice(&token.to_le_bytes());
				Ok(())
			}
		}
	)*};
}

impl_item_operand! {
	FieldItem => field_item / field_token,
	MethodItem => method_item / method_token,
	CodeItem => code_item / code_token
}

macro_rules! encode_op {
	($self: expr, $enc: expr, $name: ident, $op: literal) => {
		if let Instruction::$name = $self {
			$enc.buf.push($op);
			return Ok(());
		}
	};
	($self: expr, $enc: expr, $name: ident($ty: ty), $op: literal | $short: literal) => {
		if let Instruction::$name(label) = $self {
			return $enc.branch($op, $short, *label);
		}
	};
	($self: expr, $enc: expr, $name: ident($ty: ty), $op: literal) => {
		if let Instruction::$name(operand) = $self {
			$enc.buf.push($op);
			return Operand::write(operand, $enc);
		}
	};
}

macro_rules! encode_ext_op {
	($self: expr, $enc: expr, $name: ident, $op: literal) => {
		if let Instruction::$name = $self {
			$enc.buf.push(0xFE);
			$enc.buf.push($op);
			return Ok(());
		}
	};
	($self: expr, $enc: expr, $name: ident($ty: ty), $op: literal) => {
		if let Instruction::$name(operand) = $self {
			$enc.buf.push(0xFE);
			$enc.buf.push($op);
			return Operand::write(operand, $enc);
		}
	};
}

macro_rules! decode_op {
	($opcode: expr, $dec: expr, $name: ident, $op: literal) => {
		if $opcode == $op {
			return Ok(Instruction::$name);
		}
	};
	($opcode: expr, $dec: expr, $name: ident($ty: ty), $op: literal | $short: literal) => {
		if $opcode == $op {
			return Ok(Instruction::$name(<$ty as Operand>::read($dec)?));
		}
		if $opcode == $short {
			return Ok(Instruction::$name(<$ty as Operand>::read_short($dec)?));
		}
	};
	($opcode: expr, $dec: expr, $name: ident($ty: ty), $op: literal) => {
		if $opcode == $op {
			return Ok(Instruction::$name(<$ty as Operand>::read($dec)?));
		}
	};
}

macro_rules! size_op {
	($self: expr, $long: expr, $name: ident, $op: literal) => {
		if let Instruction::$name = $self {
			return 1;
		}
	};
	($self: expr, $long: expr, $name: ident($ty: ty), $op: literal | $short: literal) => {
		if let Instruction::$name(_) = $self {
			return if $long { 5 } else { 2 };
		}
	};
	($self: expr, $long: expr, $name: ident($ty: ty), $op: literal) => {
		if let Instruction::$name(operand) = $self {
			return 1 + Operand::size(operand);
		}
	};
}

macro_rules! size_ext_op {
	($self: expr, $name: ident, $op: literal) => {
		if let Instruction::$name = $self {
			return 2;
		}
	};
	($self: expr, $name: ident($ty: ty), $op: literal) => {
		if let Instruction::$name(operand) = $self {
			return 2 + Operand::size(operand);
		}
	};
}

macro_rules! branch_target_op {
	($self: expr, $name: ident, $op: literal) => {};
	($self: expr, $name: ident($ty: ty), $op: literal | $short: literal) => {
		if let Instruction::$name(label) = $self {
			return Some(*label);
		}
	};
	($self: expr, $name: ident($ty: ty), $op: literal) => {};
}

macro_rules! define_instructions {
	(
		primary {
			$($(#[$pattr: meta])* $pname: ident $(($pty: ty))? = $pop: literal $(| $pshort: literal)?),* $(,)?
		}
		extended {
			$($(#[$eattr: meta])* $ename: ident $(($ety: ty))? = $eop: literal),* $(,)?
		}
	) => {
		/// One canonical IL instruction. The short branch encodings fold
		/// into their long variants; the serialiser picks the compact form
		/// whenever the displacement allows it.
		#[allow(non_camel_case_types)]
		#[derive(Debug, Clone, PartialEq)]
		pub enum Instruction {
			$($(#[$pattr])* $pname $(($pty))?,)*
			$($(#[$eattr])* $ename $(($ety))?,)*
		}

		impl Instruction {
			pub(crate) fn encode(&self, enc: &mut BodyWriter<'_>) -> Result<()> {
				$(encode_op! { self, enc, $pname $(($pty))?, $pop $(| $pshort)? })*
				$(encode_ext_op! { self, enc, $ename $(($ety))?, $eop })*
				unreachable!()
			}

			pub(crate) fn decode(dec: &mut BodyReader<'_>) -> Result<Self> {
				let opcode = dec.byte()?;
				$(decode_op! { opcode, dec, $pname $(($pty))?, $pop $(| $pshort)? })*
				if opcode == 0xFE {
					let extended = dec.byte()?;
					$(decode_op! { extended, dec, $ename $(($ety))?, $eop })*
					return Err(Error::InvalidOpcode(0xFE00 | extended as u16));
				}
				Err(Error::InvalidOpcode(opcode as u16))
			}

			/// Encoded byte size; `long` selects the branch form.
			pub(crate) fn size(&self, long: bool) -> usize {
				$(size_op! { self, long, $pname $(($pty))?, $pop $(| $pshort)? })*
				$(size_ext_op! { self, $ename $(($ety))?, $eop })*
				unreachable!()
			}

			/// The label of a conditional or unconditional branch operand.
			pub(crate) fn branch_target(&self) -> Option<Label> {
				$(branch_target_op! { self, $pname $(($pty))?, $pop $(| $pshort)? })*
				None
			}
		}
	};
}

define_instructions! {
	primary {
		/// Do nothing.
		nop = 0x00,
		/// Inform a debugger that a breakpoint has been reached.
		dbg_break = 0x01,
		/// Load argument 0 onto the stack.
		ldarg_0 = 0x02,
		/// Load argument 1 onto the stack.
		ldarg_1 = 0x03,
		/// Load argument 2 onto the stack.
		ldarg_2 = 0x04,
		/// Load argument 3 onto the stack.
		ldarg_3 = 0x05,
		/// Load local variable 0 onto stack.
		ldloc_0 = 0x06,
		/// Load local variable 1 onto stack.
		ldloc_1 = 0x07,
		/// Load local variable 2 onto stack.
		ldloc_2 = 0x08,
		/// Load local variable 3 onto stack.
		ldloc_3 = 0x09,
		/// Pop a value from stack into local variable 0.
		stloc_0 = 0x0A,
		/// Pop a value from stack into local variable 1.
		stloc_1 = 0x0B,
		/// Pop a value from stack into local variable 2.
		stloc_2 = 0x0C,
		/// Pop a value from stack into local variable 3.
		stloc_3 = 0x0D,
		/// Load argument numbered num onto the stack, short form.
		ldarg_s(u8) = 0x0E,
		/// Fetch the address of argument argNum, short form.
		ldarga_s(u8) = 0x0F,
		/// Store value to the argument numbered num, short form.
		starg_s(u8) = 0x10,
		/// Load local variable of index indx onto stack, short form.
		ldloc_s(u8) = 0x11,
		/// Load address of local variable with index indx, short form.
		ldloca_s(u8) = 0x12,
		/// Pop a value from stack into local variable indx, short form.
		stloc_s(u8) = 0x13,
		/// Push a null reference on the stack.
		ldnull = 0x14,
		/// Push -1 onto the stack as int32.
		ldc_i4_m1 = 0x15,
		/// Push 0 onto the stack as int32.
		ldc_i4_0 = 0x16,
		/// Push 1 onto the stack as int32.
		ldc_i4_1 = 0x17,
		/// Push 2 onto the stack as int32.
		ldc_i4_2 = 0x18,
		/// Push 3 onto the stack as int32.
		ldc_i4_3 = 0x19,
		/// Push 4 onto the stack as int32.
		ldc_i4_4 = 0x1A,
		/// Push 5 onto the stack as int32.
		ldc_i4_5 = 0x1B,
		/// Push 6 onto the stack as int32.
		ldc_i4_6 = 0x1C,
		/// Push 7 onto the stack as int32.
		ldc_i4_7 = 0x1D,
		/// Push 8 onto the stack as int32.
		ldc_i4_8 = 0x1E,
		/// Push num onto the stack as int32, short form.
		ldc_i4_s(i8) = 0x1F,
		/// Push num of type int32 onto the stack as int32.
		ldc_i4(i32) = 0x20,
		/// Push num of type int64 onto the stack as int64.
		ldc_i8(i64) = 0x21,
		/// Push num of type float32 onto the stack as F.
		ldc_r4(f32) = 0x22,
		/// Push num of type float64 onto the stack as F.
		ldc_r8(f64) = 0x23,
		/// Duplicate the value on the top of the stack.
		dup = 0x25,
		/// Pop value from the stack.
		pop = 0x26,
		/// Exit current method and jump to the specified method.
		jmp(MethodItem) = 0x27,
		/// Call method described by method.
		call(MethodItem) = 0x28,
		/// Call method indicated on the stack with arguments described by callsitedescr.
		calli(StandAloneSigHandle) = 0x29,
		/// Return from method, possibly with a value.
		ret = 0x2A,
		/// Branch to target.
		br(Label) = 0x38 | 0x2B,
		/// Branch to target if value is zero (false).
		brfalse(Label) = 0x39 | 0x2C,
		/// Branch to target if value is non-zero (true).
		brtrue(Label) = 0x3A | 0x2D,
		/// Branch to target if equal.
		beq(Label) = 0x3B | 0x2E,
		/// Branch to target if greater than or equal to.
		bge(Label) = 0x3C | 0x2F,
		/// Branch to target if greater than.
		bgt(Label) = 0x3D | 0x30,
		/// Branch to target if less than or equal to.
		ble(Label) = 0x3E | 0x31,
		/// Branch to target if less than.
		blt(Label) = 0x3F | 0x32,
		/// Branch to target if unequal or unordered.
		bne_un(Label) = 0x40 | 0x33,
		/// Branch to target if greater than or equal to (unsigned or unordered).
		bge_un(Label) = 0x41 | 0x34,
		/// Branch to target if greater than (unsigned or unordered).
		bgt_un(Label) = 0x42 | 0x35,
		/// Branch to target if less than or equal to (unsigned or unordered).
		ble_un(Label) = 0x43 | 0x36,
		/// Branch to target if less than (unsigned or unordered).
		blt_un(Label) = 0x44 | 0x37,
		/// Jump to one of n values.
		switch(SwitchTargets) = 0x45,
		/// Indirect load value of type int8 as int32 on the stack.
		ldind_i1 = 0x46,
		/// Indirect load value of type unsigned int8 as int32 on the stack.
		ldind_u1 = 0x47,
		/// Indirect load value of type int16 as int32 on the stack.
		ldind_i2 = 0x48,
		/// Indirect load value of type unsigned int16 as int32 on the stack.
		ldind_u2 = 0x49,
		/// Indirect load value of type int32 as int32 on the stack.
		ldind_i4 = 0x4A,
		/// Indirect load value of type unsigned int32 as int32 on the stack.
		ldind_u4 = 0x4B,
		/// Indirect load value of type int64 as int64 on the stack.
		ldind_i8 = 0x4C,
		/// Indirect load value of type native int as native int on the stack.
		ldind_i = 0x4D,
		/// Indirect load value of type float32 as F on the stack.
		ldind_r4 = 0x4E,
		/// Indirect load value of type float64 as F on the stack.
		ldind_r8 = 0x4F,
		/// Indirect load value of type object ref as O on the stack.
		ldind_ref = 0x50,
		/// Store value of type object ref (type O) into memory at address.
		stind_ref = 0x51,
		/// Store value of type int8 into memory at address.
		stind_i1 = 0x52,
		/// Store value of type int16 into memory at address.
		stind_i2 = 0x53,
		/// Store value of type int32 into memory at address.
		stind_i4 = 0x54,
		/// Store value of type int64 into memory at address.
		stind_i8 = 0x55,
		/// Store value of type float32 into memory at address.
		stind_r4 = 0x56,
		/// Store value of type float64 into memory at address.
		stind_r8 = 0x57,
		/// Add two values, returning a new value.
		add = 0x58,
		/// Subtract value2 from value1, returning a new value.
		sub = 0x59,
		/// Multiply values.
		mul = 0x5A,
		/// Divide two values to return a quotient or floating-point result.
		div = 0x5B,
		/// Divide two values, unsigned, returning a quotient.
		div_un = 0x5C,
		/// Remainder when dividing one value by another.
		rem = 0x5D,
		/// Remainder when dividing one unsigned value by another.
		rem_un = 0x5E,
		/// Bitwise AND of two integral values, returns an integral value.
		and = 0x5F,
		/// Bitwise OR of two integer values, returns an integer.
		or = 0x60,
		/// Bitwise XOR of integer values, returns an integer.
		xor = 0x61,
		/// Shift an integer left (shifting in zeros), return an integer.
		shl = 0x62,
		/// Shift an integer right (shift in sign), return an integer.
		shr = 0x63,
		/// Shift an integer right (shift in zero), return an integer.
		shr_un = 0x64,
		/// Negate value.
		neg = 0x65,
		/// Bitwise complement.
		not = 0x66,
		/// Convert to int8, pushing int32 on stack.
		conv_i1 = 0x67,
		/// Convert to int16, pushing int32 on stack.
		conv_i2 = 0x68,
		/// Convert to int32, pushing int32 on stack.
		conv_i4 = 0x69,
		/// Convert to int64, pushing int64 on stack.
		conv_i8 = 0x6A,
		/// Convert to float32, pushing F on stack.
		conv_r4 = 0x6B,
		/// Convert to float64, pushing F on stack.
		conv_r8 = 0x6C,
		/// Convert to unsigned int32, pushing int32 on stack.
		conv_u4 = 0x6D,
		/// Convert to unsigned int64, pushing int64 on stack.
		conv_u8 = 0x6E,
		/// Call a method associated with an object.
		callvirt(MethodItem) = 0x6F,
		/// Copy a value type from src to dest.
		cpobj(TypeHandle) = 0x70,
		/// Copy the value stored at address src to the stack.
		ldobj(TypeHandle) = 0x71,
		/// Push a string object for the literal string.
		ldstr(String) = 0x72,
		/// Allocate an uninitialized object or value type and call ctor.
		newobj(MethodItem) = 0x73,
		/// Cast obj to class.
		castclass(TypeHandle) = 0x74,
		/// Test if obj is an instance of class, returning null or an instance of that class or interface.
		isinst(TypeHandle) = 0x75,
		/// Convert unsigned integer to floating-point, pushing F on stack.
		conv_r_un = 0x76,
		/// Extract a value-type from obj, its boxed representation, and push a controlled-mutability managed pointer to it to the top of the stack.
		unbox(TypeHandle) = 0x79,
		/// Throw an exception.
		throw = 0x7A,
		/// Push the value of field of object (or value type) obj, onto the stack.
		ldfld(FieldItem) = 0x7B,
		/// Push the address of field of object obj on the stack.
		ldflda(FieldItem) = 0x7C,
		/// Replace the value of field of the object obj with value.
		stfld(FieldItem) = 0x7D,
		/// Push the value of the static field on the stack.
		ldsfld(FieldItem) = 0x7E,
		/// Push the address of the static field, field, on the stack.
		ldsflda(FieldItem) = 0x7F,
		/// Replace the value of the static field with val.
		stsfld(FieldItem) = 0x80,
		/// Store a value of type typeTok at an address.
		stobj(TypeHandle) = 0x81,
		/// Convert unsigned to an int8 (on the stack as int32) and throw an exception on overflow.
		conv_ovf_i1_un = 0x82,
		/// Convert unsigned to an int16 (on the stack as int32) and throw an exception on overflow.
		conv_ovf_i2_un = 0x83,
		/// Convert unsigned to an int32 (on the stack as int32) and throw an exception on overflow.
		conv_ovf_i4_un = 0x84,
		/// Convert unsigned to an int64 (on the stack as int64) and throw an exception on overflow.
		conv_ovf_i8_un = 0x85,
		/// Convert unsigned to an unsigned int8 (on the stack as int32) and throw an exception on overflow.
		conv_ovf_u1_un = 0x86,
		/// Convert unsigned to an unsigned int16 (on the stack as int32) and throw an exception on overflow.
		conv_ovf_u2_un = 0x87,
		/// Convert unsigned to an unsigned int32 (on the stack as int32) and throw an exception on overflow.
		conv_ovf_u4_un = 0x88,
		/// Convert unsigned to an unsigned int64 (on the stack as int64) and throw an exception on overflow.
		conv_ovf_u8_un = 0x89,
		/// Convert unsigned to a native int (on the stack as native int) and throw an exception on overflow.
		conv_ovf_i_un = 0x8A,
		/// Convert unsigned to a native unsigned int (on the stack as native int) and throw an exception on overflow.
		conv_ovf_u_un = 0x8B,
		/// Convert a boxable value to its boxed form.
		box_val(TypeHandle) = 0x8C,
		/// Create a new array with elements of type etype.
		newarr(TypeHandle) = 0x8D,
		/// Push the length (of type native unsigned int) of array on the stack.
		ldlen = 0x8E,
		/// Load the address of element at index onto the top of the stack.
		ldelema(TypeHandle) = 0x8F,
		/// Load the element with type int8 at index onto the top of the stack as an int32.
		ldelem_i1 = 0x90,
		/// Load the element with type unsigned int8 at index onto the top of the stack as an int32.
		ldelem_u1 = 0x91,
		/// Load the element with type int16 at index onto the top of the stack as an int32.
		ldelem_i2 = 0x92,
		/// Load the element with type unsigned int16 at index onto the top of the stack as an int32.
		ldelem_u2 = 0x93,
		/// Load the element with type int32 at index onto the top of the stack as an int32.
		ldelem_i4 = 0x94,
		/// Load the element with type unsigned int32 at index onto the top of the stack as an int32.
		ldelem_u4 = 0x95,
		/// Load the element with type int64 at index onto the top of the stack as an int64.
		ldelem_i8 = 0x96,
		/// Load the element with type native int at index onto the top of the stack as a native int.
		ldelem_i = 0x97,
		/// Load the element with type float32 at index onto the top of the stack as an F.
		ldelem_r4 = 0x98,
		/// Load the element with type float64 at index onto the top of the stack as an F.
		ldelem_r8 = 0x99,
		/// Load the element at index onto the top of the stack as an O.
		ldelem_ref = 0x9A,
		/// Replace array element at index with the native int value on the stack.
		stelem_i = 0x9B,
		/// Replace array element at index with the int8 value on the stack.
		stelem_i1 = 0x9C,
		/// Replace array element at index with the int16 value on the stack.
		stelem_i2 = 0x9D,
		/// Replace array element at index with the int32 value on the stack.
		stelem_i4 = 0x9E,
		/// Replace array element at index with the int64 value on the stack.
		stelem_i8 = 0x9F,
		/// Replace array element at index with the float32 value on the stack.
		stelem_r4 = 0xA0,
		/// Replace array element at index with the float64 value on the stack.
		stelem_r8 = 0xA1,
		/// Replace array element at index with the ref value on the stack.
		stelem_ref = 0xA2,
		/// Load the element at index onto the top of the stack.
		ldelem(TypeHandle) = 0xA3,
		/// Replace array element at index with the value on the stack.
		stelem(TypeHandle) = 0xA4,
		/// Extract a value-type from obj, its boxed representation, and copy to the top of the stack.
		unbox_any(TypeHandle) = 0xA5,
		/// Convert to an int8 (on the stack as int32) and throw an exception on overflow.
		conv_ovf_i1 = 0xB3,
		/// Convert to an unsigned int8 (on the stack as int32) and throw an exception on overflow.
		conv_ovf_u1 = 0xB4,
		/// Convert to an int16 (on the stack as int32) and throw an exception on overflow.
		conv_ovf_i2 = 0xB5,
		/// Convert to an unsigned int16 (on the stack as int32) and throw an exception on overflow.
		conv_ovf_u2 = 0xB6,
		/// Convert to an int32 (on the stack as int32) and throw an exception on overflow.
		conv_ovf_i4 = 0xB7,
		/// Convert to an unsigned int32 (on the stack as int32) and throw an exception on overflow.
		conv_ovf_u4 = 0xB8,
		/// Convert to an int64 (on the stack as int64) and throw an exception on overflow.
		conv_ovf_i8 = 0xB9,
		/// Convert to an unsigned int64 (on the stack as int64) and throw an exception on overflow.
		conv_ovf_u8 = 0xBA,
		/// Push the address stored in a typed reference.
		refanyval(TypeHandle) = 0xC2,
		/// Throw ArithmeticException if value is not a finite number.
		ckfinite = 0xC3,
		/// Push a typed reference to ptr of type class onto the stack.
		mkrefany(TypeHandle) = 0xC6,
		/// Convert metadata token to its runtime representation.
		ldtoken(CodeItem) = 0xD0,
		/// Convert to unsigned int16, pushing int32 on stack.
		conv_u2 = 0xD1,
		/// Convert to unsigned int8, pushing int32 on stack.
		conv_u1 = 0xD2,
		/// Convert to native int, pushing native int on stack.
		conv_i = 0xD3,
		/// Convert to a native int (on the stack as native int) and throw an exception on overflow.
		conv_ovf_i = 0xD4,
		/// Convert to a native unsigned int (on the stack as native int) and throw an exception on overflow.
		conv_ovf_u = 0xD5,
		/// Add signed integer values with overflow check.
		add_ovf = 0xD6,
		/// Add unsigned integer values with overflow check.
		add_ovf_un = 0xD7,
		/// Multiply signed integer values. Signed result shall fit in same size.
		mul_ovf = 0xD8,
		/// Multiply unsigned integer values. Unsigned result shall fit in same size.
		mul_ovf_un = 0xD9,
		/// Subtract native int from a native int. Signed result shall fit in same size.
		sub_ovf = 0xDA,
		/// Subtract native unsigned int from a native unsigned int. Unsigned result shall fit in same size.
		sub_ovf_un = 0xDB,
		/// End fault or finally clause of an exception block.
		endfinally = 0xDC,
		/// Exit a protected region of code.
		leave(Label) = 0xDD | 0xDE,
		/// Store value of type native int into memory at address.
		stind_i = 0xDF,
		/// Convert to native unsigned int, pushing native int on stack.
		conv_u = 0xE0,
	}
	extended {
		/// Return argument list handle for the current method.
		arglist = 0x00,
		/// Push 1 (of type int32) if value1 equals value2, else push 0.
		ceq = 0x01,
		/// Push 1 (of type int32) if value1 greater that value2, else push 0.
		cgt = 0x02,
		/// Push 1 (of type int32) if value1 greater that value2, unsigned or unordered, else push 0.
		cgt_un = 0x03,
		/// Push 1 (of type int32) if value1 lower than value2, else push 0.
		clt = 0x04,
		/// Push 1 (of type int32) if value1 lower than value2, unsigned or unordered, else push 0.
		clt_un = 0x05,
		/// Push a pointer to a method referenced by method, on the stack.
		ldftn(MethodItem) = 0x06,
		/// Push address of virtual method on the stack.
		ldvirtftn(MethodItem) = 0x07,
		/// Load argument numbered num onto the stack.
		ldarg(u16) = 0x09,
		/// Fetch the address of argument argNum.
		ldarga(u16) = 0x0A,
		/// Store value to the argument numbered num.
		starg(u16) = 0x0B,
		/// Load local variable of index indx onto stack.
		ldloc(u16) = 0x0C,
		/// Load address of local variable with index indx.
		ldloca(u16) = 0x0D,
		/// Pop a value from stack into local variable indx.
		stloc(u16) = 0x0E,
		/// Allocate space from the local memory pool.
		localloc = 0x0F,
		/// End an exception handling filter clause.
		endfilter = 0x11,
		/// Subsequent pointer instruction might be unaligned.
		unaligned(u8) = 0x12,
		/// Subsequent pointer reference is volatile.
		volatile = 0x13,
		/// Subsequent call terminates current method.
		tail = 0x14,
		/// Initialize the value at address dest.
		initobj(TypeHandle) = 0x15,
		/// Call a virtual method on a type constrained to be type T.
		constrained(TypeHandle) = 0x16,
		/// Copy data from memory to memory.
		cpblk = 0x17,
		/// Set all bytes in a block of memory to a given byte value.
		initblk = 0x18,
		/// The specified fault check(s) normally performed as part of the execution of the subsequent instruction can be skipped.
		no_chk(SkipFaultCheckFlags) = 0x19,
		/// Rethrow the current exception.
		rethrow = 0x1A,
		/// Push the size, in bytes, of a type as an unsigned int32.
		sizeof(TypeHandle) = 0x1C,
		/// Push the type token stored in a typed reference.
		refanytype = 0x1D,
		/// Specify that the subsequent array address operation performs no type check at runtime.
		readonly = 0x1E,
	}
}

/// A method body under construction or loaded from an image.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct MethodBody {
	pub max_stack: u16,
	pub init_locals: bool,
	pub locals: Vec<LocalVar>,
	pub instructions: Vec<Instruction>,
	pub eh_clauses: Vec<EhClause>,
	#[derivative(Debug = "ignore")]
	labels: Vec<Option<u32>>,
}

impl Default for MethodBody {
	fn default() -> Self {
		Self::new()
	}
}

impl MethodBody {
	pub fn new() -> Self {
		Self {
			max_stack: 8,
			init_locals: true,
			locals: vec![],
			instructions: vec![],
			eh_clauses: vec![],
			labels: vec![],
		}
	}

	/// Creates a fresh, unbound label.
	pub fn define_label(&mut self) -> Label {
		let label = Label(self.labels.len() as u32);
		self.labels.push(None);
		label
	}

	/// Binds `label` to the position right after the instructions pushed so
	/// far. Binding may happen before or after the branches that use it.
	pub fn bind(&mut self, label: Label) {
		self.labels[label.0 as usize] = Some(self.instructions.len() as u32);
	}

	pub(crate) fn bind_at(&mut self, label: Label, instruction_index: u32) {
		self.labels[label.0 as usize] = Some(instruction_index);
	}

	/// The instruction index a label resolves to, if bound.
	pub fn label_target(&self, label: Label) -> Option<u32> {
		self.labels.get(label.0 as usize).copied().flatten()
	}

	fn resolved_label(&self, label: Label) -> Result<u32> {
		match self.labels.get(label.0 as usize) {
			Some(Some(index)) if *index <= self.instructions.len() as u32 => Ok(*index),
			Some(Some(_)) => Err(Error::ContractViolation("label bound past end of body")),
			_ => Err(Error::UnresolvedLabel(label)),
		}
	}

	/// Resolves labels to byte offsets: short branch forms grow to long
	/// monotonically until every displacement fits its encoding.
	fn resolve_offsets(&self) -> Result<(Vec<u32>, Vec<bool>)> {
		let count = self.instructions.len();
		let mut long = vec![false; count];

		loop {
			let mut offsets = Vec::with_capacity(count + 1);
			let mut position = 0u32;
			for (i, instruction) in self.instructions.iter().enumerate() {
				offsets.push(position);
				position += instruction.size(long[i]) as u32;
			}
			offsets.push(position);

			let mut changed = false;
			for (i, instruction) in self.instructions.iter().enumerate() {
				let Some(label) = instruction.branch_target() else {
					continue;
				};
				if long[i] {
					continue;
				}
				let target_index = self.resolved_label(label)?;
				let target = offsets[target_index as usize] as i64;
				let end = (offsets[i] + instruction.size(false) as u32) as i64;
				let displacement = target - end;
				if i8::try_from(displacement).is_err() {
					long[i] = true;
					changed = true;
				}
			}

			if !changed {
				return Ok((offsets, long));
			}
		}
	}

	/// True when `label` appears as a branch or switch target or bounds a
	/// handler clause. Only used labels must be bound at emission time.
	fn label_is_used(&self, label: Label) -> bool {
		self.instructions.iter().any(|i| match i {
			Instruction::switch(targets) => targets.0.contains(&label),
			_ => i.branch_target() == Some(label),
		}) || self.eh_clauses.iter().any(|c| {
			c.try_start == label
				|| c.try_end == label
				|| c.handler_start == label
				|| c.handler_end == label
				|| matches!(c.kind, EhKind::Filter(f) if f == label)
		})
	}

	/// Serialises the body: header, code, and EH sections. `local_var_token`
	/// is the StandAloneSig token of the locals signature, or 0.
	pub(crate) fn encode(
		&self,
		local_var_token: u32,
		tokens: &mut dyn TokenSink,
	) -> Result<Vec<u8>> {
		let (offsets, long) = self.resolve_offsets()?;
		let mut label_offsets = Vec::with_capacity(self.labels.len());
		for id in 0..self.labels.len() as u32 {
			let label = Label(id);
			match self.label_is_used(label) {
				true => label_offsets.push(offsets[self.resolved_label(label)? as usize]),
				false => label_offsets.push(0),
			}
		}

		let mut writer = BodyWriter {
			buf: Vec::with_capacity(*offsets.last().unwrap() as usize),
			tokens,
			offsets,
			label_offsets,
			long,
			current: 0,
		};
		for (i, instruction) in self.instructions.iter().enumerate() {
			writer.current = i;
			instruction.encode(&mut writer)?;
		}
		let code = writer.buf;
		debug_assert_eq!(code.len() as u32, *writer.offsets.last().unwrap());

		let raw_clauses = self.encode_eh(&writer.offsets, writer.tokens)?;

		let header = BodyHeader {
			max_stack: self.max_stack,
			code_size: code.len() as u32,
			local_var_token,
			init_locals: self.init_locals && !self.locals.is_empty(),
			has_sections: !raw_clauses.is_empty(),
		};

		let mut bytes = vec![];
		header.write(&mut bytes);
		bytes.extend_from_slice(&code);
		if !raw_clauses.is_empty() {
			pad_to_multiple_of::<4>(&mut bytes);
			il::write_eh_section(&mut bytes, &raw_clauses);
		}
		Ok(bytes)
	}

	fn encode_eh(
		&self,
		offsets: &[u32],
		tokens: &mut dyn TokenSink,
	) -> Result<Vec<RawEhClause>> {
		let offset_of = |label: Label| -> Result<u32> {
			Ok(offsets[self.resolved_label(label)? as usize])
		};
		let mut raw = Vec::with_capacity(self.eh_clauses.len());
		for clause in &self.eh_clauses {
			let try_offset = offset_of(clause.try_start)?;
			let try_end = offset_of(clause.try_end)?;
			let handler_offset = offset_of(clause.handler_start)?;
			let handler_end = offset_of(clause.handler_end)?;
			let (flags, class_token_or_filter) = match &clause.kind {
				EhKind::Exception(ty) => (EH_CLAUSE_EXCEPTION, tokens.type_token(*ty)),
				EhKind::Filter(label) => (EH_CLAUSE_FILTER, offset_of(*label)?),
				EhKind::Finally => (EH_CLAUSE_FINALLY, 0),
				EhKind::Fault => (EH_CLAUSE_FAULT, 0),
			};
			raw.push(RawEhClause {
				flags,
				try_offset,
				try_length: try_end.saturating_sub(try_offset),
				handler_offset,
				handler_length: handler_end.saturating_sub(handler_offset),
				class_token_or_filter,
			});
		}
		Ok(raw)
	}
}

/// Disassembles a body: code bytes into instructions with labels, raw EH
/// clauses into label-bound clauses. Branch targets must land on
/// instruction boundaries.
pub(crate) fn decode_body(
	code: &[u8],
	header: &BodyHeader,
	raw_clauses: &[RawEhClause],
	locals: Vec<LocalVar>,
	tokens: &dyn TokenSource,
) -> Result<MethodBody> {
	let mut reader = BodyReader::new(code, tokens);
	let mut instructions = vec![];
	let mut boundaries = vec![];
	while (reader.stream.position() as usize) < code.len() {
		boundaries.push(reader.stream.position() as u32);
		instructions.push(Instruction::decode(&mut reader)?);
	}
	boundaries.push(code.len() as u32);

	let mut eh_clauses = Vec::with_capacity(raw_clauses.len());
	for raw in raw_clauses {
		let try_start = reader.label_at(raw.try_offset);
		let try_end = reader.label_at(raw.try_offset + raw.try_length);
		let handler_start = reader.label_at(raw.handler_offset);
		let handler_end = reader.label_at(raw.handler_offset + raw.handler_length);
		let kind = match raw.flags {
			EH_CLAUSE_EXCEPTION => EhKind::Exception(tokens.type_item(raw.class_token_or_filter)?),
			EH_CLAUSE_FILTER => EhKind::Filter(reader.label_at(raw.class_token_or_filter)),
			EH_CLAUSE_FINALLY => EhKind::Finally,
			EH_CLAUSE_FAULT => EhKind::Fault,
			_ => return Err(Error::MalformedImage("unknown exception clause kind")),
		};
		eh_clauses.push(EhClause {
			try_start,
			try_end,
			handler_start,
			handler_end,
			kind,
		});
	}

	// Bind every label to the instruction starting at its byte offset.
	let mut labels = vec![None; reader.label_offsets.len()];
	for (id, offset) in reader.label_offsets.iter().enumerate() {
		let Ok(index) = boundaries.binary_search(offset) else {
			return Err(Error::MalformedImage("branch target inside an instruction"));
		};
		labels[id] = Some(index as u32);
	}

	Ok(MethodBody {
		max_stack: header.max_stack,
		init_locals: header.init_locals,
		locals,
		instructions,
		eh_clauses,
		labels,
	})
}

/// Builds the `ldstr`/`ldtoken` user-string token for a #US offset.
pub(crate) fn user_string_token(offset: u32) -> u32 {
	MetadataToken::new(MetadataTokenKind::String, offset).raw()
}

impl Debug for SwitchTargets {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_list();
		for target in &self.0 {
			dbg.entry(target);
		}
		dbg.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::structured::types::ClassRefHandle;

	struct MockTokens;

	impl TokenSource for MockTokens {
		fn type_item(&self, token: u32) -> Result<TypeHandle> {
			Ok(TypeHandle::Ref(ClassRefHandle(token & 0x00FF_FFFF)))
		}
		fn field_item(&self, token: u32) -> Result<FieldItem> {
			Ok(FieldItem::Ref(crate::structured::types::MemberRefHandle(token & 0xFFFF)))
		}
		fn method_item(&self, token: u32) -> Result<MethodItem> {
			Ok(MethodItem::Ref(crate::structured::types::MemberRefHandle(token & 0xFFFF)))
		}
		fn code_item(&self, token: u32) -> Result<CodeItem> {
			Ok(CodeItem::Type(TypeHandle::Ref(ClassRefHandle(token & 0xFFFF))))
		}
		fn call_site(&self, token: u32) -> Result<StandAloneSigHandle> {
			Ok(StandAloneSigHandle(token & 0xFFFF))
		}
		fn user_string(&self, token: u32) -> Result<String> {
			Ok(format!("us{}", token & 0x00FF_FFFF))
		}
	}

	impl TokenSink for MockTokens {
		fn type_token(&mut self, handle: TypeHandle) -> u32 {
			match handle {
				TypeHandle::Ref(h) => 0x0100_0000 | h.0,
				_ => unreachable!(),
			}
		}
		fn field_token(&mut self, item: &FieldItem) -> Result<u32> {
			match item {
				FieldItem::Ref(h) => Ok(0x0A00_0000 | h.0),
				FieldItem::Def(h) => Ok(0x0400_0000 | h.0),
			}
		}
		fn method_token(&mut self, item: &MethodItem) -> Result<u32> {
			match item {
				MethodItem::Ref(h) => Ok(0x0A00_0000 | h.0),
				MethodItem::Def(h) => Ok(0x0600_0000 | h.0),
				MethodItem::Spec(h) => Ok(0x2B00_0000 | h.0),
			}
		}
		fn code_token(&mut self, item: &CodeItem) -> Result<u32> {
			match item {
				CodeItem::Type(handle) => Ok(self.type_token(*handle)),
				_ => unreachable!(),
			}
		}
		fn call_site_token(&mut self, handle: StandAloneSigHandle) -> u32 {
			0x1100_0000 | handle.0
		}
		fn string_token(&mut self, value: &str) -> Result<u32> {
			let offset: u32 = value.trim_start_matches("us").parse().unwrap();
			Ok(user_string_token(offset))
		}
	}

	fn round_trip(body: &MethodBody) -> MethodBody {
		let mut tokens = MockTokens;
		let bytes = body.encode(0, &mut tokens).unwrap();
		let mut stream = Cursor::new(bytes.as_slice());
		let header = BodyHeader::read(&mut stream).unwrap();
		let start = stream.position() as usize;
		let code = &bytes[start..start + header.code_size as usize];
		let clauses = match header.has_sections {
			false => vec![],
			true => {
				let section_start =
					crate::utilities::round_to_multiple_of::<4>(start + code.len());
				let mut section = Cursor::new(&bytes[section_start..]);
				il::read_eh_sections(&mut section).unwrap()
			},
		};
		decode_body(code, &header, &clauses, vec![], &MockTokens).unwrap()
	}

	#[test]
	fn straight_line_body_round_trips() {
		let mut body = MethodBody::new();
		body.instructions = vec![
			Instruction::ldstr("us42".into()),
			Instruction::call(MethodItem::Ref(crate::structured::types::MemberRefHandle(7))),
			Instruction::ret,
		];
		let back = round_trip(&body);
		assert_eq!(back.instructions, body.instructions);
		assert_eq!(back.max_stack, 8);
	}

	#[test]
	fn short_branch_is_chosen_and_round_trips() {
		let mut body = MethodBody::new();
		let target = body.define_label();
		body.instructions.push(Instruction::br(target));
		body.instructions.push(Instruction::nop);
		body.bind(target);
		body.instructions.push(Instruction::ret);

		let mut tokens = MockTokens;
		let bytes = body.encode(0, &mut tokens).unwrap();
		// tiny header, br_s +1, nop, ret
		assert_eq!(bytes[1], 0x2B);
		assert_eq!(bytes[2], 0x01);

		let back = round_trip(&body);
		assert_eq!(back.instructions.len(), 3);
		let Instruction::br(label) = &back.instructions[0] else {
			panic!("expected branch");
		};
		assert_eq!(back.label_target(*label), Some(2));
	}

	#[test]
	fn far_branch_grows_to_long_form() {
		let mut body = MethodBody::new();
		let target = body.define_label();
		body.instructions.push(Instruction::br(target));
		for _ in 0..200 {
			body.instructions.push(Instruction::nop);
		}
		body.bind(target);
		body.instructions.push(Instruction::ret);

		let mut tokens = MockTokens;
		let bytes = body.encode(0, &mut tokens).unwrap();
		// fat header (206 bytes of code), long br with displacement 200.
		assert_eq!(bytes[12], 0x38);
		assert_eq!(&bytes[13..17], &200i32.to_le_bytes());

		let back = round_trip(&body);
		let Instruction::br(label) = &back.instructions[0] else {
			panic!("expected branch");
		};
		assert_eq!(back.label_target(*label), Some(201));
	}

	#[test]
	fn switch_targets_round_trip() {
		let mut body = MethodBody::new();
		let a = body.define_label();
		let b = body.define_label();
		body.instructions.push(Instruction::switch(SwitchTargets(vec![a, b])));
		body.bind(a);
		body.instructions.push(Instruction::nop);
		body.bind(b);
		body.instructions.push(Instruction::ret);

		let back = round_trip(&body);
		let Instruction::switch(targets) = &back.instructions[0] else {
			panic!("expected switch");
		};
		assert_eq!(back.label_target(targets.0[0]), Some(1));
		assert_eq!(back.label_target(targets.0[1]), Some(2));
	}

	#[test]
	fn unresolved_label_is_fatal() {
		let mut body = MethodBody::new();
		let dangling = body.define_label();
		body.instructions.push(Instruction::br(dangling));
		let mut tokens = MockTokens;
		assert!(matches!(
			body.encode(0, &mut tokens),
			Err(Error::UnresolvedLabel(_))
		));
	}

	#[test]
	fn eh_clauses_round_trip_in_order() {
		let mut body = MethodBody::new();
		let try_start = body.define_label();
		let try_end = body.define_label();
		let catch_end = body.define_label();
		let finally_end = body.define_label();

		body.bind(try_start);
		body.instructions.push(Instruction::nop);
		body.instructions.push(Instruction::leave(try_start));
		body.bind(try_end);
		body.instructions.push(Instruction::pop);
		body.instructions.push(Instruction::leave(try_start));
		body.bind(catch_end);
		body.instructions.push(Instruction::endfinally);
		body.bind(finally_end);
		body.instructions.push(Instruction::ret);

		let exception_type = TypeHandle::Ref(ClassRefHandle(3));
		body.eh_clauses.push(EhClause {
			try_start,
			try_end,
			handler_start: try_end,
			handler_end: catch_end,
			kind: EhKind::Exception(exception_type),
		});
		body.eh_clauses.push(EhClause {
			try_start,
			try_end,
			handler_start: catch_end,
			handler_end: finally_end,
			kind: EhKind::Finally,
		});

		let back = round_trip(&body);
		assert_eq!(back.eh_clauses.len(), 2);
		assert!(matches!(back.eh_clauses[0].kind, EhKind::Exception(t) if t == exception_type));
		assert!(matches!(back.eh_clauses[1].kind, EhKind::Finally));
		assert_eq!(
			back.label_target(back.eh_clauses[0].try_start),
			Some(0)
		);
		assert_eq!(
			back.label_target(back.eh_clauses[1].handler_start),
			Some(4)
		);
	}

	#[test]
	fn invalid_opcode_is_reported() {
		let code = [0x24u8];
		let header = BodyHeader {
			max_stack: 8,
			code_size: 1,
			local_var_token: 0,
			init_locals: false,
			has_sections: false,
		};
		assert!(matches!(
			decode_body(&code, &header, &[], vec![], &MockTokens),
			Err(Error::InvalidOpcode(0x24))
		));
	}
}
