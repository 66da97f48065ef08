//! The load pipeline: stream parsing, row materialisation, and the
//! resolution pass that replaces every stored index with a direct handle.
//! A failure anywhere discards the partially built model.

use std::io::Cursor;

use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::raw::assembly::{CliHeader, MetadataRoot};
use crate::raw::heaps::table::{TableKind, TablesStream};
use crate::raw::heaps::{BlobHeap, BlobIndex, GuidHeap, StringHeap, StringIndex, UserStringHeap};
use crate::raw::il::{read_eh_sections, BodyHeader};
use crate::raw::indices::coded_index::TypeDefOrRef;
use crate::raw::indices::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::raw::pe::PeFile;
use crate::structured::body::{decode_body, TokenSource};
use crate::structured::image::{Image, LoadOptions};
use crate::structured::members::*;
use crate::structured::signatures::{
	locals_from_blob, method_spec_from_blob, FieldSig, MemberRefSig, MethodSig, PropertySig,
	SigDecode, SIG_LOCALS,
};
use crate::structured::types::*;
use crate::utilities::{round_to_multiple_of, FromByteStream};

const EMPTY_HEAP: &[u8] = &[0];

/// Index resolution against the final row counts; shared by the signature
/// codec and the IL token decoder.
struct Resolver<'l> {
	rows: [u32; 64],
	us: UserStringHeap<'l>,
}

impl Resolver<'_> {
	fn check(&self, kind: TableKind, token_kind: MetadataTokenKind, row: u32) -> Result<u32> {
		match row >= 1 && row <= self.rows[kind as usize] {
			true => Ok(row - 1),
			false => Err(Error::IndexOutOfRange(MetadataToken::new(token_kind, row))),
		}
	}

	fn type_handle_at(&self, kind: TableKind, row: u32) -> Result<TypeHandle> {
		Ok(match kind {
			TableKind::TypeDef => TypeHandle::Def(ClassDefHandle(self.check(
				kind,
				MetadataTokenKind::TypeDef,
				row,
			)?)),
			TableKind::TypeRef => TypeHandle::Ref(ClassRefHandle(self.check(
				kind,
				MetadataTokenKind::TypeRef,
				row,
			)?)),
			TableKind::TypeSpec => TypeHandle::Spec(TypeSpecHandle(self.check(
				kind,
				MetadataTokenKind::TypeSpec,
				row,
			)?)),
			_ => return Err(Error::Signature("not a type token")),
		})
	}
}

impl SigDecode for Resolver<'_> {
	fn type_handle(&self, coded: TypeDefOrRef) -> Result<TypeHandle> {
		let (kind, row) = coded.decode();
		if row == 0 {
			return Err(Error::Signature("null type token in signature"));
		}
		self.type_handle_at(kind, row)
	}
}

impl TokenSource for Resolver<'_> {
	fn type_item(&self, token: u32) -> Result<TypeHandle> {
		let token = parse_token(token)?;
		let kind = match token.kind() {
			MetadataTokenKind::TypeDef => TableKind::TypeDef,
			MetadataTokenKind::TypeRef => TableKind::TypeRef,
			MetadataTokenKind::TypeSpec => TableKind::TypeSpec,
			_ => return Err(Error::IndexOutOfRange(token)),
		};
		self.type_handle_at(kind, token.index())
	}

	fn field_item(&self, token: u32) -> Result<FieldItem> {
		let token = parse_token(token)?;
		match token.kind() {
			MetadataTokenKind::Field => Ok(FieldItem::Def(FieldHandle(self.check(
				TableKind::Field,
				MetadataTokenKind::Field,
				token.index(),
			)?))),
			MetadataTokenKind::MemberRef => Ok(FieldItem::Ref(MemberRefHandle(self.check(
				TableKind::MemberRef,
				MetadataTokenKind::MemberRef,
				token.index(),
			)?))),
			_ => Err(Error::IndexOutOfRange(token)),
		}
	}

	fn method_item(&self, token: u32) -> Result<MethodItem> {
		let token = parse_token(token)?;
		match token.kind() {
			MetadataTokenKind::MethodDef => Ok(MethodItem::Def(MethodHandle(self.check(
				TableKind::MethodDef,
				MetadataTokenKind::MethodDef,
				token.index(),
			)?))),
			MetadataTokenKind::MemberRef => Ok(MethodItem::Ref(MemberRefHandle(self.check(
				TableKind::MemberRef,
				MetadataTokenKind::MemberRef,
				token.index(),
			)?))),
			MetadataTokenKind::MethodSpec => Ok(MethodItem::Spec(MethodSpecHandle(self.check(
				TableKind::MethodSpec,
				MetadataTokenKind::MethodSpec,
				token.index(),
			)?))),
			_ => Err(Error::IndexOutOfRange(token)),
		}
	}

	fn code_item(&self, token: u32) -> Result<CodeItem> {
		let parsed = parse_token(token)?;
		match parsed.kind() {
			MetadataTokenKind::TypeDef
			| MetadataTokenKind::TypeRef
			| MetadataTokenKind::TypeSpec => Ok(CodeItem::Type(self.type_item(token)?)),
			MetadataTokenKind::Field => Ok(CodeItem::Field(self.field_item(token)?)),
			MetadataTokenKind::MethodDef | MetadataTokenKind::MethodSpec => {
				Ok(CodeItem::Method(self.method_item(token)?))
			},
			// A MemberRef token is ambiguous between fields and methods;
			// ldtoken treats it as a member reference either way.
			MetadataTokenKind::MemberRef => Ok(CodeItem::Method(self.method_item(token)?)),
			_ => Err(Error::IndexOutOfRange(parsed)),
		}
	}

	fn call_site(&self, token: u32) -> Result<StandAloneSigHandle> {
		let token = parse_token(token)?;
		match token.kind() {
			MetadataTokenKind::StandAloneSig => Ok(StandAloneSigHandle(self.check(
				TableKind::StandAloneSig,
				MetadataTokenKind::StandAloneSig,
				token.index(),
			)?)),
			_ => Err(Error::IndexOutOfRange(token)),
		}
	}

	fn user_string(&self, token: u32) -> Result<String> {
		let token = parse_token(token)?;
		match token.kind() {
			MetadataTokenKind::String => self
				.us
				.get(token.index())
				.ok_or(Error::MalformedImage("invalid #US offset in ldstr")),
			_ => Err(Error::IndexOutOfRange(token)),
		}
	}
}

fn parse_token(raw: u32) -> Result<MetadataToken> {
	MetadataToken::try_from(raw).map_err(|_| Error::MalformedImage("unknown token kind in IL"))
}

struct Heaps<'l> {
	strings: StringHeap<'l>,
	blobs: BlobHeap<'l>,
	guids: GuidHeap<'l>,
}

impl Heaps<'_> {
	fn str_of(&self, index: StringIndex) -> Result<String> {
		self.strings
			.get(index)
			.map(str::to_owned)
			.ok_or(Error::MalformedImage("string index out of range"))
	}

	fn blob_of(&self, index: BlobIndex) -> Result<&[u8]> {
		self.blobs
			.get(index)
			.ok_or(Error::MalformedImage("blob index out of range"))
	}
}

/// Sizes of field initial data recoverable from the field's signature;
/// FieldRVA data of other shapes stays behind in the image.
fn field_data_size(image: &Image, sig: &TypeSig) -> Option<usize> {
	match sig {
		TypeSig::Bool | TypeSig::I1 | TypeSig::U1 => Some(1),
		TypeSig::Char | TypeSig::I2 | TypeSig::U2 => Some(2),
		TypeSig::I4 | TypeSig::U4 | TypeSig::R4 => Some(4),
		TypeSig::I8 | TypeSig::U8 | TypeSig::R8 => Some(8),
		TypeSig::ValueType(TypeHandle::Def(handle)) => image
			.class(*handle)
			.layout
			.map(|layout| layout.class_size as usize),
		_ => None,
	}
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub(crate) fn load(data: &[u8], options: &LoadOptions) -> Result<Image> {
	let pe = PeFile::read(data).map_err(|e| Error::from_stream(e, "invalid PE envelope"))?;
	let cli_dir = pe
		.cli_header_directory()
		.ok_or(Error::MalformedImage("image carries no CLI header"))?;
	let cli_bytes = pe
		.resolve_rva(cli_dir.virtual_address)
		.ok_or(Error::MalformedImage("CLI header outside any section"))?;
	let cli = CliHeader::read(&mut Cursor::new(cli_bytes), &())
		.map_err(|e| Error::from_stream(e, "invalid CLI header"))?;

	let metadata_bytes = pe
		.resolve_rva(cli.metadata.virtual_address)
		.and_then(|slice| slice.get(..cli.metadata.size as usize))
		.ok_or(Error::MalformedImage("metadata root outside any section"))?;
	let root = MetadataRoot::read(metadata_bytes)
		.map_err(|e| Error::from_stream(e, "invalid metadata root"))?;

	let tables_stream = TablesStream::read(
		root.stream("#~")
			.ok_or(Error::MalformedImage("missing #~ stream"))?,
	)
	.map_err(|e| Error::from_stream(e, "invalid #~ stream"))?;
	let t = &tables_stream.tables;

	if !(t.field_ptr.is_empty()
		&& t.method_ptr.is_empty()
		&& t.param_ptr.is_empty()
		&& t.event_ptr.is_empty()
		&& t.property_ptr.is_empty()
		&& t.enc_log.is_empty()
		&& t.enc_map.is_empty())
	{
		return Err(Error::MalformedImage("edit-and-continue images are not supported"));
	}

	let heaps = Heaps {
		strings: StringHeap::try_from(root.stream("#Strings").unwrap_or(EMPTY_HEAP))
			.map_err(|e| Error::from_stream(e, "invalid #Strings stream"))?,
		blobs: BlobHeap::from(root.stream("#Blob").unwrap_or(EMPTY_HEAP)),
		guids: GuidHeap::try_from(root.stream("#GUID").unwrap_or(&[]))
			.map_err(|e| Error::from_stream(e, "invalid #GUID stream"))?,
	};
	let resolver = Resolver {
		rows: tables_stream.sizes.rows,
		us: UserStringHeap::from(root.stream("#US").unwrap_or(EMPTY_HEAP)),
	};

	// ---- row materialisation + resolution ----

	let [module_row] = t.module.as_slice() else {
		return Err(Error::MalformedImage("image must have exactly one Module row"));
	};
	let mut image = Image::new(heaps.str_of(module_row.name)?);
	image.module.generation = module_row.generation;
	image.module.mvid = heaps.guids.get(module_row.mv_id).unwrap_or(Uuid::nil());
	image.classes.clear();

	if let Some(row) = t.assembly.first() {
		image.assembly = Some(AssemblyDef {
			name: heaps.str_of(row.name)?,
			version: (
				row.major_version,
				row.minor_version,
				row.build_number,
				row.revision_number,
			),
			flags: row.flags,
			hash_algorithm: row.hash_algorithm,
			culture: heaps.str_of(row.culture)?,
			public_key: heaps.blob_of(row.public_key)?.to_vec(),
		});
	}

	for row in &t.assembly_ref {
		image.assembly_refs.push(AssemblyRefDef {
			name: heaps.str_of(row.name)?,
			version: (
				row.major_version,
				row.minor_version,
				row.build_number,
				row.revision_number,
			),
			flags: row.flags,
			culture: heaps.str_of(row.culture)?,
			public_key_or_token: heaps.blob_of(row.public_key_or_token)?.to_vec(),
			hash_value: heaps.blob_of(row.hash_value)?.to_vec(),
		});
	}

	for row in &t.module_ref {
		image.module_refs.push(ModuleRefDef {
			name: heaps.str_of(row.name)?,
		});
	}

	for row in &t.type_ref {
		let (kind, scope_row) = row.resolution_scope.decode();
		let scope = match kind {
			TableKind::ModuleRef => ResolutionScopeRef::ModuleRef(ModuleRefHandle(resolver.check(
				kind,
				MetadataTokenKind::ModuleRef,
				scope_row,
			)?)),
			TableKind::AssemblyRef => {
				ResolutionScopeRef::AssemblyRef(AssemblyRefHandle(resolver.check(
					kind,
					MetadataTokenKind::AssemblyRef,
					scope_row,
				)?))
			},
			TableKind::TypeRef => ResolutionScopeRef::Nested(ClassRefHandle(resolver.check(
				kind,
				MetadataTokenKind::TypeRef,
				scope_row,
			)?)),
			// A TypeRef resolved through the Module table is the mark of a
			// known-broken legacy assembler; such images are rejected.
			_ => return Err(Error::MalformedImage("TypeRef scoped to the Module table")),
		};
		image.class_refs.push(ClassRef {
			scope,
			namespace: heaps.str_of(row.type_namespace)?,
			name: heaps.str_of(row.type_name)?,
		});
	}

	// Classes with their contiguous member ranges, delimited by the next
	// row's list index.
	let field_count = t.field.len() as u32;
	let method_count = t.method_def.len() as u32;
	if t.type_def.is_empty() && (field_count > 0 || method_count > 0) {
		return Err(Error::MalformedImage("members without any owning type"));
	}
	for (i, row) in t.type_def.iter().enumerate() {
		let extends = match row.extends.is_null() {
			true => None,
			false => Some(resolver.type_handle(row.extends)?),
		};
		let mut class = ClassDef::new(
			heaps.str_of(row.type_namespace)?,
			heaps.str_of(row.type_name)?,
			row.flags,
			extends,
		);

		let field_start = row.field_list.0;
		let field_end = match t.type_def.get(i + 1) {
			Some(next) => next.field_list.0,
			None => field_count + 1,
		};
		let method_start = row.method_list.0;
		let method_end = match t.type_def.get(i + 1) {
			Some(next) => next.method_list.0,
			None => method_count + 1,
		};
		let ranges_valid = (i > 0 || (field_start == 1 && method_start == 1))
			&& field_start >= 1
			&& field_start <= field_end
			&& field_end <= field_count + 1
			&& method_start >= 1
			&& method_start <= method_end
			&& method_end <= method_count + 1;
		if !ranges_valid {
			return Err(Error::MalformedImage("member list ranges are not contiguous"));
		}
		class.fields = (field_start..field_end).map(|r| FieldHandle(r - 1)).collect();
		class.methods = (method_start..method_end).map(|r| MethodHandle(r - 1)).collect();
		image.classes.push(class);
	}

	for row in &t.field {
		image.fields.push(FieldDef::new(
			heaps.str_of(row.name)?,
			row.flags,
			FieldSig::from_blob(heaps.blob_of(row.signature)?, &resolver)?,
		));
	}

	// Methods and their parameter ranges; `param_owner` maps a Param row
	// back to its (method, index) position for constants and attributes.
	let param_count = t.param.len() as u32;
	let mut param_owner = Vec::with_capacity(t.param.len());
	for (i, row) in t.method_def.iter().enumerate() {
		let mut method = MethodDef::new(
			heaps.str_of(row.name)?,
			row.flags,
			MethodSig::from_blob(heaps.blob_of(row.signature)?, &resolver)?,
		);
		method.impl_flags = row.impl_flags;

		let start = row.param_list.0;
		let end = match t.method_def.get(i + 1) {
			Some(next) => next.param_list.0,
			None => param_count + 1,
		};
		if !((i > 0 || start == 1) && start >= 1 && start <= end && end <= param_count + 1) {
			return Err(Error::MalformedImage("parameter list ranges are not contiguous"));
		}
		for (index, param_row) in t.param[start as usize - 1..end as usize - 1].iter().enumerate() {
			method.params.push(ParamDef {
				flags: param_row.flags,
				sequence: param_row.sequence,
				name: heaps.str_of(param_row.name)?,
				constant: None,
				marshal: None,
			});
			param_owner.push((MethodHandle(i as u32), index as u16));
		}
		image.methods.push(method);
	}
	debug_assert_eq!(param_owner.len(), t.param.len());

	for row in &t.interface_impl {
		let class = resolver.check(TableKind::TypeDef, MetadataTokenKind::TypeDef, row.class.0)?;
		if row.interface.is_null() {
			return Err(Error::MalformedImage("null interface in InterfaceImpl"));
		}
		let interface = resolver
			.type_handle(row.interface)
			.map_err(|_| Error::MalformedImage("invalid interface in InterfaceImpl"))?;
		image.classes[class as usize].interfaces.push(interface);
	}

	for row in &t.class_layout {
		let class = resolver.check(TableKind::TypeDef, MetadataTokenKind::TypeDef, row.parent.0)?;
		image.classes[class as usize].layout = Some(ClassLayoutInfo {
			packing_size: row.packing_size,
			class_size: row.class_size,
		});
	}

	for row in &t.field_layout {
		let field = resolver.check(TableKind::Field, MetadataTokenKind::Field, row.field.0)?;
		image.fields[field as usize].layout_offset = Some(row.offset);
	}

	for row in &t.nested_class {
		let nested =
			resolver.check(TableKind::TypeDef, MetadataTokenKind::TypeDef, row.nested_class.0)?;
		let enclosing = resolver.check(
			TableKind::TypeDef,
			MetadataTokenKind::TypeDef,
			row.enclosing_class.0,
		)?;
		image.classes[nested as usize].enclosing = Some(ClassDefHandle(enclosing));
		image.classes[enclosing as usize].nested.push(ClassDefHandle(nested));
	}

	// Reference rows.
	for row in &t.member_ref {
		let (kind, parent_row) = row.class.decode();
		let parent = match kind {
			TableKind::TypeDef => MemberRefParentRef::ClassDef(ClassDefHandle(resolver.check(
				kind,
				MetadataTokenKind::TypeDef,
				parent_row,
			)?)),
			TableKind::TypeRef => MemberRefParentRef::ClassRef(ClassRefHandle(resolver.check(
				kind,
				MetadataTokenKind::TypeRef,
				parent_row,
			)?)),
			TableKind::ModuleRef => MemberRefParentRef::ModuleRef(ModuleRefHandle(resolver.check(
				kind,
				MetadataTokenKind::ModuleRef,
				parent_row,
			)?)),
			TableKind::MethodDef => MemberRefParentRef::Method(MethodHandle(resolver.check(
				kind,
				MetadataTokenKind::MethodDef,
				parent_row,
			)?)),
			_ => MemberRefParentRef::TypeSpec(TypeSpecHandle(resolver.check(
				TableKind::TypeSpec,
				MetadataTokenKind::TypeSpec,
				parent_row,
			)?)),
		};
		image.member_refs.push(MemberRefDef {
			parent,
			name: heaps.str_of(row.name)?,
			sig: MemberRefSig::from_blob(heaps.blob_of(row.signature)?, &resolver)?,
		});
	}

	for row in &t.type_spec {
		let blob = heaps.blob_of(row.signature)?;
		image
			.type_specs
			.push(TypeSig::decode(&mut Cursor::new(blob), &resolver)?);
	}

	for row in &t.stand_alone_sig {
		let blob = heaps.blob_of(row.signature)?;
		let sig = match blob.first() {
			Some(&SIG_LOCALS) => StandAloneSigDef::Locals(locals_from_blob(blob, &resolver)?),
			Some(_) => StandAloneSigDef::Method(MethodSig::from_blob(blob, &resolver)?),
			None => return Err(Error::Signature("empty standalone signature")),
		};
		image.standalone_sigs.push(sig);
	}

	for row in &t.method_spec {
		let (kind, method_row) = row.method.decode();
		let method = match kind {
			TableKind::MethodDef => MethodRef::Def(MethodHandle(resolver.check(
				kind,
				MetadataTokenKind::MethodDef,
				method_row,
			)?)),
			_ => MethodRef::Ref(MemberRefHandle(resolver.check(
				TableKind::MemberRef,
				MetadataTokenKind::MemberRef,
				method_row,
			)?)),
		};
		image.method_specs.push(MethodSpecDef {
			method,
			args: method_spec_from_blob(heaps.blob_of(row.instantiation)?, &resolver)?,
		});
	}

	for row in &t.method_impl {
		let class = resolver.check(TableKind::TypeDef, MetadataTokenKind::TypeDef, row.class.0)?;
		let decode_method = |coded: crate::raw::indices::coded_index::MethodDefOrRef| {
			let (kind, method_row) = coded.decode();
			match kind {
				TableKind::MethodDef => Ok(MethodRef::Def(MethodHandle(resolver.check(
					kind,
					MetadataTokenKind::MethodDef,
					method_row,
				)?))),
				_ => Ok::<_, Error>(MethodRef::Ref(MemberRefHandle(resolver.check(
					TableKind::MemberRef,
					MetadataTokenKind::MemberRef,
					method_row,
				)?))),
			}
		};
		let body = decode_method(row.body)?;
		let declaration = decode_method(row.declaration)?;
		image.classes[class as usize].overrides.push((body, declaration));
	}

	// Properties and events with their maps and accessor rows.
	for row in &t.property {
		image.properties.push(PropertyDef {
			flags: row.flags,
			name: heaps.str_of(row.name)?,
			sig: PropertySig::from_blob(heaps.blob_of(row.ty)?, &resolver)?,
			constant: None,
			accessors: vec![],
		});
	}
	for row in &t.event {
		let event_type = match row.event_type.is_null() {
			true => None,
			false => Some(
				resolver
					.type_handle(row.event_type)
					.map_err(|_| Error::MalformedImage("invalid event type"))?,
			),
		};
		image.events.push(EventDef {
			flags: row.flags,
			name: heaps.str_of(row.name)?,
			event_type,
			accessors: vec![],
		});
	}
	let property_count = t.property.len() as u32;
	let mut covered_properties = 0;
	for (i, row) in t.property_map.iter().enumerate() {
		let class = resolver.check(TableKind::TypeDef, MetadataTokenKind::TypeDef, row.parent.0)?;
		let start = row.property_list.0;
		let end = match t.property_map.get(i + 1) {
			Some(next) => next.property_list.0,
			None => property_count + 1,
		};
		if !(start >= 1 && start <= end && end <= property_count + 1) {
			return Err(Error::MalformedImage("property list ranges are not contiguous"));
		}
		covered_properties += end - start;
		image.classes[class as usize].properties =
			(start..end).map(|r| PropertyHandle(r - 1)).collect();
	}
	if covered_properties != property_count {
		return Err(Error::MalformedImage("property rows not covered by PropertyMap"));
	}
	let event_count = t.event.len() as u32;
	let mut covered_events = 0;
	for (i, row) in t.event_map.iter().enumerate() {
		let class = resolver.check(TableKind::TypeDef, MetadataTokenKind::TypeDef, row.parent.0)?;
		let start = row.event_list.0;
		let end = match t.event_map.get(i + 1) {
			Some(next) => next.event_list.0,
			None => event_count + 1,
		};
		if !(start >= 1 && start <= end && end <= event_count + 1) {
			return Err(Error::MalformedImage("event list ranges are not contiguous"));
		}
		covered_events += end - start;
		image.classes[class as usize].events = (start..end).map(|r| EventHandle(r - 1)).collect();
	}
	if covered_events != event_count {
		return Err(Error::MalformedImage("event rows not covered by EventMap"));
	}
	for row in &t.method_semantics {
		let method = MethodHandle(resolver.check(
			TableKind::MethodDef,
			MetadataTokenKind::MethodDef,
			row.method.0,
		)?);
		let (kind, assoc_row) = row.association.decode();
		match kind {
			TableKind::Property => {
				let property =
					resolver.check(kind, MetadataTokenKind::Property, assoc_row)?;
				image.properties[property as usize].accessors.push((row.flags, method));
			},
			_ => {
				let event = resolver.check(TableKind::Event, MetadataTokenKind::Event, assoc_row)?;
				image.events[event as usize].accessors.push((row.flags, method));
			},
		}
	}

	// Constants, marshalling, security and PInvoke attachments.
	for row in &t.constant {
		let value = ConstantValue::from_row(row.ty[0], heaps.blob_of(row.value)?)?;
		let (kind, parent_row) = row.parent.decode();
		match kind {
			TableKind::Field => {
				let field = resolver.check(kind, MetadataTokenKind::Field, parent_row)?;
				image.fields[field as usize].constant = Some(value);
			},
			TableKind::Param => {
				let param = resolver.check(kind, MetadataTokenKind::Param, parent_row)?;
				let (method, index) = param_owner[param as usize];
				image.methods[method.index()].params[index as usize].constant = Some(value);
			},
			_ => {
				let property =
					resolver.check(TableKind::Property, MetadataTokenKind::Property, parent_row)?;
				image.properties[property as usize].constant = Some(value);
			},
		}
	}

	for row in &t.field_marshal {
		let native_type = heaps.blob_of(row.native_type)?.to_vec();
		let (kind, parent_row) = row.parent.decode();
		match kind {
			TableKind::Field => {
				let field = resolver.check(kind, MetadataTokenKind::Field, parent_row)?;
				image.fields[field as usize].marshal = Some(native_type);
			},
			_ => {
				let param = resolver.check(TableKind::Param, MetadataTokenKind::Param, parent_row)?;
				let (method, index) = param_owner[param as usize];
				image.methods[method.index()].params[index as usize].marshal = Some(native_type);
			},
		}
	}

	for row in &t.decl_security {
		let (kind, parent_row) = row.parent.decode();
		let owner = match kind {
			TableKind::TypeDef => SecurityOwner::Class(ClassDefHandle(resolver.check(
				kind,
				MetadataTokenKind::TypeDef,
				parent_row,
			)?)),
			TableKind::MethodDef => SecurityOwner::Method(MethodHandle(resolver.check(
				kind,
				MetadataTokenKind::MethodDef,
				parent_row,
			)?)),
			_ => SecurityOwner::Assembly,
		};
		image.decl_security.push((
			owner,
			DeclSecurityDef {
				action: row.action,
				permission_set: heaps.blob_of(row.permission_set)?.to_vec(),
			},
		));
	}

	for row in &t.impl_map {
		let (kind, forwarded_row) = row.member_forwarded.decode();
		if kind != TableKind::MethodDef {
			return Err(Error::MalformedImage("ImplMap must forward a method"));
		}
		let method = resolver.check(kind, MetadataTokenKind::MethodDef, forwarded_row)?;
		let scope = resolver.check(
			TableKind::ModuleRef,
			MetadataTokenKind::ModuleRef,
			row.import_scope.0,
		)?;
		image.methods[method as usize].pinvoke = Some(PInvokeInfo {
			flags: row.flags,
			import_name: heaps.str_of(row.import_name)?,
			import_scope: ModuleRefHandle(scope),
		});
	}

	// Generic parameters: attach to owners in row order, remembering each
	// row's place for constraints and attribute owners.
	let mut generic_rows = Vec::with_capacity(t.generic_param.len());
	for row in &t.generic_param {
		let (kind, owner_row) = row.owner.decode();
		let gp = GenericParamDef {
			number: row.number,
			flags: row.flags,
			name: heaps.str_of(row.name)?,
			constraints: vec![],
		};
		let (owner, list_index) = match kind {
			TableKind::TypeDef => {
				let class = resolver.check(kind, MetadataTokenKind::TypeDef, owner_row)?;
				let list = &mut image.classes[class as usize].generic_params;
				list.push(gp);
				(GenericParamOwner::Class(ClassDefHandle(class)), list.len() - 1)
			},
			_ => {
				let method =
					resolver.check(TableKind::MethodDef, MetadataTokenKind::MethodDef, owner_row)?;
				let list = &mut image.methods[method as usize].generic_params;
				list.push(gp);
				(GenericParamOwner::Method(MethodHandle(method)), list.len() - 1)
			},
		};
		generic_rows.push((owner, list_index, row.number));
	}
	for row in &t.generic_param_constraint {
		let gp = resolver.check(
			TableKind::GenericParam,
			MetadataTokenKind::GenericParam,
			row.owner.0,
		)?;
		let constraint = resolver
			.type_handle(row.constraint)
			.map_err(|_| Error::MalformedImage("invalid generic parameter constraint"))?;
		let (owner, list_index, _) = generic_rows[gp as usize];
		match owner {
			GenericParamOwner::Class(h) => image.classes[h.index()].generic_params[list_index]
				.constraints
				.push(constraint),
			GenericParamOwner::Method(h) => image.methods[h.index()].generic_params[list_index]
				.constraints
				.push(constraint),
		}
	}

	// Manifest extras.
	for row in &t.file {
		image.files.push(FileDef {
			flags: row.flags,
			name: heaps.str_of(row.name)?,
			hash_value: heaps.blob_of(row.hash_value)?.to_vec(),
		});
	}
	let implementation_of = |coded: crate::raw::indices::coded_index::Implementation| {
		let (kind, row) = coded.decode();
		Ok::<_, Error>(match kind {
			TableKind::File => {
				ImplementationRef::File(FileHandle(resolver.check(
					kind,
					MetadataTokenKind::File,
					row,
				)?))
			},
			TableKind::AssemblyRef => ImplementationRef::AssemblyRef(AssemblyRefHandle(
				resolver.check(kind, MetadataTokenKind::AssemblyRef, row)?,
			)),
			_ => ImplementationRef::ExportedType(ExportedTypeHandle(resolver.check(
				TableKind::ExportedType,
				MetadataTokenKind::ExportedType,
				row,
			)?)),
		})
	};
	for row in &t.exported_type {
		image.exported_types.push(ExportedTypeDef {
			flags: row.flags,
			type_def_id: row.type_def_id,
			namespace: heaps.str_of(row.type_namespace)?,
			name: heaps.str_of(row.type_name)?,
			implementation: implementation_of(row.implementation)?,
		});
	}
	for row in &t.manifest_resource {
		let implementation = match row.implementation.is_null() {
			true => None,
			false => Some(implementation_of(row.implementation)?),
		};
		image.resources.push(ManifestResourceDef {
			offset: row.offset,
			flags: row.flags,
			name: heaps.str_of(row.name)?,
			implementation,
		});
	}

	// Custom attributes.
	for row in &t.custom_attribute {
		let (kind, parent_row) = row.parent.decode();
		let owner = match kind {
			TableKind::Assembly => AttributeOwner::Assembly,
			TableKind::Module => AttributeOwner::Module,
			TableKind::TypeDef => AttributeOwner::Class(ClassDefHandle(resolver.check(
				kind,
				MetadataTokenKind::TypeDef,
				parent_row,
			)?)),
			TableKind::TypeRef => AttributeOwner::ClassRef(ClassRefHandle(resolver.check(
				kind,
				MetadataTokenKind::TypeRef,
				parent_row,
			)?)),
			TableKind::TypeSpec => AttributeOwner::TypeSpec(TypeSpecHandle(resolver.check(
				kind,
				MetadataTokenKind::TypeSpec,
				parent_row,
			)?)),
			TableKind::Field => AttributeOwner::Field(FieldHandle(resolver.check(
				kind,
				MetadataTokenKind::Field,
				parent_row,
			)?)),
			TableKind::MethodDef => AttributeOwner::Method(MethodHandle(resolver.check(
				kind,
				MetadataTokenKind::MethodDef,
				parent_row,
			)?)),
			TableKind::Param => {
				let param = resolver.check(kind, MetadataTokenKind::Param, parent_row)?;
				let (method, index) = param_owner[param as usize];
				AttributeOwner::Param(method, index)
			},
			TableKind::Property => AttributeOwner::Property(PropertyHandle(resolver.check(
				kind,
				MetadataTokenKind::Property,
				parent_row,
			)?)),
			TableKind::Event => AttributeOwner::Event(EventHandle(resolver.check(
				kind,
				MetadataTokenKind::Event,
				parent_row,
			)?)),
			TableKind::GenericParam => {
				let gp = resolver.check(kind, MetadataTokenKind::GenericParam, parent_row)?;
				let (owner, _, number) = generic_rows[gp as usize];
				AttributeOwner::GenericParam(owner, number)
			},
			TableKind::MemberRef => AttributeOwner::MemberRef(MemberRefHandle(resolver.check(
				kind,
				MetadataTokenKind::MemberRef,
				parent_row,
			)?)),
			TableKind::AssemblyRef => AttributeOwner::AssemblyRef(AssemblyRefHandle(
				resolver.check(kind, MetadataTokenKind::AssemblyRef, parent_row)?,
			)),
			TableKind::ModuleRef => AttributeOwner::ModuleRef(ModuleRefHandle(resolver.check(
				kind,
				MetadataTokenKind::ModuleRef,
				parent_row,
			)?)),
			TableKind::File => AttributeOwner::File(FileHandle(resolver.check(
				kind,
				MetadataTokenKind::File,
				parent_row,
			)?)),
			TableKind::ExportedType => AttributeOwner::ExportedType(ExportedTypeHandle(
				resolver.check(kind, MetadataTokenKind::ExportedType, parent_row)?,
			)),
			TableKind::ManifestResource => AttributeOwner::ManifestResource(ResourceHandle(
				resolver.check(kind, MetadataTokenKind::ManifestResource, parent_row)?,
			)),
			TableKind::StandAloneSig => AttributeOwner::StandAloneSig(StandAloneSigHandle(
				resolver.check(kind, MetadataTokenKind::StandAloneSig, parent_row)?,
			)),
			TableKind::MethodSpec => AttributeOwner::MethodSpec(MethodSpecHandle(resolver.check(
				kind,
				MetadataTokenKind::MethodSpec,
				parent_row,
			)?)),
			_ => return Err(Error::MalformedImage("unsupported custom attribute owner")),
		};
		let (ctor_kind, ctor_row) = row.ty.decode();
		let ctor = match ctor_kind {
			TableKind::MethodDef => MethodRef::Def(MethodHandle(resolver.check(
				ctor_kind,
				MetadataTokenKind::MethodDef,
				ctor_row,
			)?)),
			_ => MethodRef::Ref(MemberRefHandle(resolver.check(
				TableKind::MemberRef,
				MetadataTokenKind::MemberRef,
				ctor_row,
			)?)),
		};
		image.custom_attributes.push((
			owner,
			CustomAttributeDef {
				ctor,
				value: heaps.blob_of(row.value)?.to_vec(),
			},
		));
	}

	// Field initial data.
	for row in &t.field_r_v_a {
		let field = resolver.check(TableKind::Field, MetadataTokenKind::Field, row.field.0)?;
		let sig = image.fields[field as usize].sig.ty.clone();
		let Some(size) = field_data_size(&image, &sig) else {
			#[cfg(feature = "tracing")]
			tracing::debug!(row = field + 1, "field data of unknown size left behind");
			continue;
		};
		let data = pe
			.resolve_rva(row.rva)
			.and_then(|slice| slice.get(..size))
			.ok_or(Error::MalformedImage("field data outside any section"))?;
		image.fields[field as usize].rva_data = Some(data.to_vec());
	}

	// Entry point.
	if cli.entry_point_token != 0 {
		let token = parse_token(cli.entry_point_token)?;
		if token.kind() != MetadataTokenKind::MethodDef {
			return Err(Error::MalformedImage("entry point is not a MethodDef token"));
		}
		let method = resolver.check(
			TableKind::MethodDef,
			MetadataTokenKind::MethodDef,
			token.index(),
		)?;
		image.entry_point = Some(MethodHandle(method));
	}

	// Method bodies, last: every row they can reference now has a handle.
	load_bodies(&mut image, t, &pe, &resolver, options)?;

	image.rebuild_intern_maps();
	Ok(image)
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
fn load_bodies(
	image: &mut Image,
	t: &crate::raw::heaps::table::Tables,
	pe: &PeFile<'_>,
	resolver: &Resolver<'_>,
	options: &LoadOptions,
) -> Result<()> {
	for (i, row) in t.method_def.iter().enumerate() {
		if row.rva == 0 {
			continue;
		}
		let slice = pe
			.resolve_rva(row.rva)
			.ok_or(Error::MalformedImage("method body outside any section"))?;
		let mut cursor = Cursor::new(slice);
		let header = BodyHeader::read(&mut cursor)
			.map_err(|e| Error::from_stream(e, "invalid method body header"))?;
		let code_start = cursor.position() as usize;
		let code = slice
			.get(code_start..code_start + header.code_size as usize)
			.ok_or(Error::MalformedImage("truncated method body"))?;

		let raw_clauses = match header.has_sections {
			false => vec![],
			true => {
				let section_start =
					round_to_multiple_of::<4>(code_start + header.code_size as usize);
				let section = slice
					.get(section_start..)
					.ok_or(Error::MalformedImage("truncated method data sections"))?;
				read_eh_sections(&mut Cursor::new(section))
					.map_err(|e| Error::from_stream(e, "invalid exception clause section"))?
			},
		};

		let locals = match header.local_var_token {
			0 => vec![],
			raw => {
				let token = parse_token(raw)?;
				if token.kind() != MetadataTokenKind::StandAloneSig {
					return Err(Error::MalformedImage("body locals token is not StandAloneSig"));
				}
				let sig = resolver.check(
					TableKind::StandAloneSig,
					MetadataTokenKind::StandAloneSig,
					token.index(),
				)?;
				match &image.standalone_sigs[sig as usize] {
					StandAloneSigDef::Locals(locals) => locals.clone(),
					StandAloneSigDef::Method(_) => {
						return Err(Error::MalformedImage(
							"body locals token is not a locals signature",
						))
					},
				}
			},
		};

		match decode_body(code, &header, &raw_clauses, locals, resolver) {
			Ok(body) => image.methods[i].body = Some(body),
			Err(Error::InvalidOpcode(_)) if options.lenient_bodies => {
				#[cfg(feature = "tracing")]
				tracing::debug!(row = i + 1, "skipping body with invalid opcode");
			},
			Err(err) => return Err(err),
		}
	}
	Ok(())
}
