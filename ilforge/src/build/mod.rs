//! The build pipeline: turns an [`Image`] into a byte-exact PE file.
//!
//! Three strictly ordered phases:
//! 1. *Enumeration*: row numbers are assigned from the model walk, with
//!    member rows grouped per class. MemberRef and GenericParam rows are
//!    pre-ordered because other rows and IL tokens refer to them.
//! 2. *Sizing*: bodies are encoded (interning user strings), every string,
//!    blob and GUID is interned, and the heap widths become final.
//! 3. *Sort & emit*: the remaining mandated sorts run, rows serialise with
//!    final index widths, and the PE envelope wraps the result.
//!
//! Emission borrows the image immutably, so the model is frozen for the
//! whole build by construction. Output is deterministic: structurally equal
//! models produce identical bytes.

use fxhash::FxHashMap;

use crate::build::heaps::{BlobsBuilder, GuidsBuilder, StringsBuilder, UserStringsBuilder};
use crate::errors::{Error, Result};
use crate::raw::assembly::{write_metadata_root, CliHeader, RUNTIME_FLAG_IL_ONLY};
use crate::raw::heaps::table as tables;
use crate::raw::heaps::table::{TableKind, Tables, TablesStream};
use crate::raw::heaps::GuidIndex;
use crate::raw::indices::coded_index::{
	CustomAttributeType, HasConstant, HasCustomAttribute, HasDeclSecurity, HasFieldMarshal,
	HasSemantics, Implementation, MemberForwarded, MemberRefParent, MethodDefOrRef,
	ResolutionScope, TypeDefOrRef, TypeOrMethodDef,
};
use crate::raw::indices::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::raw::indices::sizes::{
	EventIndex, FieldIndex, GenericParamIndex, MethodDefIndex, ModuleRefIndex, ParamIndex,
	PropertyIndex, TypeDefIndex,
};
use crate::raw::pe::{self, DataDirectory, TEXT_RVA};
use crate::structured::body::{user_string_token, TokenSink};
use crate::structured::image::Image;
use crate::structured::members::*;
use crate::structured::signatures::{encode_type_handle, locals_to_blob, method_spec_to_blob};
use crate::structured::types::*;
use crate::utilities::round_to_multiple_of;

pub(crate) mod heaps;

/// Space reserved for a strong-name signature when the assembly carries a
/// public key.
const STRONG_NAME_RESERVATION: u32 = 128;

/// Unpacks a coded-index encoding that cannot miss: every row number comes
/// from the numbering pass and every target table is a member of the coded
/// space by construction. Routing the packs through here keeps that
/// invariant written down in one place.
fn packed<T>(index: Option<T>) -> T {
	index.expect("coded-index target fixed during row numbering")
}

/// Final row numbers for the entities whose rows are not simply their arena
/// position: members are grouped per class, MemberRef and GenericParam rows
/// follow their mandated order.
struct Rows {
	field: Vec<u32>,
	method: Vec<u32>,
	property: Vec<u32>,
	event: Vec<u32>,
	member_ref: Vec<u32>,
	param: FxHashMap<(u32, u16), u32>,
	generic_param: FxHashMap<(GenericParamOwner, u16), u32>,
	ordered_fields: Vec<FieldHandle>,
	ordered_methods: Vec<MethodHandle>,
	ordered_properties: Vec<PropertyHandle>,
	ordered_events: Vec<EventHandle>,
	ordered_member_refs: Vec<MemberRefHandle>,
	ordered_generic_params: Vec<(GenericParamOwner, usize)>,
}

impl Rows {
	fn method_def_or_ref(&self, method: MethodRef) -> MethodDefOrRef {
		match method {
			MethodRef::Def(h) => {
				packed(MethodDefOrRef::encode(TableKind::MethodDef, self.method[h.index()]))
			},
			MethodRef::Ref(h) => {
				packed(MethodDefOrRef::encode(TableKind::MemberRef, self.member_ref[h.index()]))
			},
		}
	}
}

fn number_rows(image: &Image) -> Rows {
	let mut field = vec![0u32; image.fields.len()];
	let mut method = vec![0u32; image.methods.len()];
	let mut property = vec![0u32; image.properties.len()];
	let mut event = vec![0u32; image.events.len()];
	let mut ordered_fields = Vec::with_capacity(image.fields.len());
	let mut ordered_methods = Vec::with_capacity(image.methods.len());
	let mut ordered_properties = Vec::with_capacity(image.properties.len());
	let mut ordered_events = Vec::with_capacity(image.events.len());

	for class in image.classes() {
		let class = image.class(class);
		for &handle in class.fields() {
			field[handle.index()] = ordered_fields.len() as u32 + 1;
			ordered_fields.push(handle);
		}
		for &handle in class.methods() {
			method[handle.index()] = ordered_methods.len() as u32 + 1;
			ordered_methods.push(handle);
		}
		for &handle in class.properties() {
			property[handle.index()] = ordered_properties.len() as u32 + 1;
			ordered_properties.push(handle);
		}
		for &handle in class.events() {
			event[handle.index()] = ordered_events.len() as u32 + 1;
			ordered_events.push(handle);
		}
	}

	let mut param = FxHashMap::default();
	let mut next_param = 1u32;
	for &handle in &ordered_methods {
		for index in 0..image.method(handle).params.len() {
			param.insert((handle.0, index as u16), next_param);
			next_param += 1;
		}
	}

	// MemberRef rows are referenced from IL tokens and other rows, so their
	// mandated order (by parent, insertion order breaking ties) is fixed
	// here, before anything records a row number.
	let member_ref_parent = |parent: MemberRefParentRef| -> u32 {
		let (kind, row) = match parent {
			MemberRefParentRef::ClassDef(h) => (TableKind::TypeDef, h.row()),
			MemberRefParentRef::ClassRef(h) => (TableKind::TypeRef, h.row()),
			MemberRefParentRef::ModuleRef(h) => (TableKind::ModuleRef, h.row()),
			MemberRefParentRef::Method(h) => (TableKind::MethodDef, method[h.index()]),
			MemberRefParentRef::TypeSpec(h) => (TableKind::TypeSpec, h.row()),
		};
		packed(MemberRefParent::encode(kind, row)).raw()
	};
	let mut ordered_member_refs: Vec<MemberRefHandle> =
		image.member_refs().map(|(handle, _)| handle).collect();
	ordered_member_refs
		.sort_by_key(|h| (member_ref_parent(image.member_refs[h.index()].parent), h.0));
	let mut member_ref = vec![0u32; ordered_member_refs.len()];
	for (i, handle) in ordered_member_refs.iter().enumerate() {
		member_ref[handle.index()] = i as u32 + 1;
	}

	// GenericParam rows sort by owner coded value then number; constraints
	// and attributes reference them by row.
	let mut generic_entries: Vec<(u32, u16, GenericParamOwner, usize)> = vec![];
	for class_handle in image.classes() {
		let owner = packed(TypeOrMethodDef::encode(TableKind::TypeDef, class_handle.row())).raw();
		for (i, gp) in image.class(class_handle).generic_params.iter().enumerate() {
			generic_entries.push((owner, gp.number, GenericParamOwner::Class(class_handle), i));
		}
	}
	for &handle in &ordered_methods {
		let owner =
			packed(TypeOrMethodDef::encode(TableKind::MethodDef, method[handle.index()])).raw();
		for (i, gp) in image.method(handle).generic_params.iter().enumerate() {
			generic_entries.push((owner, gp.number, GenericParamOwner::Method(handle), i));
		}
	}
	generic_entries.sort_by_key(|(owner, number, _, _)| (*owner, *number));
	let mut generic_param = FxHashMap::default();
	let mut ordered_generic_params = Vec::with_capacity(generic_entries.len());
	for (i, (_, number, owner, list_index)) in generic_entries.into_iter().enumerate() {
		generic_param.insert((owner, number), i as u32 + 1);
		ordered_generic_params.push((owner, list_index));
	}

	Rows {
		field,
		method,
		property,
		event,
		member_ref,
		param,
		generic_param,
		ordered_fields,
		ordered_methods,
		ordered_properties,
		ordered_events,
		ordered_member_refs,
		ordered_generic_params,
	}
}

/// Token production for IL serialisation; interning user strings as bodies
/// are written.
struct BuildTokens<'l> {
	rows: &'l Rows,
	us: &'l mut UserStringsBuilder,
}

impl TokenSink for BuildTokens<'_> {
	fn type_token(&mut self, handle: TypeHandle) -> u32 {
		let (kind, row) = match handle {
			TypeHandle::Def(h) => (MetadataTokenKind::TypeDef, h.row()),
			TypeHandle::Ref(h) => (MetadataTokenKind::TypeRef, h.row()),
			TypeHandle::Spec(h) => (MetadataTokenKind::TypeSpec, h.row()),
		};
		MetadataToken::new(kind, row).raw()
	}

	fn field_token(&mut self, item: &FieldItem) -> Result<u32> {
		let (kind, row) = match item {
			FieldItem::Def(h) => (MetadataTokenKind::Field, self.rows.field[h.index()]),
			FieldItem::Ref(h) => (MetadataTokenKind::MemberRef, self.rows.member_ref[h.index()]),
		};
		Ok(MetadataToken::new(kind, row).raw())
	}

	fn method_token(&mut self, item: &MethodItem) -> Result<u32> {
		let (kind, row) = match item {
			MethodItem::Def(h) => (MetadataTokenKind::MethodDef, self.rows.method[h.index()]),
			MethodItem::Ref(h) => (MetadataTokenKind::MemberRef, self.rows.member_ref[h.index()]),
			MethodItem::Spec(h) => (MetadataTokenKind::MethodSpec, h.row()),
		};
		Ok(MetadataToken::new(kind, row).raw())
	}

	fn code_token(&mut self, item: &CodeItem) -> Result<u32> {
		match item {
			CodeItem::Type(handle) => Ok(self.type_token(*handle)),
			CodeItem::Field(item) => self.field_token(item),
			CodeItem::Method(item) => self.method_token(item),
		}
	}

	fn call_site_token(&mut self, handle: StandAloneSigHandle) -> u32 {
		MetadataToken::new(MetadataTokenKind::StandAloneSig, handle.row()).raw()
	}

	fn string_token(&mut self, value: &str) -> Result<u32> {
		Ok(user_string_token(self.us.intern(value)?))
	}
}

fn type_coded(handle: Option<TypeHandle>) -> TypeDefOrRef {
	match handle {
		None => TypeDefOrRef::NULL,
		Some(handle) => encode_type_handle(handle),
	}
}

fn implementation_coded(implementation: Option<ImplementationRef>) -> Implementation {
	let (kind, row) = match implementation {
		None => return Implementation::NULL,
		Some(ImplementationRef::File(h)) => (TableKind::File, h.row()),
		Some(ImplementationRef::AssemblyRef(h)) => (TableKind::AssemblyRef, h.row()),
		Some(ImplementationRef::ExportedType(h)) => (TableKind::ExportedType, h.row()),
	};
	packed(Implementation::encode(kind, row))
}

fn attribute_parent(owner: &AttributeOwner, rows: &Rows) -> Result<HasCustomAttribute> {
	let (kind, row) = match owner {
		AttributeOwner::Assembly => (TableKind::Assembly, 1),
		AttributeOwner::Module => (TableKind::Module, 1),
		AttributeOwner::Class(h) => (TableKind::TypeDef, h.row()),
		AttributeOwner::ClassRef(h) => (TableKind::TypeRef, h.row()),
		AttributeOwner::TypeSpec(h) => (TableKind::TypeSpec, h.row()),
		AttributeOwner::Field(h) => (TableKind::Field, rows.field[h.index()]),
		AttributeOwner::Method(h) => (TableKind::MethodDef, rows.method[h.index()]),
		AttributeOwner::Param(method, index) => {
			let row = rows
				.param
				.get(&(method.0, *index))
				.ok_or(Error::ContractViolation("attribute on unknown parameter"))?;
			(TableKind::Param, *row)
		},
		AttributeOwner::Property(h) => (TableKind::Property, rows.property[h.index()]),
		AttributeOwner::Event(h) => (TableKind::Event, rows.event[h.index()]),
		AttributeOwner::GenericParam(owner, number) => {
			let row = rows
				.generic_param
				.get(&(*owner, *number))
				.ok_or(Error::ContractViolation("attribute on unknown generic parameter"))?;
			(TableKind::GenericParam, *row)
		},
		AttributeOwner::MemberRef(h) => (TableKind::MemberRef, rows.member_ref[h.index()]),
		AttributeOwner::AssemblyRef(h) => (TableKind::AssemblyRef, h.row()),
		AttributeOwner::ModuleRef(h) => (TableKind::ModuleRef, h.row()),
		AttributeOwner::File(h) => (TableKind::File, h.row()),
		AttributeOwner::ExportedType(h) => (TableKind::ExportedType, h.row()),
		AttributeOwner::ManifestResource(h) => (TableKind::ManifestResource, h.row()),
		AttributeOwner::StandAloneSig(h) => (TableKind::StandAloneSig, h.row()),
		AttributeOwner::MethodSpec(h) => (TableKind::MethodSpec, h.row()),
	};
	Ok(packed(HasCustomAttribute::encode(kind, row)))
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub(crate) fn emit(image: &Image) -> Result<Vec<u8>> {
	let rows = number_rows(image);
	if let Some(entry) = image.entry_point {
		if rows.method[entry.index()] == 0 {
			return Err(Error::ContractViolation("entry point method not owned by a class"));
		}
	}

	let mut strings = StringsBuilder::new();
	let mut blobs = BlobsBuilder::new();
	let mut us = UserStringsBuilder::new();
	let mut guids = GuidsBuilder::new();

	// StandAloneSig blobs: the interned rows first, then any local-variable
	// signatures the bodies need.
	let mut standalone_blobs: Vec<Vec<u8>> = vec![];
	let mut standalone_rows: FxHashMap<Vec<u8>, u32> = FxHashMap::default();
	for sig in &image.standalone_sigs {
		let blob = match sig {
			StandAloneSigDef::Locals(locals) => locals_to_blob(locals)?,
			StandAloneSigDef::Method(sig) => sig.to_blob()?,
		};
		standalone_rows.insert(blob.clone(), standalone_blobs.len() as u32 + 1);
		standalone_blobs.push(blob);
	}

	// Bodies. Fat bodies are 4-byte aligned within the body region, which
	// is itself 4-byte aligned in the image.
	let mut bodies = vec![];
	let mut body_offsets: Vec<Option<u32>> = vec![None; image.methods.len()];
	for &handle in &rows.ordered_methods {
		let method = image.method(handle);
		let Some(body) = &method.body else {
			continue;
		};
		let local_var_token = match body.locals.is_empty() {
			true => 0,
			false => {
				let blob = locals_to_blob(&body.locals)?;
				let row = match standalone_rows.get(&blob) {
					Some(row) => *row,
					None => {
						let row = standalone_blobs.len() as u32 + 1;
						standalone_rows.insert(blob.clone(), row);
						standalone_blobs.push(blob);
						row
					},
				};
				MetadataToken::new(MetadataTokenKind::StandAloneSig, row).raw()
			},
		};
		let mut tokens = BuildTokens { rows: &rows, us: &mut us };
		let bytes = body.encode(local_var_token, &mut tokens)?;
		if bytes[0] & 0x3 == 0x3 {
			bodies.resize(round_to_multiple_of::<4>(bodies.len()), 0);
		}
		body_offsets[handle.index()] = Some(bodies.len() as u32);
		bodies.extend_from_slice(&bytes);
	}

	// Field initial data, 8-byte aligned per blob.
	let mut field_data = vec![];
	let mut field_data_offsets: Vec<Option<u32>> = vec![None; image.fields.len()];
	for &handle in &rows.ordered_fields {
		if let Some(data) = &image.field(handle).rva_data {
			field_data.resize(round_to_multiple_of::<8>(field_data.len()), 0);
			field_data_offsets[handle.index()] = Some(field_data.len() as u32);
			field_data.extend_from_slice(data);
		}
	}

	// Layout of the single .text section; every RVA is now computable.
	let strong_name_size = match image.assembly.as_ref() {
		Some(assembly) if !assembly.public_key.is_empty() => STRONG_NAME_RESERVATION,
		_ => 0,
	};
	let bodies_offset = round_to_multiple_of::<4>((72 + strong_name_size) as usize) as u32;
	let field_data_offset =
		round_to_multiple_of::<8>((bodies_offset + bodies.len() as u32) as usize) as u32;
	let metadata_offset =
		round_to_multiple_of::<4>((field_data_offset + field_data.len() as u32) as usize) as u32;
	let bodies_rva = TEXT_RVA + bodies_offset;
	let field_data_rva = TEXT_RVA + field_data_offset;
	let metadata_rva = TEXT_RVA + metadata_offset;

	// Tables.
	let mut md = Tables::default();

	md.module.push(tables::Module {
		generation: image.module.generation,
		name: strings.intern(&image.module.name),
		mv_id: guids.intern(image.module.mvid),
		enc_id: GuidIndex(0),
		enc_base_id: GuidIndex(0),
	});

	if let Some(assembly) = &image.assembly {
		md.assembly.push(tables::Assembly {
			hash_algorithm: assembly.hash_algorithm,
			major_version: assembly.version.0,
			minor_version: assembly.version.1,
			build_number: assembly.version.2,
			revision_number: assembly.version.3,
			flags: assembly.flags,
			public_key: blobs.intern(&assembly.public_key)?,
			name: strings.intern(&assembly.name),
			culture: strings.intern(&assembly.culture),
		});
	}

	for assembly_ref in &image.assembly_refs {
		md.assembly_ref.push(tables::AssemblyRef {
			major_version: assembly_ref.version.0,
			minor_version: assembly_ref.version.1,
			build_number: assembly_ref.version.2,
			revision_number: assembly_ref.version.3,
			flags: assembly_ref.flags,
			public_key_or_token: blobs.intern(&assembly_ref.public_key_or_token)?,
			name: strings.intern(&assembly_ref.name),
			culture: strings.intern(&assembly_ref.culture),
			hash_value: blobs.intern(&assembly_ref.hash_value)?,
		});
	}

	for module_ref in &image.module_refs {
		md.module_ref.push(tables::ModuleRef {
			name: strings.intern(&module_ref.name),
		});
	}

	for class_ref in &image.class_refs {
		let (kind, row) = match class_ref.scope {
			ResolutionScopeRef::ModuleRef(h) => (TableKind::ModuleRef, h.row()),
			ResolutionScopeRef::AssemblyRef(h) => (TableKind::AssemblyRef, h.row()),
			ResolutionScopeRef::Nested(h) => (TableKind::TypeRef, h.row()),
		};
		md.type_ref.push(tables::TypeRef {
			resolution_scope: packed(ResolutionScope::encode(kind, row)),
			type_name: strings.intern(&class_ref.name),
			type_namespace: strings.intern(&class_ref.namespace),
		});
	}

	let mut next_field = 1u32;
	let mut next_method = 1u32;
	for handle in image.classes() {
		let class = image.class(handle);
		md.type_def.push(tables::TypeDef {
			flags: class.flags,
			type_name: strings.intern(&class.name),
			type_namespace: strings.intern(&class.namespace),
			extends: type_coded(class.extends),
			field_list: FieldIndex(next_field),
			method_list: MethodDefIndex(next_method),
		});
		next_field += class.fields().len() as u32;
		next_method += class.methods().len() as u32;

		for interface in &class.interfaces {
			md.interface_impl.push(tables::InterfaceImpl {
				class: TypeDefIndex(handle.row()),
				interface: encode_type_handle(*interface),
			});
		}
		if let Some(layout) = class.layout {
			md.class_layout.push(tables::ClassLayout {
				packing_size: layout.packing_size,
				class_size: layout.class_size,
				parent: TypeDefIndex(handle.row()),
			});
		}
		if let Some(enclosing) = class.enclosing() {
			md.nested_class.push(tables::NestedClass {
				nested_class: TypeDefIndex(handle.row()),
				enclosing_class: TypeDefIndex(enclosing.row()),
			});
		}
		for (body, declaration) in &class.overrides {
			md.method_impl.push(tables::MethodImpl {
				class: TypeDefIndex(handle.row()),
				body: rows.method_def_or_ref(*body),
				declaration: rows.method_def_or_ref(*declaration),
			});
		}
	}

	for &handle in &rows.ordered_fields {
		let field = image.field(handle);
		let mut flags = field.flags;
		if field.constant.is_some() {
			flags |= tables::FieldAttributes::HAS_DEFAULT;
		}
		if field.marshal.is_some() {
			flags |= tables::FieldAttributes::HAS_FIELD_MARSHAL;
		}
		if field.rva_data.is_some() {
			flags |= tables::FieldAttributes::HAS_FIELD_RVA;
		}
		md.field.push(tables::Field {
			flags,
			name: strings.intern(&field.name),
			signature: blobs.intern(&field.sig.to_blob()?)?,
		});
		if let Some(offset) = field_data_offsets[handle.index()] {
			md.field_r_v_a.push(tables::FieldRVA {
				rva: field_data_rva + offset,
				field: FieldIndex(rows.field[handle.index()]),
			});
		}
		if let Some(layout_offset) = field.layout_offset {
			md.field_layout.push(tables::FieldLayout {
				offset: layout_offset,
				field: FieldIndex(rows.field[handle.index()]),
			});
		}
	}

	let mut next_param = 1u32;
	for &handle in &rows.ordered_methods {
		let method = image.method(handle);
		let mut flags = method.flags;
		if method.pinvoke.is_some() {
			flags |= tables::MethodAttributes::PINVOKE_IMPL;
		}
		let rva = match body_offsets[handle.index()] {
			Some(offset) => bodies_rva + offset,
			None => 0,
		};
		md.method_def.push(tables::MethodDef {
			rva,
			impl_flags: method.impl_flags,
			flags,
			name: strings.intern(&method.name),
			signature: blobs.intern(&method.sig.to_blob()?)?,
			param_list: ParamIndex(next_param),
		});
		next_param += method.params.len() as u32;

		for param in &method.params {
			let mut flags = param.flags;
			if param.constant.is_some() {
				flags |= tables::ParamAttributes::HAS_DEFAULT;
			}
			if param.marshal.is_some() {
				flags |= tables::ParamAttributes::HAS_FIELD_MARSHAL;
			}
			md.param.push(tables::Param {
				flags,
				sequence: param.sequence,
				name: strings.intern(&param.name),
			});
		}

		if let Some(pinvoke) = &method.pinvoke {
			md.impl_map.push(tables::ImplMap {
				flags: pinvoke.flags,
				member_forwarded: packed(MemberForwarded::encode(
					TableKind::MethodDef,
					rows.method[handle.index()],
				)),
				import_name: strings.intern(&pinvoke.import_name),
				import_scope: ModuleRefIndex(pinvoke.import_scope.row()),
			});
		}
	}

	for &handle in &rows.ordered_member_refs {
		let member_ref = &image.member_refs[handle.index()];
		let (kind, row) = match member_ref.parent {
			MemberRefParentRef::ClassDef(h) => (TableKind::TypeDef, h.row()),
			MemberRefParentRef::ClassRef(h) => (TableKind::TypeRef, h.row()),
			MemberRefParentRef::ModuleRef(h) => (TableKind::ModuleRef, h.row()),
			MemberRefParentRef::Method(h) => (TableKind::MethodDef, rows.method[h.index()]),
			MemberRefParentRef::TypeSpec(h) => (TableKind::TypeSpec, h.row()),
		};
		md.member_ref.push(tables::MemberRef {
			class: packed(MemberRefParent::encode(kind, row)),
			name: strings.intern(&member_ref.name),
			signature: blobs.intern(&member_ref.sig.to_blob()?)?,
		});
	}

	// Constants from fields, parameters and properties; the mandated
	// parent order is restored by the sort pass.
	let push_constant = |md: &mut Tables,
	                         blobs: &mut BlobsBuilder,
	                         kind: TableKind,
	                         row: u32,
	                         value: &ConstantValue|
	 -> Result<()> {
		md.constant.push(tables::Constant {
			ty: [value.elem_type(), 0],
			parent: packed(HasConstant::encode(kind, row)),
			value: blobs.intern(&value.to_blob())?,
		});
		Ok(())
	};
	for &handle in &rows.ordered_fields {
		if let Some(value) = &image.field(handle).constant {
			push_constant(&mut md, &mut blobs, TableKind::Field, rows.field[handle.index()], value)?;
		}
	}
	for &handle in &rows.ordered_methods {
		for (index, param) in image.method(handle).params.iter().enumerate() {
			if let Some(value) = &param.constant {
				let row = rows.param[&(handle.0, index as u16)];
				push_constant(&mut md, &mut blobs, TableKind::Param, row, value)?;
			}
			if let Some(marshal) = &param.marshal {
				let row = rows.param[&(handle.0, index as u16)];
				md.field_marshal.push(tables::FieldMarshal {
					parent: packed(HasFieldMarshal::encode(TableKind::Param, row)),
					native_type: blobs.intern(marshal)?,
				});
			}
		}
	}
	for &handle in &rows.ordered_fields {
		if let Some(marshal) = &image.field(handle).marshal {
			md.field_marshal.push(tables::FieldMarshal {
				parent: packed(HasFieldMarshal::encode(
					TableKind::Field,
					rows.field[handle.index()],
				)),
				native_type: blobs.intern(marshal)?,
			});
		}
	}

	for (owner, row) in &image.decl_security {
		let (kind, parent_row) = match owner {
			SecurityOwner::Assembly => (TableKind::Assembly, 1),
			SecurityOwner::Class(h) => (TableKind::TypeDef, h.row()),
			SecurityOwner::Method(h) => (TableKind::MethodDef, rows.method[h.index()]),
		};
		md.decl_security.push(tables::DeclSecurity {
			action: row.action,
			parent: packed(HasDeclSecurity::encode(kind, parent_row)),
			permission_set: blobs.intern(&row.permission_set)?,
		});
	}

	for blob in &standalone_blobs {
		md.stand_alone_sig.push(tables::StandAloneSig {
			signature: blobs.intern(blob)?,
		});
	}

	// Property and event maps: one row per class that declares any.
	for handle in image.classes() {
		let class = image.class(handle);
		if let Some(first) = class.properties().first() {
			md.property_map.push(tables::PropertyMap {
				parent: TypeDefIndex(handle.row()),
				property_list: PropertyIndex(rows.property[first.index()]),
			});
		}
		if let Some(first) = class.events().first() {
			md.event_map.push(tables::EventMap {
				parent: TypeDefIndex(handle.row()),
				event_list: EventIndex(rows.event[first.index()]),
			});
		}
	}

	for &handle in &rows.ordered_properties {
		let property = image.property(handle);
		let mut flags = property.flags;
		if property.constant.is_some() {
			flags |= tables::PropertyAttributes::HAS_DEFAULT;
		}
		md.property.push(tables::Property {
			flags,
			name: strings.intern(&property.name),
			ty: blobs.intern(&property.sig.to_blob()?)?,
		});
		if let Some(value) = &property.constant {
			push_constant(
				&mut md,
				&mut blobs,
				TableKind::Property,
				rows.property[handle.index()],
				value,
			)?;
		}
		for (semantics, method) in &property.accessors {
			md.method_semantics.push(tables::MethodSemantics {
				flags: *semantics,
				method: MethodDefIndex(rows.method[method.index()]),
				association: packed(HasSemantics::encode(
					TableKind::Property,
					rows.property[handle.index()],
				)),
			});
		}
	}

	for &handle in &rows.ordered_events {
		let event = image.event(handle);
		md.event.push(tables::Event {
			flags: event.flags,
			name: strings.intern(&event.name),
			event_type: type_coded(event.event_type),
		});
		for (semantics, method) in &event.accessors {
			md.method_semantics.push(tables::MethodSemantics {
				flags: *semantics,
				method: MethodDefIndex(rows.method[method.index()]),
				association: packed(HasSemantics::encode(
					TableKind::Event,
					rows.event[handle.index()],
				)),
			});
		}
	}

	for sig in &image.type_specs {
		let mut blob = vec![];
		sig.encode(&mut blob)?;
		md.type_spec.push(tables::TypeSpec {
			signature: blobs.intern(&blob)?,
		});
	}

	for spec in &image.method_specs {
		md.method_spec.push(tables::MethodSpec {
			method: rows.method_def_or_ref(spec.method),
			instantiation: blobs.intern(&method_spec_to_blob(&spec.args)?)?,
		});
	}

	for (owner, list_index) in &rows.ordered_generic_params {
		let (gp, owner_coded) = match owner {
			GenericParamOwner::Class(h) => (
				&image.class(*h).generic_params[*list_index],
				packed(TypeOrMethodDef::encode(TableKind::TypeDef, h.row())),
			),
			GenericParamOwner::Method(h) => (
				&image.method(*h).generic_params[*list_index],
				packed(TypeOrMethodDef::encode(TableKind::MethodDef, rows.method[h.index()])),
			),
		};
		md.generic_param.push(tables::GenericParam {
			number: gp.number,
			flags: gp.flags,
			owner: owner_coded,
			name: strings.intern(&gp.name),
		});
	}
	for (i, (owner, list_index)) in rows.ordered_generic_params.iter().enumerate() {
		let gp = match owner {
			GenericParamOwner::Class(h) => &image.class(*h).generic_params[*list_index],
			GenericParamOwner::Method(h) => &image.method(*h).generic_params[*list_index],
		};
		for constraint in &gp.constraints {
			md.generic_param_constraint.push(tables::GenericParamConstraint {
				owner: GenericParamIndex(i as u32 + 1),
				constraint: encode_type_handle(*constraint),
			});
		}
	}

	for file in &image.files {
		md.file.push(tables::File {
			flags: file.flags,
			name: strings.intern(&file.name),
			hash_value: blobs.intern(&file.hash_value)?,
		});
	}

	for exported in &image.exported_types {
		md.exported_type.push(tables::ExportedType {
			flags: exported.flags,
			type_def_id: exported.type_def_id,
			type_name: strings.intern(&exported.name),
			type_namespace: strings.intern(&exported.namespace),
			implementation: implementation_coded(Some(exported.implementation)),
		});
	}

	for resource in &image.resources {
		md.manifest_resource.push(tables::ManifestResource {
			offset: resource.offset,
			flags: resource.flags,
			name: strings.intern(&resource.name),
			implementation: implementation_coded(resource.implementation),
		});
	}

	for (owner, attribute) in &image.custom_attributes {
		md.custom_attribute.push(tables::CustomAttribute {
			parent: attribute_parent(owner, &rows)?,
			ty: match attribute.ctor {
				MethodRef::Def(h) => packed(CustomAttributeType::encode(
					TableKind::MethodDef,
					rows.method[h.index()],
				)),
				MethodRef::Ref(h) => packed(CustomAttributeType::encode(
					TableKind::MemberRef,
					rows.member_ref[h.index()],
				)),
			},
			value: blobs.intern(&attribute.value)?,
		});
	}

	md.sort_required();

	// Sizing is final: heap widths derive from the finished heaps, index
	// widths from the row counts inside TablesStream::write.
	let mut heap_sizes = 0u8;
	if strings.len() >= 0x10000 {
		heap_sizes |= crate::raw::indices::sizes::HEAP_WIDE_STRING;
	}
	let guid_bytes = guids.into_bytes();
	if guid_bytes.len() >= 0x10000 {
		heap_sizes |= crate::raw::indices::sizes::HEAP_WIDE_GUID;
	}
	if blobs.len() >= 0x10000 {
		heap_sizes |= crate::raw::indices::sizes::HEAP_WIDE_BLOB;
	}

	let mut tables_stream = vec![];
	TablesStream::write(&mut tables_stream, &md, heap_sizes);

	let string_bytes = strings.into_bytes();
	let us_bytes = us.into_bytes();
	let blob_bytes = blobs.into_bytes();
	let mut metadata = vec![];
	write_metadata_root(
		&mut metadata,
		&[
			("#~", &tables_stream),
			("#Strings", &string_bytes),
			("#US", &us_bytes),
			("#GUID", &guid_bytes),
			("#Blob", &blob_bytes),
		],
	);

	// The .text payload: CLI header, strong-name reservation, bodies,
	// field data, metadata root.
	let entry_point_token = match image.entry_point {
		Some(handle) => {
			MetadataToken::new(MetadataTokenKind::MethodDef, rows.method[handle.index()]).raw()
		},
		None => 0,
	};
	let cli_header = CliHeader {
		major_runtime_version: 2,
		minor_runtime_version: 5,
		metadata: DataDirectory {
			virtual_address: metadata_rva,
			size: metadata.len() as u32,
		},
		flags: RUNTIME_FLAG_IL_ONLY,
		entry_point_token,
		resources: DataDirectory::default(),
		strong_name_signature: match strong_name_size {
			0 => DataDirectory::default(),
			size => DataDirectory {
				virtual_address: TEXT_RVA + 72,
				size,
			},
		},
	};

	let mut text = vec![];
	crate::utilities::ToByteStream::write(&cli_header, &mut text, &());
	text.resize(bodies_offset as usize, 0);
	text.extend_from_slice(&bodies);
	text.resize(field_data_offset as usize, 0);
	text.extend_from_slice(&field_data);
	text.resize(metadata_offset as usize, 0);
	text.extend_from_slice(&metadata);

	Ok(pe::write_image(&text, image.entry_point.is_none()))
}
