//! End-to-end scenarios: build a model, emit a PE image, load it back, and
//! check that rows, heaps, signatures and bodies survived.

use std::io::Cursor;

use similar_asserts::assert_eq;

use ilforge::raw::assembly::{CliHeader, MetadataRoot};
use ilforge::raw::heaps::table::TablesStream;
use ilforge::raw::pe::PeFile;
use ilforge::raw::FromByteStream;
use ilforge::{
	AssemblyDef, AssemblyRefDef, EhClause, EhKind, GenericParamDef, Image, Instruction,
	LoadOptions, MemberRefParentRef, MemberRefSig, MethodAttributes, MethodBody, MethodDef,
	MethodItem, MethodSig, ResolutionScopeRef, TypeAttributes, TypeHandle, TypeSig,
};

fn load(bytes: &[u8]) -> Image {
	Image::read(bytes, &LoadOptions::default()).unwrap()
}

fn metadata_root(bytes: &[u8]) -> MetadataRoot<'_> {
	let pe = PeFile::read(bytes).unwrap();
	let dir = pe.cli_header_directory().unwrap();
	let cli_bytes = pe.resolve_rva(dir.virtual_address).unwrap();
	let cli = CliHeader::read(&mut Cursor::new(cli_bytes), &()).unwrap();
	let md = pe.resolve_rva(cli.metadata.virtual_address).unwrap();
	MetadataRoot::read(&md[..cli.metadata.size as usize]).unwrap()
}

fn tables(bytes: &[u8]) -> TablesStream {
	TablesStream::read(metadata_root(bytes).stream("#~").unwrap()).unwrap()
}

#[test]
fn empty_assembly_round_trips() {
	let mut image = Image::new("Empty.dll");
	image.set_assembly(AssemblyDef::new("Empty", (1, 0, 0, 0)));

	let bytes = image.write().unwrap();
	let loaded = load(&bytes);

	let assembly = loaded.assembly().unwrap();
	assert_eq!(assembly.name, "Empty");
	assert_eq!(assembly.version, (1, 0, 0, 0));
	assert_eq!(loaded.module().name, "Empty.dll");
	assert_eq!(loaded.assembly_refs().count(), 0);
	// Only the <Module> pseudo-class.
	assert_eq!(loaded.classes().count(), 1);

	let t = tables(&bytes);
	assert_eq!(t.tables.module.len(), 1);
	assert_eq!(t.tables.assembly.len(), 1);
	assert!(t.tables.assembly_ref.is_empty());
}

fn build_hello_world() -> Image {
	let mut image = Image::new("Hello.dll");
	image.set_assembly(AssemblyDef::new("Hello", (1, 0, 0, 0)));

	let mscorlib = image.add_assembly_ref(AssemblyRefDef::new("mscorlib", (4, 0, 0, 0)));
	let object = image.add_class_ref(
		ResolutionScopeRef::AssemblyRef(mscorlib),
		"System",
		"Object",
	);
	let console = image.add_class_ref(
		ResolutionScopeRef::AssemblyRef(mscorlib),
		"System",
		"Console",
	);
	let write_line = image.member_ref(
		MemberRefParentRef::ClassRef(console),
		"WriteLine",
		MemberRefSig::Method(MethodSig::static_method(TypeSig::Void, vec![TypeSig::String])),
	);

	let program = image.add_class(
		"Hello",
		"Program",
		TypeAttributes::PUBLIC,
		Some(TypeHandle::Ref(object)),
	);
	let main = image
		.add_method(
			program,
			MethodDef::new(
				"Main",
				MethodAttributes::PUBLIC | MethodAttributes::STATIC,
				MethodSig::static_method(TypeSig::Void, vec![]),
			),
		)
		.unwrap();

	let mut body = MethodBody::new();
	body.instructions = vec![
		Instruction::ldstr("hi".into()),
		Instruction::call(MethodItem::Ref(write_line)),
		Instruction::ret,
	];
	image.method_mut(main).body = Some(body);
	image.set_entry_point(main);
	image
}

#[test]
fn hello_world_round_trips() {
	let bytes = build_hello_world().write().unwrap();
	let loaded = load(&bytes);

	// The user-string heap holds "hi" exactly once.
	let root = metadata_root(&bytes);
	let us = root.stream("#US").unwrap();
	let entry = [5u8, b'h', 0, b'i', 0, 0];
	assert_eq!(us.windows(entry.len()).filter(|w| *w == entry).count(), 1);

	// Exactly one MemberRef row, for WriteLine(string).
	let member_refs: Vec<_> = loaded.member_refs().collect();
	assert_eq!(member_refs.len(), 1);
	assert_eq!(member_refs[0].1.name, "WriteLine");
	let MemberRefSig::Method(sig) = &member_refs[0].1.sig else {
		panic!("expected a method signature");
	};
	assert_eq!(sig.params, vec![TypeSig::String]);

	// The entry point token leads back to Main, and the body survived.
	let main = loaded.entry_point().unwrap();
	let method = loaded.method(main);
	assert_eq!(method.name, "Main");
	let body = method.body.as_ref().unwrap();
	assert_eq!(body.instructions.len(), 3);
	assert!(matches!(&body.instructions[0], Instruction::ldstr(s) if s == "hi"));
	assert!(matches!(&body.instructions[1], Instruction::call(MethodItem::Ref(_))));
	assert!(matches!(&body.instructions[2], Instruction::ret));

	let program = loaded.find_class("Hello", "Program").unwrap();
	assert_eq!(loaded.class_full_name(program), "Hello.Program");
	let extends = loaded.class(program).extends.unwrap();
	let TypeHandle::Ref(object) = extends else {
		panic!("expected a TypeRef extends");
	};
	assert_eq!(loaded.class_ref(object).name, "Object");
}

#[test]
fn generic_class_round_trips() {
	let mut image = Image::new("Collections.dll");
	image.set_assembly(AssemblyDef::new("Collections", (1, 0, 0, 0)));
	let list = image.add_class("Collections", "List`1", TypeAttributes::PUBLIC, None);
	image
		.class_mut(list)
		.generic_params
		.push(GenericParamDef::new(0, "T"));
	image
		.add_method(
			list,
			MethodDef::new(
				"Add",
				MethodAttributes::PUBLIC,
				MethodSig::instance_method(TypeSig::Void, vec![TypeSig::Var(0)]),
			),
		)
		.unwrap();

	let bytes = image.write().unwrap();
	let loaded = load(&bytes);

	let list = loaded.find_class("Collections", "List`1").unwrap();
	let params = &loaded.class(list).generic_params;
	assert_eq!(params.len(), 1);
	assert_eq!(params[0].name, "T");
	assert_eq!(params[0].number, 0);

	let add = loaded.find_method(list, "Add").unwrap();
	assert_eq!(loaded.method(add).sig.params, vec![TypeSig::Var(0)]);

	let t = tables(&bytes);
	assert_eq!(t.tables.generic_param.len(), 1);
	assert_eq!(t.tables.generic_param[0].number, 0);
}

#[test]
fn exception_handlers_round_trip() {
	let mut image = Image::new("Handlers.dll");
	image.set_assembly(AssemblyDef::new("Handlers", (1, 0, 0, 0)));
	let mscorlib = image.add_assembly_ref(AssemblyRefDef::new("mscorlib", (4, 0, 0, 0)));
	let exception = image.add_class_ref(
		ResolutionScopeRef::AssemblyRef(mscorlib),
		"System",
		"Exception",
	);

	let class = image.add_class("Handlers", "C", TypeAttributes::PUBLIC, None);
	let method = image
		.add_method(
			class,
			MethodDef::new(
				"Guarded",
				MethodAttributes::PUBLIC | MethodAttributes::STATIC,
				MethodSig::static_method(TypeSig::Void, vec![]),
			),
		)
		.unwrap();

	let mut body = MethodBody::new();
	let done = body.define_label();
	let try_start = body.define_label();
	let try_end = body.define_label();
	let catch_end = body.define_label();
	let finally_end = body.define_label();

	body.bind(try_start);
	body.instructions.push(Instruction::nop);
	body.instructions.push(Instruction::leave(done));
	body.bind(try_end);
	body.instructions.push(Instruction::pop);
	body.instructions.push(Instruction::leave(done));
	body.bind(catch_end);
	body.instructions.push(Instruction::endfinally);
	body.bind(finally_end);
	body.bind(done);
	body.instructions.push(Instruction::ret);

	// A catch and a finally over the same protected range, in that order.
	body.eh_clauses.push(EhClause {
		try_start,
		try_end,
		handler_start: try_end,
		handler_end: catch_end,
		kind: EhKind::Exception(TypeHandle::Ref(exception)),
	});
	body.eh_clauses.push(EhClause {
		try_start,
		try_end,
		handler_start: catch_end,
		handler_end: finally_end,
		kind: EhKind::Finally,
	});
	image.method_mut(method).body = Some(body);

	let bytes = image.write().unwrap();
	let loaded = load(&bytes);

	let class = loaded.find_class("Handlers", "C").unwrap();
	let method = loaded.find_method(class, "Guarded").unwrap();
	let body = loaded.method(method).body.as_ref().unwrap();

	assert_eq!(body.eh_clauses.len(), 2);
	let catch = &body.eh_clauses[0];
	let finally = &body.eh_clauses[1];
	assert!(matches!(
		&catch.kind,
		EhKind::Exception(TypeHandle::Ref(h)) if loaded.class_ref(*h).name == "Exception"
	));
	assert!(matches!(finally.kind, EhKind::Finally));

	// Same try range, correct handler boundaries.
	assert_eq!(body.label_target(catch.try_start), Some(0));
	assert_eq!(body.label_target(catch.try_end), Some(2));
	assert_eq!(
		body.label_target(catch.try_start),
		body.label_target(finally.try_start)
	);
	assert_eq!(body.label_target(catch.handler_start), Some(2));
	assert_eq!(body.label_target(catch.handler_end), Some(4));
	assert_eq!(body.label_target(finally.handler_start), Some(4));
	assert_eq!(body.label_target(finally.handler_end), Some(5));
}

#[test]
fn nested_types_round_trip() {
	let mut image = Image::new("Nested.dll");
	image.set_assembly(AssemblyDef::new("Nested", (1, 0, 0, 0)));
	let outer = image.add_class("", "Outer", TypeAttributes::PUBLIC, None);
	image.add_nested_class(outer, "Inner1", TypeAttributes::NESTED_PUBLIC, None);
	image.add_nested_class(outer, "Inner2", TypeAttributes::NESTED_PUBLIC, None);

	let bytes = image.write().unwrap();
	let loaded = load(&bytes);

	let outer = loaded.find_class("", "Outer").unwrap();
	assert_eq!(loaded.class(outer).name, "Outer");
	let nested = loaded.class(outer).nested();
	assert_eq!(nested.len(), 2);
	assert_eq!(loaded.class_full_name(nested[0]), "Outer+Inner1");
	assert_eq!(loaded.class_full_name(nested[1]), "Outer+Inner2");

	// The NestedClass table is sorted by nested-type row number.
	let t = tables(&bytes);
	let rows: Vec<u32> = t.tables.nested_class.iter().map(|r| r.nested_class.0).collect();
	let mut sorted = rows.clone();
	sorted.sort();
	assert_eq!(rows, sorted);
	assert_eq!(rows.len(), 2);
}

#[test]
fn wide_string_heap_round_trips() {
	let mut image = Image::new("Big.dll");
	image.set_assembly(AssemblyDef::new("Big", (1, 0, 0, 0)));
	for i in 0..2400 {
		image.add_class(
			"Big",
			format!("Class_{i:05}_abcdefghijklmnopqrstuvwxyz"),
			TypeAttributes::PUBLIC,
			None,
		);
	}

	let bytes = image.write().unwrap();

	// #Strings crossed 2^16, so the heapSizes byte must flag wide string
	// indices.
	let t = tables(&bytes);
	assert_eq!(t.heap_sizes & 0x1, 0x1);
	assert!(metadata_root(&bytes).stream("#Strings").unwrap().len() > 0x10000);

	// Every class name still resolves after a reload.
	let loaded = load(&bytes);
	assert_eq!(loaded.classes().count(), 2401);
	let last = loaded
		.find_class("Big", "Class_02399_abcdefghijklmnopqrstuvwxyz")
		.unwrap();
	assert_eq!(loaded.class(last).namespace, "Big");
}

#[test]
fn emit_is_deterministic_and_idempotent() {
	let first = build_hello_world().write().unwrap();
	let second = build_hello_world().write().unwrap();
	// Structurally equal models produce byte-identical output.
	assert_eq!(first, second);

	// emit∘load reaches a fixed point immediately.
	let reloaded = load(&first).write().unwrap();
	let reloaded_twice = load(&reloaded).write().unwrap();
	assert_eq!(reloaded, reloaded_twice);
	assert_eq!(first, reloaded);
}
