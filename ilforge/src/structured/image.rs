//! The root entity of the object model: one [`Image`] per PE file, owning
//! every entity arena and the dedup maps that keep reference rows unique.

use derivative::Derivative;
use fxhash::FxHashMap;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::raw::heaps::table::TypeAttributes;
use crate::structured::loader;
use crate::structured::members::*;
use crate::structured::signatures::MemberRefSig;
use crate::structured::types::*;

/// Options for the load pipeline.
#[derive(Debug, Default, Clone)]
pub struct LoadOptions {
	/// When set, a method body that fails to decode (for example on an
	/// unknown opcode) is dropped instead of failing the whole load.
	pub lenient_bodies: bool,
}

/// An in-memory CLI image: the queryable, mutable model that the load
/// pipeline produces and the build pipeline consumes.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Image {
	pub(crate) module: ModuleDef,
	pub(crate) assembly: Option<AssemblyDef>,
	pub(crate) entry_point: Option<MethodHandle>,
	pub(crate) assembly_refs: Vec<AssemblyRefDef>,
	pub(crate) module_refs: Vec<ModuleRefDef>,
	pub(crate) class_refs: Vec<ClassRef>,
	pub(crate) classes: Vec<ClassDef>,
	pub(crate) fields: Vec<FieldDef>,
	pub(crate) methods: Vec<MethodDef>,
	pub(crate) properties: Vec<PropertyDef>,
	pub(crate) events: Vec<EventDef>,
	pub(crate) member_refs: Vec<MemberRefDef>,
	pub(crate) type_specs: Vec<TypeSig>,
	pub(crate) method_specs: Vec<MethodSpecDef>,
	pub(crate) standalone_sigs: Vec<StandAloneSigDef>,
	pub(crate) files: Vec<FileDef>,
	pub(crate) exported_types: Vec<ExportedTypeDef>,
	pub(crate) resources: Vec<ManifestResourceDef>,
	pub(crate) decl_security: Vec<(SecurityOwner, DeclSecurityDef)>,
	pub(crate) custom_attributes: Vec<(AttributeOwner, CustomAttributeDef)>,

	#[derivative(Debug = "ignore")]
	class_ref_map: FxHashMap<ClassRef, ClassRefHandle>,
	#[derivative(Debug = "ignore")]
	member_ref_map: FxHashMap<MemberRefDef, MemberRefHandle>,
	#[derivative(Debug = "ignore")]
	type_spec_map: FxHashMap<TypeSig, TypeSpecHandle>,
	#[derivative(Debug = "ignore")]
	method_spec_map: FxHashMap<MethodSpecDef, MethodSpecHandle>,
	#[derivative(Debug = "ignore")]
	standalone_sig_map: FxHashMap<StandAloneSigDef, StandAloneSigHandle>,
}

impl Image {
	/// Creates an empty image. Row 1 of the TypeDef table, the `<Module>`
	/// pseudo-class holding global fields and methods, exists from the
	/// start. The MVID starts out nil so that builds stay deterministic;
	/// set a real one with [`Image::set_mvid`].
	pub fn new(module_name: impl Into<String>) -> Self {
		Self {
			module: ModuleDef {
				name: module_name.into(),
				mvid: Uuid::nil(),
				generation: 0,
			},
			assembly: None,
			entry_point: None,
			assembly_refs: vec![],
			module_refs: vec![],
			class_refs: vec![],
			classes: vec![ClassDef::new("", "<Module>", TypeAttributes::default(), None)],
			fields: vec![],
			methods: vec![],
			properties: vec![],
			events: vec![],
			member_refs: vec![],
			type_specs: vec![],
			method_specs: vec![],
			standalone_sigs: vec![],
			files: vec![],
			exported_types: vec![],
			resources: vec![],
			decl_security: vec![],
			custom_attributes: vec![],
			class_ref_map: FxHashMap::default(),
			member_ref_map: FxHashMap::default(),
			type_spec_map: FxHashMap::default(),
			method_spec_map: FxHashMap::default(),
			standalone_sig_map: FxHashMap::default(),
		}
	}

	/// Loads an image from the bytes of a PE file.
	pub fn read(data: &[u8], options: &LoadOptions) -> Result<Self> {
		loader::load(data, options)
	}

	/// Opens and loads an image by mapping the file instead of buffering it.
	#[cfg(feature = "memmap")]
	pub fn open(path: impl AsRef<std::path::Path>, options: &LoadOptions) -> Result<Self> {
		let file = std::fs::File::open(path)?;
		let map = unsafe { memmap2::Mmap::map(&file)? };
		Self::read(&map, options)
	}

	/// Emits the image as the bytes of a complete PE file.
	pub fn write(&self) -> Result<Vec<u8>> {
		crate::build::emit(self)
	}

	pub fn module(&self) -> &ModuleDef {
		&self.module
	}

	pub fn set_mvid(&mut self, mvid: Uuid) {
		self.module.mvid = mvid;
	}

	pub fn assembly(&self) -> Option<&AssemblyDef> {
		self.assembly.as_ref()
	}

	pub fn set_assembly(&mut self, assembly: AssemblyDef) {
		self.assembly = Some(assembly);
	}

	pub fn entry_point(&self) -> Option<MethodHandle> {
		self.entry_point
	}

	pub fn set_entry_point(&mut self, method: MethodHandle) {
		self.entry_point = Some(method);
	}

	// ---- scope references ----

	pub fn add_assembly_ref(&mut self, assembly_ref: AssemblyRefDef) -> AssemblyRefHandle {
		self.assembly_refs.push(assembly_ref);
		AssemblyRefHandle::new(self.assembly_refs.len() - 1)
	}

	pub fn assembly_refs(&self) -> impl Iterator<Item = (AssemblyRefHandle, &AssemblyRefDef)> {
		self.assembly_refs
			.iter()
			.enumerate()
			.map(|(i, r)| (AssemblyRefHandle::new(i), r))
	}

	pub fn add_module_ref(&mut self, name: impl Into<String>) -> ModuleRefHandle {
		let name = name.into();
		if let Some(index) = self.module_refs.iter().position(|m| m.name == name) {
			return ModuleRefHandle::new(index);
		}
		self.module_refs.push(ModuleRefDef { name });
		ModuleRefHandle::new(self.module_refs.len() - 1)
	}

	/// Interns a reference to a class in another scope.
	pub fn add_class_ref(
		&mut self,
		scope: ResolutionScopeRef,
		namespace: impl Into<String>,
		name: impl Into<String>,
	) -> ClassRefHandle {
		let class_ref = ClassRef {
			scope,
			namespace: namespace.into(),
			name: name.into(),
		};
		if let Some(handle) = self.class_ref_map.get(&class_ref) {
			return *handle;
		}
		let handle = ClassRefHandle::new(self.class_refs.len());
		self.class_refs.push(class_ref.clone());
		self.class_ref_map.insert(class_ref, handle);
		handle
	}

	pub fn class_ref(&self, handle: ClassRefHandle) -> &ClassRef {
		&self.class_refs[handle.index()]
	}

	// ---- classes ----

	pub fn add_class(
		&mut self,
		namespace: impl Into<String>,
		name: impl Into<String>,
		flags: TypeAttributes,
		extends: Option<TypeHandle>,
	) -> ClassDefHandle {
		self.classes.push(ClassDef::new(namespace, name, flags, extends));
		ClassDefHandle::new(self.classes.len() - 1)
	}

	/// Adds a class nested inside `enclosing`; a NestedClass row ties the
	/// two together on emission.
	pub fn add_nested_class(
		&mut self,
		enclosing: ClassDefHandle,
		name: impl Into<String>,
		flags: TypeAttributes,
		extends: Option<TypeHandle>,
	) -> ClassDefHandle {
		let handle = self.add_class("", name, flags, extends);
		self.classes[handle.index()].enclosing = Some(enclosing);
		self.classes[enclosing.index()].nested.push(handle);
		handle
	}

	/// The `<Module>` pseudo-class owning global fields and methods.
	pub fn global_class(&self) -> ClassDefHandle {
		ClassDefHandle::new(0)
	}

	/// All classes, the `<Module>` pseudo-class included.
	pub fn classes(&self) -> impl Iterator<Item = ClassDefHandle> {
		(0..self.classes.len()).map(ClassDefHandle::new)
	}

	pub fn class(&self, handle: ClassDefHandle) -> &ClassDef {
		&self.classes[handle.index()]
	}

	pub fn class_mut(&mut self, handle: ClassDefHandle) -> &mut ClassDef {
		&mut self.classes[handle.index()]
	}

	pub fn find_class(&self, namespace: &str, name: &str) -> Option<ClassDefHandle> {
		self.classes
			.iter()
			.position(|c| c.namespace == namespace && c.name == name)
			.map(ClassDefHandle::new)
	}

	/// The fully qualified name, nesting chain included: `Ns.Outer+Inner`.
	pub fn class_full_name(&self, handle: ClassDefHandle) -> String {
		let class = self.class(handle);
		match class.enclosing {
			Some(enclosing) => {
				format!("{}+{}", self.class_full_name(enclosing), class.name)
			},
			None if class.namespace.is_empty() => class.name.clone(),
			None => format!("{}.{}", class.namespace, class.name),
		}
	}

	// ---- members ----

	/// Adds a field to a class. A field with the same name and signature on
	/// the same class is a duplicate descriptor and is rejected; the
	/// existing one stays reachable through [`Image::find_field`].
	pub fn add_field(&mut self, class: ClassDefHandle, field: FieldDef) -> Result<FieldHandle> {
		let duplicate = self.classes[class.index()].fields.iter().any(|h| {
			let existing = &self.fields[h.index()];
			existing.name == field.name && existing.sig == field.sig
		});
		if duplicate {
			return Err(Error::DuplicateDescriptor(field.name));
		}
		let handle = FieldHandle::new(self.fields.len());
		self.fields.push(field);
		self.classes[class.index()].fields.push(handle);
		Ok(handle)
	}

	pub fn field(&self, handle: FieldHandle) -> &FieldDef {
		&self.fields[handle.index()]
	}

	pub fn field_mut(&mut self, handle: FieldHandle) -> &mut FieldDef {
		&mut self.fields[handle.index()]
	}

	pub fn find_field(&self, class: ClassDefHandle, name: &str) -> Option<FieldHandle> {
		self.classes[class.index()]
			.fields
			.iter()
			.copied()
			.find(|h| self.fields[h.index()].name == name)
	}

	/// Adds a method to a class, rejecting duplicate (name, signature)
	/// descriptors the same way as [`Image::add_field`].
	pub fn add_method(&mut self, class: ClassDefHandle, method: MethodDef) -> Result<MethodHandle> {
		let duplicate = self.classes[class.index()].methods.iter().any(|h| {
			let existing = &self.methods[h.index()];
			existing.name == method.name && existing.sig == method.sig
		});
		if duplicate {
			return Err(Error::DuplicateDescriptor(method.name));
		}
		let handle = MethodHandle::new(self.methods.len());
		self.methods.push(method);
		self.classes[class.index()].methods.push(handle);
		Ok(handle)
	}

	pub fn method(&self, handle: MethodHandle) -> &MethodDef {
		&self.methods[handle.index()]
	}

	pub fn method_mut(&mut self, handle: MethodHandle) -> &mut MethodDef {
		&mut self.methods[handle.index()]
	}

	pub fn find_method(&self, class: ClassDefHandle, name: &str) -> Option<MethodHandle> {
		self.classes[class.index()]
			.methods
			.iter()
			.copied()
			.find(|h| self.methods[h.index()].name == name)
	}

	pub fn add_property(&mut self, class: ClassDefHandle, property: PropertyDef) -> PropertyHandle {
		let handle = PropertyHandle::new(self.properties.len());
		self.properties.push(property);
		self.classes[class.index()].properties.push(handle);
		handle
	}

	pub fn property(&self, handle: PropertyHandle) -> &PropertyDef {
		&self.properties[handle.index()]
	}

	pub fn add_event(&mut self, class: ClassDefHandle, event: EventDef) -> EventHandle {
		let handle = EventHandle::new(self.events.len());
		self.events.push(event);
		self.classes[class.index()].events.push(handle);
		handle
	}

	pub fn event(&self, handle: EventHandle) -> &EventDef {
		&self.events[handle.index()]
	}

	// ---- reference rows (interned) ----

	/// Interns a MemberRef row; structurally equal references share a row.
	pub fn member_ref(
		&mut self,
		parent: MemberRefParentRef,
		name: impl Into<String>,
		sig: MemberRefSig,
	) -> MemberRefHandle {
		let member_ref = MemberRefDef {
			parent,
			name: name.into(),
			sig,
		};
		if let Some(handle) = self.member_ref_map.get(&member_ref) {
			return *handle;
		}
		let handle = MemberRefHandle::new(self.member_refs.len());
		self.member_refs.push(member_ref.clone());
		self.member_ref_map.insert(member_ref, handle);
		handle
	}

	pub fn member_refs(&self) -> impl Iterator<Item = (MemberRefHandle, &MemberRefDef)> {
		self.member_refs
			.iter()
			.enumerate()
			.map(|(i, r)| (MemberRefHandle::new(i), r))
	}

	/// Interns a constructed type as a TypeSpec row.
	pub fn type_spec(&mut self, sig: TypeSig) -> TypeSpecHandle {
		if let Some(handle) = self.type_spec_map.get(&sig) {
			return *handle;
		}
		let handle = TypeSpecHandle::new(self.type_specs.len());
		self.type_specs.push(sig.clone());
		self.type_spec_map.insert(sig, handle);
		handle
	}

	pub fn type_spec_sig(&self, handle: TypeSpecHandle) -> &TypeSig {
		&self.type_specs[handle.index()]
	}

	/// Interns a generic method instantiation as a MethodSpec row.
	pub fn method_spec(&mut self, method: MethodRef, args: Vec<TypeSig>) -> MethodSpecHandle {
		let spec = MethodSpecDef { method, args };
		if let Some(handle) = self.method_spec_map.get(&spec) {
			return *handle;
		}
		let handle = MethodSpecHandle::new(self.method_specs.len());
		self.method_specs.push(spec.clone());
		self.method_spec_map.insert(spec, handle);
		handle
	}

	/// Interns a StandAloneSig row (locals or a calli call-site).
	pub fn standalone_sig(&mut self, sig: StandAloneSigDef) -> StandAloneSigHandle {
		if let Some(handle) = self.standalone_sig_map.get(&sig) {
			return *handle;
		}
		let handle = StandAloneSigHandle::new(self.standalone_sigs.len());
		self.standalone_sigs.push(sig.clone());
		self.standalone_sig_map.insert(sig, handle);
		handle
	}

	// ---- manifest extras ----

	pub fn add_file(&mut self, file: FileDef) -> FileHandle {
		self.files.push(file);
		FileHandle::new(self.files.len() - 1)
	}

	pub fn add_exported_type(&mut self, exported: ExportedTypeDef) -> ExportedTypeHandle {
		self.exported_types.push(exported);
		ExportedTypeHandle::new(self.exported_types.len() - 1)
	}

	pub fn add_resource(&mut self, resource: ManifestResourceDef) -> ResourceHandle {
		self.resources.push(resource);
		ResourceHandle::new(self.resources.len() - 1)
	}

	pub fn add_decl_security(&mut self, owner: SecurityOwner, row: DeclSecurityDef) {
		self.decl_security.push((owner, row));
	}

	pub fn add_custom_attribute(&mut self, owner: AttributeOwner, attribute: CustomAttributeDef) {
		self.custom_attributes.push((owner, attribute));
	}

	pub fn custom_attributes(
		&self,
	) -> impl Iterator<Item = &(AttributeOwner, CustomAttributeDef)> {
		self.custom_attributes.iter()
	}

	/// Rebuilds the dedup maps after bulk loading; the loader fills the
	/// arenas directly.
	pub(crate) fn rebuild_intern_maps(&mut self) {
		for (i, class_ref) in self.class_refs.iter().enumerate() {
			self.class_ref_map.insert(class_ref.clone(), ClassRefHandle::new(i));
		}
		for (i, member_ref) in self.member_refs.iter().enumerate() {
			self.member_ref_map.insert(member_ref.clone(), MemberRefHandle::new(i));
		}
		for (i, sig) in self.type_specs.iter().enumerate() {
			self.type_spec_map.insert(sig.clone(), TypeSpecHandle::new(i));
		}
		for (i, spec) in self.method_specs.iter().enumerate() {
			self.method_spec_map.insert(spec.clone(), MethodSpecHandle::new(i));
		}
		for (i, sig) in self.standalone_sigs.iter().enumerate() {
			self.standalone_sig_map.insert(sig.clone(), StandAloneSigHandle::new(i));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::structured::signatures::{FieldSig, MethodSig};
	use crate::raw::heaps::table::FieldAttributes;

	fn object_ref(image: &mut Image) -> ClassRefHandle {
		let mscorlib = image.add_assembly_ref(AssemblyRefDef::new("mscorlib", (4, 0, 0, 0)));
		image.add_class_ref(
			ResolutionScopeRef::AssemblyRef(mscorlib),
			"System",
			"Object",
		)
	}

	#[test]
	fn class_refs_are_interned() {
		let mut image = Image::new("test.dll");
		let a = object_ref(&mut image);
		let b = object_ref(&mut image);
		assert_eq!(a, b);
		assert_eq!(image.class_refs.len(), 1);
	}

	#[test]
	fn duplicate_field_descriptor_is_rejected() {
		let mut image = Image::new("test.dll");
		let class = image.add_class("N", "C", TypeAttributes::PUBLIC, None);
		let sig = FieldSig::new(TypeSig::I4);
		let first = image
			.add_field(class, FieldDef::new("x", FieldAttributes::PUBLIC, sig.clone()))
			.unwrap();
		let duplicate =
			image.add_field(class, FieldDef::new("x", FieldAttributes::PUBLIC, sig));
		assert!(matches!(duplicate, Err(Error::DuplicateDescriptor(_))));
		assert_eq!(image.find_field(class, "x"), Some(first));
		// A different signature under the same name is a distinct field.
		image
			.add_field(
				class,
				FieldDef::new("x", FieldAttributes::PUBLIC, FieldSig::new(TypeSig::I8)),
			)
			.unwrap();
	}

	#[test]
	fn duplicate_method_descriptor_is_rejected() {
		let mut image = Image::new("test.dll");
		let class = image.add_class("N", "C", TypeAttributes::PUBLIC, None);
		let sig = MethodSig::static_method(TypeSig::Void, vec![]);
		image
			.add_method(
				class,
				MethodDef::new("M", Default::default(), sig.clone()),
			)
			.unwrap();
		assert!(image
			.add_method(class, MethodDef::new("M", Default::default(), sig))
			.is_err());
	}

	#[test]
	fn nested_classes_know_their_chain() {
		let mut image = Image::new("test.dll");
		let outer = image.add_class("", "Outer", TypeAttributes::PUBLIC, None);
		let inner = image.add_nested_class(
			outer,
			"Inner1",
			TypeAttributes::NESTED_PUBLIC,
			None,
		);
		assert_eq!(image.class(inner).enclosing(), Some(outer));
		assert_eq!(image.class(outer).nested(), &[inner]);
		assert_eq!(image.class_full_name(inner), "Outer+Inner1");
	}

	#[test]
	fn type_specs_dedup_structurally() {
		let mut image = Image::new("test.dll");
		let object = object_ref(&mut image);
		let sig = TypeSig::sz_array(TypeSig::Class(TypeHandle::Ref(object)));
		let a = image.type_spec(sig.clone());
		let b = image.type_spec(sig);
		assert_eq!(a, b);
		assert_eq!(image.type_specs.len(), 1);
	}
}
