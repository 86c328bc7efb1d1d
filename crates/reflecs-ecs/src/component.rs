//! Type registration: host type descriptions in, immutable descriptors out.
//!
//! The host hands over a [`TypeDescription`] once per type at load time. The
//! registry validates it, freezes it into a [`TypeDescriptor`] and assigns a
//! dense [`TypeHandle`]. Storage never looks at the description again; it
//! works off the [`ComponentSchema`] that is derived lazily from the
//! descriptor on first use and cached for the lifetime of the registry.

use std::{
    alloc::Layout,
    any::TypeId,
    fmt,
    sync::{Arc, OnceLock},
};

use bitflags::bitflags;
use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;

use crate::{
    error::{PayloadError, SchemaError},
    relation::CleanupPolicy,
};

/// Dense local identifier for a registered type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeHandle(u32);

impl TypeHandle {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeHandle({})", self.0)
    }
}

/// What a registered type is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Plain data attached to an entity.
    Data,
    /// Zero-sized presence marker.
    Tag,
    /// Usable as the first element of a `(relation, target)` pair.
    Relationship,
}

/// Ownership semantics of a reflected field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Plain,
    /// The field owns heap data or another object; the type needs a destructor.
    OwningReference,
    WeakReference,
}

/// A single field as reported by host reflection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub offset: usize,
    pub kind: FieldKind,
}

bitflags! {
    /// Flags carried by a type descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u32 {
        /// Bitwise copyable, no destructor.
        const TRIVIAL = 1 << 0;
        /// All-zero bytes are a valid default value.
        const ZERO_INIT = 1 << 1;
        /// Included in replication snapshots.
        const REPLICABLE = 1 << 2;
    }
}

/// Default-construct into uninitialised memory.
pub type DefaultFn = unsafe fn(dst: *mut u8);
/// Copy-construct `src` into uninitialised `dst`; `src` stays valid.
pub type CopyFn = unsafe fn(dst: *mut u8, src: *const u8);
/// Move-construct `src` into uninitialised `dst`; `src` is consumed.
pub type MoveFn = unsafe fn(dst: *mut u8, src: *mut u8);
/// Destroy an initialised value in place.
pub type DropFn = unsafe fn(ptr: *mut u8);
/// Encode an initialised value.
pub type SerializeFn = unsafe fn(src: *const u8) -> Result<Vec<u8>, PayloadError>;
/// Decode bytes into uninitialised `dst`. On error `dst` is left uninitialised.
pub type DeserializeFn = unsafe fn(bytes: &[u8], dst: *mut u8) -> Result<(), PayloadError>;

/// Lifecycle hooks of a host type. Missing hooks fall back to bitwise
/// operations for trivial types.
#[derive(Clone, Copy, Default)]
pub struct LifecycleHooks {
    pub default: Option<DefaultFn>,
    pub copy: Option<CopyFn>,
    pub move_construct: Option<MoveFn>,
    pub drop: Option<DropFn>,
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("default", &self.default.is_some())
            .field("copy", &self.copy.is_some())
            .field("move", &self.move_construct.is_some())
            .field("drop", &self.drop.is_some())
            .finish()
    }
}

/// Payload codec used by replication.
#[derive(Clone, Copy)]
pub struct ReplicationHooks {
    pub serialize: SerializeFn,
    pub deserialize: DeserializeFn,
}

impl fmt::Debug for ReplicationHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplicationHooks")
    }
}

// ============================================================================
// Typed hook shims
// ============================================================================

unsafe fn default_hook<T: Default>(dst: *mut u8) {
    // SAFETY: caller provides uninitialised memory laid out for T
    unsafe { dst.cast::<T>().write(T::default()) }
}

unsafe fn copy_hook<T: Clone>(dst: *mut u8, src: *const u8) {
    // SAFETY: caller guarantees src is an initialised T and dst is writable
    unsafe { dst.cast::<T>().write((*src.cast::<T>()).clone()) }
}

unsafe fn move_hook<T>(dst: *mut u8, src: *mut u8) {
    // SAFETY: src is consumed; the caller must not drop it afterwards
    unsafe { dst.cast::<T>().write(src.cast::<T>().read()) }
}

unsafe fn drop_hook<T>(ptr: *mut u8) {
    // SAFETY: caller guarantees ptr is an initialised T
    unsafe { ptr.cast::<T>().drop_in_place() }
}

// ============================================================================
// TypeDescription - registration input
// ============================================================================

/// A host type as reflection reports it. Consumed by [`TypeRegistry::register`].
#[derive(Debug, Clone)]
pub struct TypeDescription {
    path: String,
    size: usize,
    align: usize,
    classification: Classification,
    hooks: LifecycleHooks,
    flags: TypeFlags,
    fields: Vec<FieldDescription>,
    replication: Option<ReplicationHooks>,
    rust_type: Option<(TypeId, &'static str)>,
    cleanup: CleanupPolicy,
}

impl TypeDescription {
    /// A raw description with no hooks. Non-trivial types must add hooks
    /// with [`with_hooks`](Self::with_hooks) before registering.
    #[must_use]
    pub fn new(path: impl Into<String>, size: usize, align: usize) -> Self {
        Self {
            path: path.into(),
            size,
            align,
            classification: Classification::Data,
            hooks: LifecycleHooks::default(),
            flags: TypeFlags::empty(),
            fields: Vec::new(),
            replication: None,
            rust_type: None,
            cleanup: CleanupPolicy::Remove,
        }
    }

    /// Describe a Rust type, deriving copy, move and drop hooks from its traits.
    #[must_use]
    pub fn of<T: Clone + Send + Sync + 'static>(path: impl Into<String>) -> Self {
        let mut desc = Self::new(path, size_of::<T>(), align_of::<T>()).with_rust_type::<T>();
        desc.hooks = LifecycleHooks {
            default: None,
            copy: Some(copy_hook::<T>),
            move_construct: Some(move_hook::<T>),
            drop: if std::mem::needs_drop::<T>() {
                Some(drop_hook::<T>)
            } else {
                None
            },
        };
        desc
    }

    /// Describe a plain-old-data Rust type. Copies are bitwise and the
    /// default value is all zeroes.
    #[must_use]
    pub fn pod<T: bytemuck::Pod + Send + Sync>(path: impl Into<String>) -> Self {
        let mut desc = Self::new(path, size_of::<T>(), align_of::<T>()).with_rust_type::<T>();
        desc.flags |= TypeFlags::TRIVIAL | TypeFlags::ZERO_INIT;
        desc
    }

    /// A zero-sized marker.
    #[must_use]
    pub fn tag(path: impl Into<String>) -> Self {
        let mut desc = Self::new(path, 0, 1);
        desc.classification = Classification::Tag;
        desc.flags |= TypeFlags::TRIVIAL | TypeFlags::ZERO_INIT;
        desc
    }

    #[must_use]
    pub fn with_rust_type<T: 'static>(mut self) -> Self {
        self.rust_type = Some((TypeId::of::<T>(), std::any::type_name::<T>()));
        self
    }

    /// Use `T::default()` as the default-construct hook.
    #[must_use]
    pub fn with_default<T: Default + 'static>(mut self) -> Self {
        debug_assert!(
            self.rust_type.is_none_or(|(id, _)| id == TypeId::of::<T>()),
            "default hook type differs from described type"
        );
        self.hooks.default = Some(default_hook::<T>);
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn trivial(mut self) -> Self {
        self.flags |= TypeFlags::TRIVIAL;
        self
    }

    #[must_use]
    pub fn zero_init(mut self) -> Self {
        self.flags |= TypeFlags::ZERO_INIT;
        self
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, offset: usize, kind: FieldKind) -> Self {
        self.fields.push(FieldDescription {
            name: name.into(),
            offset,
            kind,
        });
        self
    }

    /// Mark as a relationship. `cleanup` decides what happens to pairs whose
    /// target is despawned.
    #[must_use]
    pub fn relationship(mut self, cleanup: CleanupPolicy) -> Self {
        self.classification = Classification::Relationship;
        self.cleanup = cleanup;
        self
    }

    /// Include in replication snapshots using `hooks` for the payload.
    #[must_use]
    pub fn replicated(mut self, hooks: ReplicationHooks) -> Self {
        self.flags |= TypeFlags::REPLICABLE;
        self.replication = Some(hooks);
        self
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn validate(&self) -> Result<Layout, SchemaError> {
        let path = || self.path.clone();

        if self.path.is_empty() {
            return Err(SchemaError::EmptyPath);
        }
        if self.align == 0 || !self.align.is_power_of_two() {
            return Err(SchemaError::BadAlignment {
                path: path(),
                align: self.align,
            });
        }
        if self.size % self.align != 0 {
            return Err(SchemaError::BadSize {
                path: path(),
                size: self.size,
                align: self.align,
            });
        }
        if self.classification == Classification::Tag && self.size != 0 {
            return Err(SchemaError::SizedTag {
                path: path(),
                size: self.size,
            });
        }

        if self.size > 0 {
            if let Some(field) = self
                .fields
                .iter()
                .find(|f| f.kind == FieldKind::OwningReference)
            {
                if self.hooks.drop.is_none() {
                    return Err(SchemaError::MissingDestructor {
                        path: path(),
                        field: field.name.clone(),
                    });
                }
            }
            if !self.flags.contains(TypeFlags::TRIVIAL) && self.hooks.copy.is_none() {
                return Err(SchemaError::MissingCopy { path: path() });
            }
        }

        Layout::from_size_align(self.size, self.align).map_err(|_| SchemaError::BadSize {
            path: path(),
            size: self.size,
            align: self.align,
        })
    }
}

/// Implemented by Rust types that can describe themselves to the registry.
pub trait Reflect: Send + Sync + 'static {
    fn describe() -> TypeDescription;
}

// ============================================================================
// TypeDescriptor - frozen registration output
// ============================================================================

/// The immutable, registered form of a host type.
#[derive(Debug)]
pub struct TypeDescriptor {
    handle: TypeHandle,
    path: Arc<str>,
    stable_id: u32,
    layout: Layout,
    classification: Classification,
    hooks: LifecycleHooks,
    flags: TypeFlags,
    fields: Vec<FieldDescription>,
    replication: Option<ReplicationHooks>,
    rust_type: Option<(TypeId, &'static str)>,
    cleanup: CleanupPolicy,
}

impl TypeDescriptor {
    #[must_use]
    pub const fn handle(&self) -> TypeHandle {
        self.handle
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Process-independent identifier derived from the path. Used on the wire.
    #[must_use]
    pub const fn stable_id(&self) -> u32 {
        self.stable_id
    }

    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.layout
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub const fn align(&self) -> usize {
        self.layout.align()
    }

    #[must_use]
    pub const fn classification(&self) -> Classification {
        self.classification
    }

    #[must_use]
    pub const fn is_tag(&self) -> bool {
        self.layout.size() == 0
    }

    #[must_use]
    pub const fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    #[must_use]
    pub const fn flags(&self) -> TypeFlags {
        self.flags
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    #[must_use]
    pub const fn is_replicable(&self) -> bool {
        self.flags.contains(TypeFlags::REPLICABLE)
    }

    #[must_use]
    pub const fn replication(&self) -> Option<&ReplicationHooks> {
        self.replication.as_ref()
    }

    #[must_use]
    pub const fn cleanup(&self) -> CleanupPolicy {
        self.cleanup
    }

    #[must_use]
    pub fn rust_type(&self) -> Option<TypeId> {
        self.rust_type.map(|(id, _)| id)
    }

    /// Whether a value of type `T` may be read from or written to storage
    /// laid out by this descriptor.
    #[must_use]
    pub fn accepts<T: 'static>(&self) -> bool {
        self.layout == Layout::new::<T>()
            && self.rust_type.is_none_or(|(id, _)| id == TypeId::of::<T>())
    }

    fn same_shape(&self, desc: &TypeDescription) -> bool {
        self.layout.size() == desc.size
            && self.layout.align() == desc.align
            && (self.classification == desc.classification
                || (self.classification == Classification::Tag && desc.size == 0))
    }
}

/// FNV-1a over the type path.
#[must_use]
pub const fn stable_id_of(path: &str) -> u32 {
    let bytes = path.as_bytes();
    let mut hash: u32 = 0x811c_9dc5;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        i += 1;
    }
    hash
}

// ============================================================================
// ComponentSchema - storage-facing view
// ============================================================================

/// What storage needs to know to hold values of one type.
#[derive(Debug, Clone)]
pub struct ComponentSchema {
    handle: TypeHandle,
    name: Arc<str>,
    layout: Layout,
    hooks: LifecycleHooks,
    flags: TypeFlags,
}

impl ComponentSchema {
    fn from_descriptor(desc: &TypeDescriptor) -> Self {
        Self {
            handle: desc.handle,
            name: Arc::clone(&desc.path),
            layout: desc.layout,
            hooks: desc.hooks,
            flags: desc.flags,
        }
    }

    #[must_use]
    pub const fn handle(&self) -> TypeHandle {
        self.handle
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.layout
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub const fn align(&self) -> usize {
        self.layout.align()
    }

    #[must_use]
    pub const fn is_trivial(&self) -> bool {
        self.flags.contains(TypeFlags::TRIVIAL)
    }

    #[must_use]
    pub const fn needs_drop(&self) -> bool {
        self.hooks.drop.is_some()
    }

    #[must_use]
    pub const fn can_default(&self) -> bool {
        self.hooks.default.is_some()
            || self.flags.contains(TypeFlags::ZERO_INIT)
            || self.layout.size() == 0
    }

    /// # Safety
    ///
    /// `dst` must be valid for writes of this layout and uninitialised.
    pub unsafe fn default_into(&self, dst: *mut u8) -> Result<(), SchemaError> {
        if let Some(default) = self.hooks.default {
            // SAFETY: forwarded from caller
            unsafe { default(dst) };
        } else if self.can_default() {
            // SAFETY: forwarded from caller
            unsafe { std::ptr::write_bytes(dst, 0, self.size()) };
        } else {
            return Err(SchemaError::NoDefault {
                path: self.name.to_string(),
            });
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `src` must be an initialised value; `dst` uninitialised storage.
    pub unsafe fn copy_into(&self, dst: *mut u8, src: *const u8) {
        match self.hooks.copy {
            // SAFETY: forwarded from caller
            Some(copy) => unsafe { copy(dst, src) },
            // SAFETY: registration only admits hookless copies for trivial types
            None => unsafe { std::ptr::copy_nonoverlapping(src, dst, self.size()) },
        }
    }

    /// Move `src` into `dst`. Falls back to copy-then-destroy when the type
    /// has a copy hook but no move hook. `src` is uninitialised afterwards.
    ///
    /// # Safety
    ///
    /// `src` must be an initialised value; `dst` uninitialised storage.
    pub unsafe fn move_into(&self, dst: *mut u8, src: *mut u8) {
        // SAFETY: forwarded from caller
        unsafe {
            if let Some(move_construct) = self.hooks.move_construct {
                move_construct(dst, src);
            } else if self.is_trivial() || self.hooks.copy.is_none() {
                std::ptr::copy_nonoverlapping(src, dst, self.size());
            } else {
                self.copy_into(dst, src);
                self.drop_in_place(src);
            }
        }
    }

    /// # Safety
    ///
    /// `ptr` must be an initialised value that is not used afterwards.
    pub unsafe fn drop_in_place(&self, ptr: *mut u8) {
        if let Some(drop) = self.hooks.drop {
            // SAFETY: forwarded from caller
            unsafe { drop(ptr) };
        }
    }
}

// ============================================================================
// TypeRegistry
// ============================================================================

struct Entry {
    descriptor: Arc<TypeDescriptor>,
    schema: OnceLock<ComponentSchema>,
}

/// Append-only table of registered types.
///
/// Mutation needs `&mut self`, which the world only hands out outside of
/// phase execution, so lookups on the hot path never take a lock.
#[derive(Default)]
pub struct TypeRegistry {
    entries: Vec<Entry>,
    by_path: HashMap<Arc<str>, TypeHandle, FxBuildHasher>,
    by_stable_id: HashMap<u32, TypeHandle, FxBuildHasher>,
    by_rust_type: HashMap<TypeId, TypeHandle, FxBuildHasher>,
}

impl TypeRegistry {
    /// Largest handle that still fits into a pair id.
    const MAX_HANDLE: u32 = (1 << 31) - 1;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a description, or return the handle already registered for
    /// the same path and shape.
    pub fn register(&mut self, desc: TypeDescription) -> Result<TypeHandle, SchemaError> {
        let layout = desc.validate()?;

        if let Some(&handle) = self.by_path.get(desc.path.as_str()) {
            let existing = &self.entries[handle.0 as usize].descriptor;
            if existing.same_shape(&desc) {
                return Ok(handle);
            }
            return Err(SchemaError::Conflict { path: desc.path });
        }

        let stable_id = stable_id_of(&desc.path);
        if let Some(&other) = self.by_stable_id.get(&stable_id) {
            return Err(SchemaError::StableIdCollision {
                existing: self.entries[other.0 as usize].descriptor.path().to_owned(),
                path: desc.path,
                stable_id,
            });
        }

        let raw = self.entries.len() as u32;
        if raw > Self::MAX_HANDLE {
            return Err(SchemaError::RegistryFull { path: desc.path });
        }
        let handle = TypeHandle(raw);

        let (classification, hooks, flags) = if desc.size == 0 {
            (
                if desc.classification == Classification::Relationship {
                    Classification::Relationship
                } else {
                    Classification::Tag
                },
                LifecycleHooks::default(),
                desc.flags | TypeFlags::TRIVIAL | TypeFlags::ZERO_INIT,
            )
        } else {
            (desc.classification, desc.hooks, desc.flags)
        };

        let path: Arc<str> = Arc::from(desc.path);
        let descriptor = Arc::new(TypeDescriptor {
            handle,
            path: Arc::clone(&path),
            stable_id,
            layout,
            classification,
            hooks,
            flags,
            fields: desc.fields,
            replication: desc.replication,
            rust_type: desc.rust_type,
            cleanup: desc.cleanup,
        });

        tracing::debug!(
            path = %path,
            handle = raw,
            size = layout.size(),
            align = layout.align(),
            ?classification,
            "registered type"
        );

        if let Some((type_id, _)) = descriptor.rust_type {
            self.by_rust_type.insert(type_id, handle);
        }
        self.by_path.insert(path, handle);
        self.by_stable_id.insert(stable_id, handle);
        self.entries.push(Entry {
            descriptor,
            schema: OnceLock::new(),
        });

        Ok(handle)
    }

    #[must_use]
    pub fn descriptor(&self, handle: TypeHandle) -> Option<&Arc<TypeDescriptor>> {
        self.entries.get(handle.0 as usize).map(|e| &e.descriptor)
    }

    /// Storage schema for `handle`, built on first request.
    #[must_use]
    pub fn schema(&self, handle: TypeHandle) -> Option<&ComponentSchema> {
        let entry = self.entries.get(handle.0 as usize)?;
        Some(
            entry
                .schema
                .get_or_init(|| ComponentSchema::from_descriptor(&entry.descriptor)),
        )
    }

    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<TypeHandle> {
        self.by_path.get(path).copied()
    }

    #[must_use]
    pub fn by_stable_id(&self, stable_id: u32) -> Option<TypeHandle> {
        self.by_stable_id.get(&stable_id).copied()
    }

    #[must_use]
    pub fn handle_of<T: 'static>(&self) -> Option<TypeHandle> {
        self.by_rust_type.get(&TypeId::of::<T>()).copied()
    }

    #[must_use]
    pub fn contains(&self, handle: TypeHandle) -> bool {
        (handle.0 as usize) < self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TypeDescriptor>> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    /// Drop every registration. Only valid once no storage refers to the
    /// registered types.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_path.clear();
        self.by_stable_id.clear();
        self.by_rust_type.clear();
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Inventory(Vec<u32>);

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = TypeRegistry::new();
        let a = registry
            .register(TypeDescription::pod::<Position>("Game.Position"))
            .unwrap();
        let b = registry
            .register(TypeDescription::pod::<Position>("Game.Position"))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_path_different_layout_conflicts() {
        let mut registry = TypeRegistry::new();
        registry
            .register(TypeDescription::pod::<Position>("Game.Position"))
            .unwrap();
        let err = registry
            .register(TypeDescription::pod::<u32>("Game.Position"))
            .unwrap_err();
        assert!(matches!(err, SchemaError::Conflict { .. }));
    }

    #[test]
    fn test_owning_reference_without_destructor_fails() {
        let mut registry = TypeRegistry::new();
        let desc = TypeDescription::new("Game.Mesh", 16, 8)
            .trivial()
            .field("buffer", 0, FieldKind::OwningReference);
        let err = registry.register(desc).unwrap_err();
        assert!(matches!(err, SchemaError::MissingDestructor { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_non_trivial_without_copy_fails() {
        let mut registry = TypeRegistry::new();
        let err = registry
            .register(TypeDescription::new("Game.Opaque", 8, 8))
            .unwrap_err();
        assert!(matches!(err, SchemaError::MissingCopy { .. }));
    }

    #[test]
    fn test_bad_layout_rejected() {
        let mut registry = TypeRegistry::new();
        assert!(matches!(
            registry.register(TypeDescription::new("A", 4, 3).trivial()),
            Err(SchemaError::BadAlignment { .. })
        ));
        assert!(matches!(
            registry.register(TypeDescription::new("B", 6, 4).trivial()),
            Err(SchemaError::BadSize { .. })
        ));
        assert!(matches!(
            registry.register(TypeDescription::new("", 4, 4).trivial()),
            Err(SchemaError::EmptyPath)
        ));
    }

    #[test]
    fn test_zero_sized_data_becomes_tag() {
        let mut registry = TypeRegistry::new();
        let handle = registry
            .register(TypeDescription::new("Game.Frozen", 0, 1))
            .unwrap();
        let desc = registry.descriptor(handle).unwrap();
        assert_eq!(desc.classification(), Classification::Tag);
        assert!(desc.is_tag());
        assert!(desc.hooks().drop.is_none());
    }

    #[test]
    fn test_sized_tag_rejected() {
        let mut registry = TypeRegistry::new();
        let mut desc = TypeDescription::tag("Game.Tag");
        desc.size = 4;
        desc.align = 4;
        assert!(matches!(
            registry.register(desc),
            Err(SchemaError::SizedTag { .. })
        ));
    }

    #[test]
    fn test_owning_type_with_hooks_registers() {
        let mut registry = TypeRegistry::new();
        let handle = registry
            .register(
                TypeDescription::of::<Inventory>("Game.Inventory").field(
                    "items",
                    0,
                    FieldKind::OwningReference,
                ),
            )
            .unwrap();
        let schema = registry.schema(handle).unwrap();
        assert!(schema.needs_drop());
        assert!(!schema.can_default());
        assert_eq!(registry.handle_of::<Inventory>(), Some(handle));
    }

    #[test]
    fn test_stable_id_lookup() {
        let mut registry = TypeRegistry::new();
        let handle = registry
            .register(TypeDescription::pod::<Position>("Game.Position"))
            .unwrap();
        let id = stable_id_of("Game.Position");
        assert_eq!(registry.descriptor(handle).unwrap().stable_id(), id);
        assert_eq!(registry.by_stable_id(id), Some(handle));
    }

    #[test]
    fn test_accepts_checks_rust_type() {
        let mut registry = TypeRegistry::new();
        let handle = registry
            .register(TypeDescription::pod::<Position>("Game.Position"))
            .unwrap();
        let desc = registry.descriptor(handle).unwrap();
        assert!(desc.accepts::<Position>());
        assert!(!desc.accepts::<[f32; 2]>());
        assert!(!desc.accepts::<u64>());
    }

    #[test]
    fn test_clear_resets_registry() {
        let mut registry = TypeRegistry::new();
        registry
            .register(TypeDescription::pod::<Position>("Game.Position"))
            .unwrap();
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.lookup("Game.Position"), None);
    }
}
