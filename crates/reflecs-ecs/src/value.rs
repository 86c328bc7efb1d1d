//! Moving host values into and out of component storage.
//!
//! Reads always hand back a copy made with the type's copy hook. Writes pick
//! the hook from the value's origin: an owned value is move-constructed into
//! storage, a borrowed one is copy-constructed. Typed access checks the
//! caller's Rust type against the registered layout first, so a mismatched
//! value is reported as [`EcsError::TypeMismatch`] instead of being truncated.

use std::{
    alloc::Layout,
    any::TypeId,
    fmt,
    marker::PhantomData,
    mem::{ManuallyDrop, MaybeUninit},
    ptr::NonNull,
    sync::Arc,
};

use crate::{
    component::{ComponentSchema, TypeDescriptor, TypeFlags, TypeHandle, TypeRegistry},
    entity::Entity,
    error::{EcsError, EcsResult},
    relation::Id,
    world::World,
};

/// Verify that `T` may stand in for values described by `desc`.
pub(crate) fn check_typed<T: 'static>(desc: &TypeDescriptor) -> EcsResult<()> {
    let layout = Layout::new::<T>();
    if layout != desc.layout() {
        return Err(EcsError::TypeMismatch {
            type_name: desc.path().to_owned(),
            expected_size: desc.size(),
            expected_align: desc.align(),
            found_size: layout.size(),
            found_align: layout.align(),
        });
    }
    if desc.rust_type().is_some_and(|id| id != TypeId::of::<T>()) {
        return Err(EcsError::ForeignType {
            type_name: desc.path().to_owned(),
        });
    }
    Ok(())
}

// ============================================================================
// ComponentValue - owned, type-erased value
// ============================================================================

/// An owned value of a registered type, living in its own aligned buffer.
pub struct ComponentValue {
    descriptor: Arc<TypeDescriptor>,
    schema: ComponentSchema,
    data: NonNull<u8>,
}

// SAFETY: registered types are required to be Send + Sync.
unsafe impl Send for ComponentValue {}
unsafe impl Sync for ComponentValue {}

impl ComponentValue {
    fn lookup(registry: &TypeRegistry, handle: TypeHandle) -> EcsResult<(Arc<TypeDescriptor>, ComponentSchema)> {
        let descriptor = registry
            .descriptor(handle)
            .ok_or(EcsError::UnknownType(handle))?;
        let schema = registry
            .schema(handle)
            .ok_or(EcsError::UnknownType(handle))?;
        Ok((Arc::clone(descriptor), schema.clone()))
    }

    fn allocate(layout: Layout) -> NonNull<u8> {
        if layout.size() == 0 {
            return NonNull::new(std::ptr::without_provenance_mut::<u8>(layout.align()))
                .unwrap_or(NonNull::dangling());
        }
        // SAFETY: layout has non-zero size
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout))
    }

    fn deallocate(&self) {
        if self.schema.size() > 0 {
            // SAFETY: data was allocated with this layout in `allocate`
            unsafe { std::alloc::dealloc(self.data.as_ptr(), self.schema.layout()) };
        }
    }

    /// Build a value by running `init` on fresh storage. `init` must fully
    /// initialise the buffer when it returns `Ok`.
    ///
    /// # Safety
    ///
    /// On `Ok`, the buffer must hold a valid value of `handle`'s type.
    pub unsafe fn try_init<E>(
        registry: &TypeRegistry,
        handle: TypeHandle,
        init: impl FnOnce(*mut u8) -> Result<(), E>,
    ) -> EcsResult<Result<Self, E>> {
        let (descriptor, schema) = Self::lookup(registry, handle)?;
        let data = Self::allocate(schema.layout());
        match init(data.as_ptr()) {
            Ok(()) => Ok(Ok(Self {
                descriptor,
                schema,
                data,
            })),
            Err(err) => {
                if schema.size() > 0 {
                    // SAFETY: allocated just above with this layout
                    unsafe { std::alloc::dealloc(data.as_ptr(), schema.layout()) };
                }
                Ok(Err(err))
            }
        }
    }

    pub fn from_typed<T: 'static>(registry: &TypeRegistry, handle: TypeHandle, value: T) -> EcsResult<Self> {
        let (descriptor, schema) = Self::lookup(registry, handle)?;
        check_typed::<T>(&descriptor)?;
        let data = Self::allocate(schema.layout());
        // SAFETY: the buffer has T's layout
        unsafe { data.as_ptr().cast::<T>().write(value) };
        Ok(Self {
            descriptor,
            schema,
            data,
        })
    }

    /// The type's default value.
    pub fn default_of(registry: &TypeRegistry, handle: TypeHandle) -> EcsResult<Self> {
        // SAFETY: default_into initialises the buffer whenever it returns Ok
        unsafe {
            Self::try_init(registry, handle, |dst| {
                registry
                    .schema(handle)
                    .ok_or(EcsError::UnknownType(handle))
                    .and_then(|schema| schema.default_into(dst).map_err(EcsError::from))
            })?
        }
    }

    /// Build a trivial value from its raw bytes.
    pub fn from_bytes(registry: &TypeRegistry, handle: TypeHandle, bytes: &[u8]) -> EcsResult<Self> {
        let (descriptor, schema) = Self::lookup(registry, handle)?;
        if !schema.is_trivial() || bytes.len() != schema.size() {
            return Err(EcsError::TypeMismatch {
                type_name: descriptor.path().to_owned(),
                expected_size: schema.size(),
                expected_align: schema.align(),
                found_size: bytes.len(),
                found_align: 1,
            });
        }
        let data = Self::allocate(schema.layout());
        // SAFETY: lengths match and the buffers are distinct
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), data.as_ptr(), bytes.len()) };
        Ok(Self {
            descriptor,
            schema,
            data,
        })
    }

    /// Copy the value at `src`.
    ///
    /// # Safety
    ///
    /// `src` must point to an initialised value of the descriptor's type.
    pub(crate) unsafe fn copy_from(descriptor: Arc<TypeDescriptor>, schema: ComponentSchema, src: *const u8) -> Self {
        let data = Self::allocate(schema.layout());
        // SAFETY: forwarded from caller; data is fresh
        unsafe { schema.copy_into(data.as_ptr(), src) };
        Self {
            descriptor,
            schema,
            data,
        }
    }

    #[must_use]
    pub fn handle(&self) -> TypeHandle {
        self.descriptor.handle()
    }

    #[must_use]
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// Borrow as `T` if the type matches.
    #[must_use]
    pub fn get<T: 'static>(&self) -> Option<&T> {
        check_typed::<T>(&self.descriptor).ok()?;
        // SAFETY: layout and type were checked
        Some(unsafe { &*self.data.as_ptr().cast::<T>() })
    }

    /// Unwrap into `T`, or give the value back on mismatch.
    pub fn downcast<T: 'static>(self) -> Result<T, Self> {
        if check_typed::<T>(&self.descriptor).is_err() {
            return Err(self);
        }
        let this = ManuallyDrop::new(self);
        // SAFETY: checked type; the buffer is freed without running drop
        let value = unsafe { this.data.as_ptr().cast::<T>().read() };
        this.deallocate();
        // SAFETY: fields are dropped exactly once here
        unsafe {
            drop(std::ptr::read(&this.descriptor));
            drop(std::ptr::read(&this.schema));
        }
        Ok(value)
    }

    /// Raw bytes of a trivial value.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        if !self.schema.is_trivial() {
            return None;
        }
        // SAFETY: trivial values are plain bytes of this length
        Some(unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.schema.size()) })
    }

    /// Hand the buffer to `consume`, which must move the value out.
    pub(crate) fn consume(self, consume: impl FnOnce(*mut u8)) {
        let this = ManuallyDrop::new(self);
        consume(this.data.as_ptr());
        this.deallocate();
        // SAFETY: fields are dropped exactly once here
        unsafe {
            drop(std::ptr::read(&this.descriptor));
            drop(std::ptr::read(&this.schema));
        }
    }
}

impl Clone for ComponentValue {
    fn clone(&self) -> Self {
        // SAFETY: self.data holds an initialised value
        unsafe { Self::copy_from(Arc::clone(&self.descriptor), self.schema.clone(), self.data.as_ptr()) }
    }
}

impl Drop for ComponentValue {
    fn drop(&mut self) {
        // SAFETY: the value is initialised and dropped once
        unsafe { self.schema.drop_in_place(self.data.as_ptr()) };
        self.deallocate();
    }
}

impl fmt::Debug for ComponentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentValue")
            .field("type", &self.descriptor.path())
            .field("size", &self.schema.size())
            .finish()
    }
}

// ============================================================================
// ValueMut - borrow of a stored value
// ============================================================================

/// Mutable access to a stored value. Holding it borrows the world, so no
/// structural change can relocate the value underneath it.
pub struct ValueMut<'w> {
    ptr: *mut u8,
    descriptor: &'w TypeDescriptor,
    _world: PhantomData<&'w mut World>,
}

impl ValueMut<'_> {
    #[must_use]
    pub fn handle(&self) -> TypeHandle {
        self.descriptor.handle()
    }

    #[must_use]
    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        check_typed::<T>(self.descriptor).ok()?;
        // SAFETY: type checked; exclusive through the world borrow
        Some(unsafe { &mut *self.ptr.cast::<T>() })
    }

    /// Raw bytes of a trivial value.
    #[must_use]
    pub fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        if !self.descriptor.flags().contains(TypeFlags::TRIVIAL) {
            return None;
        }
        // SAFETY: trivial values are plain bytes; exclusive through the world borrow
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr, self.descriptor.size()) })
    }
}

// ============================================================================
// World adapter API
// ============================================================================

enum Transfer {
    Move(*mut u8),
    Copy(*const u8),
}

impl World {
    /// Copy out the value of `handle` on `entity`. Never constructs one.
    /// Stale handles read as `None`.
    pub fn read<T: 'static>(&self, entity: Entity, handle: TypeHandle) -> EcsResult<Option<T>> {
        let desc = self.descriptor(handle)?;
        check_typed::<T>(desc)?;
        let Some((ptr, column)) = self.value_ptr(entity, Id::component(handle)) else {
            return Ok(None);
        };
        let mut out = MaybeUninit::<T>::uninit();
        // SAFETY: ptr is a live value of T's type; out is fresh storage for T
        unsafe {
            column.schema().copy_into(out.as_mut_ptr().cast(), ptr);
            Ok(Some(out.assume_init()))
        }
    }

    /// Type-erased copy of the value of `id` on `entity`.
    #[must_use]
    pub fn read_value(&self, entity: Entity, id: impl Into<Id>) -> Option<ComponentValue> {
        let id = id.into();
        let descriptor = self.registry().descriptor(id.type_handle())?;
        let (ptr, column) = self.value_ptr(entity, id)?;
        // SAFETY: ptr is a live value described by descriptor
        Some(unsafe { ComponentValue::copy_from(Arc::clone(descriptor), column.schema().clone(), ptr) })
    }

    /// Move `value` into storage, adding the component if absent.
    pub fn write<T: 'static>(&mut self, entity: Entity, handle: TypeHandle, value: T) -> EcsResult<()> {
        check_typed::<T>(self.descriptor(handle)?)?;
        let mut value = ManuallyDrop::new(value);
        let src = std::ptr::from_mut(&mut *value).cast::<u8>();
        // SAFETY: src is a valid T of the registered type
        let result = unsafe { self.put(entity, Id::component(handle), Transfer::Move(src)) };
        if result.is_err() {
            // SAFETY: put consumes src only on success
            unsafe { ManuallyDrop::drop(&mut value) };
        }
        result
    }

    /// Copy `value` into storage, adding the component if absent.
    pub fn write_ref<T: 'static>(&mut self, entity: Entity, handle: TypeHandle, value: &T) -> EcsResult<()> {
        check_typed::<T>(self.descriptor(handle)?)?;
        // SAFETY: value is a valid T of the registered type
        unsafe { self.put(entity, Id::component(handle), Transfer::Copy(std::ptr::from_ref(value).cast())) }
    }

    /// Move a type-erased value into storage.
    pub fn write_value(&mut self, entity: Entity, value: ComponentValue) -> EcsResult<()> {
        let id = Id::component(value.handle());
        self.location_for_write(entity)?;
        self.check_id(id)?;
        let schema = value.schema.clone();
        let mut result = Ok(());
        value.consume(|src| {
            // SAFETY: src holds a valid value of id's type; on failure it was
            // not consumed and is destroyed here
            unsafe {
                result = self.put(entity, id, Transfer::Move(src));
                if result.is_err() {
                    schema.drop_in_place(src);
                }
            }
        });
        result
    }

    /// Copy a type-erased value into storage.
    pub fn write_value_ref(&mut self, entity: Entity, value: &ComponentValue) -> EcsResult<()> {
        // SAFETY: value holds a valid value of its own type
        unsafe { self.put(entity, Id::component(value.handle()), Transfer::Copy(value.as_ptr())) }
    }

    /// Write a trivial value from its raw bytes.
    pub fn write_bytes(&mut self, entity: Entity, handle: TypeHandle, bytes: &[u8]) -> EcsResult<()> {
        let value = ComponentValue::from_bytes(self.registry(), handle, bytes)?;
        self.write_value(entity, value)
    }

    /// Add `id` with its default value if absent and return mutable access.
    pub fn ensure_default(&mut self, entity: Entity, id: impl Into<Id>) -> EcsResult<ValueMut<'_>> {
        let id = id.into();
        self.add(entity, id)?;
        let (ptr, _) = self
            .value_ptr(entity, id)
            .ok_or(EcsError::StaleHandle(entity))?;
        let descriptor = self.descriptor(id.type_handle())?;
        Ok(ValueMut {
            ptr,
            descriptor: descriptor.as_ref(),
            _world: PhantomData,
        })
    }

    /// Typed [`ensure_default`](Self::ensure_default).
    pub fn ensure_default_typed<T: 'static>(&mut self, entity: Entity, handle: TypeHandle) -> EcsResult<&mut T> {
        check_typed::<T>(self.descriptor(handle)?)?;
        self.add(entity, handle)?;
        let (ptr, _) = self
            .value_ptr(entity, Id::component(handle))
            .ok_or(EcsError::StaleHandle(entity))?;
        // SAFETY: type checked; the &mut self borrow bounds the reference
        Ok(unsafe { &mut *ptr.cast::<T>() })
    }

    /// # Safety
    ///
    /// The transfer source must be a valid value of `id`'s type. A move
    /// source is consumed exactly when `Ok` is returned.
    unsafe fn put(&mut self, entity: Entity, id: Id, transfer: Transfer) -> EcsResult<()> {
        let loc = self.location_for_write(entity)?;
        self.check_id(id)?;

        if let Some(column) = self
            .archetypes()
            .get(loc.archetype)
            .and_then(|archetype| archetype.column(id))
        {
            // SAFETY: &mut self gives exclusive access; row is live
            unsafe {
                match transfer {
                    Transfer::Move(src) => column.assign_move(loc.row, src),
                    Transfer::Copy(src) => column.assign_copy(loc.row, src),
                }
            }
            return Ok(());
        }

        self.insert_with(entity, loc, id, |column| {
            // SAFETY: source validity is forwarded from the caller
            unsafe {
                match transfer {
                    Transfer::Move(src) => column.push_move(src),
                    Transfer::Copy(src) => column.push_copy(src),
                }
            }
        })
    }
}
