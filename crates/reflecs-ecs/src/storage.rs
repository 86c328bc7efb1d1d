//! Type-erased column storage.
//!
//! A column holds the values of one component (or pair) for every row of an
//! archetype. All element operations go through the column's
//! [`ComponentSchema`], so host lifecycle hooks run for construction, copy,
//! relocation and destruction.

use std::{alloc::Layout, ptr::NonNull};

use crate::{component::ComponentSchema, error::SchemaError};

/// Contiguous, type-erased array of component values.
pub struct Column {
    data: NonNull<u8>,
    len: usize,
    capacity: usize,
    schema: ComponentSchema,
}

// SAFETY: the column owns its buffer; registered types are required to be
// shareable across the worker pool.
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    #[must_use]
    pub fn new(schema: ComponentSchema) -> Self {
        let zero_sized = schema.size() == 0;
        Self {
            data: Self::dangling(schema.align()),
            len: 0,
            capacity: if zero_sized { usize::MAX } else { 0 },
            schema,
        }
    }

    fn dangling(align: usize) -> NonNull<u8> {
        NonNull::new(std::ptr::without_provenance_mut::<u8>(align)).unwrap_or(NonNull::dangling())
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn schema(&self) -> &ComponentSchema {
        &self.schema
    }

    /// Pointer to the value at `row`.
    ///
    /// # Safety
    ///
    /// `row` must be at most `len` (the slot one past the end is used while
    /// pushing).
    #[must_use]
    pub unsafe fn ptr(&self, row: usize) -> *mut u8 {
        debug_assert!(row <= self.len);
        // SAFETY: caller keeps row inside the allocation
        unsafe { self.data.as_ptr().add(row * self.schema.size()) }
    }

    /// Default-construct a new value at the end.
    pub fn push_default(&mut self) -> Result<(), SchemaError> {
        self.reserve(1);
        // SAFETY: reserved slot at len is uninitialised
        unsafe { self.schema.default_into(self.ptr(self.len))? };
        self.len += 1;
        Ok(())
    }

    /// Copy-construct a new value at the end.
    ///
    /// # Safety
    ///
    /// `src` must be an initialised value of this column's type.
    pub unsafe fn push_copy(&mut self, src: *const u8) {
        self.reserve(1);
        // SAFETY: reserved slot is uninitialised, src is valid per caller
        unsafe { self.schema.copy_into(self.ptr(self.len), src) };
        self.len += 1;
    }

    /// Move-construct a new value at the end. `src` is consumed.
    ///
    /// # Safety
    ///
    /// `src` must be an initialised value of this column's type and must not
    /// be used or dropped afterwards.
    pub unsafe fn push_move(&mut self, src: *mut u8) {
        self.reserve(1);
        // SAFETY: reserved slot is uninitialised, src is valid per caller
        unsafe { self.schema.move_into(self.ptr(self.len), src) };
        self.len += 1;
    }

    /// Replace the value at `row`, consuming `src`.
    ///
    /// # Safety
    ///
    /// `row < len`; `src` as for [`push_move`](Self::push_move). No other
    /// thread may access `row` concurrently.
    pub unsafe fn assign_move(&self, row: usize, src: *mut u8) {
        debug_assert!(row < self.len);
        // SAFETY: row is initialised; it is destroyed then rebuilt from src
        unsafe {
            let dst = self.ptr(row);
            self.schema.drop_in_place(dst);
            self.schema.move_into(dst, src);
        }
    }

    /// Replace the value at `row` with a copy of `src`.
    ///
    /// # Safety
    ///
    /// `row < len`; `src` initialised and not aliasing `row`. No other thread
    /// may access `row` concurrently.
    pub unsafe fn assign_copy(&self, row: usize, src: *const u8) {
        debug_assert!(row < self.len);
        // SAFETY: row is initialised; it is destroyed then rebuilt from src
        unsafe {
            let dst = self.ptr(row);
            self.schema.drop_in_place(dst);
            self.schema.copy_into(dst, src);
        }
    }

    /// Destroy the value at `row` and fill the hole with the last element.
    ///
    /// # Safety
    ///
    /// `row < len`.
    pub unsafe fn swap_remove_drop(&mut self, row: usize) {
        debug_assert!(row < self.len);
        // SAFETY: row is initialised
        unsafe { self.schema.drop_in_place(self.ptr(row)) };
        // SAFETY: row is now logically uninitialised
        unsafe { self.fill_hole(row) };
    }

    /// Move the value at `row` to the end of `dst` and fill the hole with the
    /// last element.
    ///
    /// # Safety
    ///
    /// `row < len`; `dst` must hold the same type.
    pub unsafe fn swap_remove_into(&mut self, row: usize, dst: &mut Self) {
        debug_assert!(row < self.len);
        debug_assert_eq!(self.schema.handle(), dst.schema.handle());
        // SAFETY: row is initialised and consumed by the move
        unsafe {
            dst.push_move(self.ptr(row));
            self.fill_hole(row);
        }
    }

    /// Relocate the last element into `row`, which must be uninitialised.
    unsafe fn fill_hole(&mut self, row: usize) {
        self.len -= 1;
        if row < self.len {
            // SAFETY: last is initialised, row is uninitialised, distinct slots
            unsafe {
                self.schema.move_into(self.ptr(row), self.ptr(self.len));
            }
        }
    }

    pub fn reserve(&mut self, additional: usize) {
        let required = self.len.saturating_add(additional);
        if required > self.capacity {
            self.grow(required);
        }
    }

    fn grow(&mut self, min_capacity: usize) {
        let new_capacity = self
            .capacity
            .saturating_mul(2)
            .max(min_capacity)
            .max(4);
        let new_layout = Self::array_layout(&self.schema, new_capacity);

        // SAFETY: new_layout has non-zero size; zero-sized columns never grow
        let new_data = unsafe { std::alloc::alloc(new_layout) };
        let Some(new_data) = NonNull::new(new_data) else {
            std::alloc::handle_alloc_error(new_layout);
        };

        for row in 0..self.len {
            // SAFETY: rows below len are initialised in the old buffer; the new
            // buffer is fresh. Relocation goes through the move hook.
            unsafe {
                let src = self.ptr(row);
                let dst = new_data.as_ptr().add(row * self.schema.size());
                self.schema.move_into(dst, src);
            }
        }

        if self.capacity > 0 {
            // SAFETY: old buffer was allocated with this layout
            unsafe {
                std::alloc::dealloc(
                    self.data.as_ptr(),
                    Self::array_layout(&self.schema, self.capacity),
                );
            }
        }

        self.data = new_data;
        self.capacity = new_capacity;
    }

    /// Destroy every value.
    pub fn clear(&mut self) {
        if self.schema.needs_drop() {
            for row in 0..self.len {
                // SAFETY: rows below len are initialised
                unsafe { self.schema.drop_in_place(self.ptr(row)) };
            }
        }
        self.len = 0;
    }

    fn array_layout(schema: &ComponentSchema, count: usize) -> Layout {
        let size = schema.size().saturating_mul(count);
        Layout::from_size_align(size, schema.align())
            .unwrap_or_else(|_| std::alloc::handle_alloc_error(schema.layout()))
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        self.clear();
        if self.capacity > 0 && self.schema.size() > 0 {
            // SAFETY: data was allocated with this layout
            unsafe {
                std::alloc::dealloc(
                    self.data.as_ptr(),
                    Self::array_layout(&self.schema, self.capacity),
                );
            }
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("type", &self.schema.name())
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::component::{TypeDescription, TypeRegistry};

    fn schema_for(desc: TypeDescription) -> ComponentSchema {
        let mut registry = TypeRegistry::new();
        let handle = registry.register(desc).unwrap();
        registry.schema(handle).unwrap().clone()
    }

    #[derive(Clone)]
    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_push_copy_and_read() {
        let mut col = Column::new(schema_for(TypeDescription::pod::<[f32; 2]>("Vec2")));
        let a = [1.0f32, 2.0];
        let b = [3.0f32, 4.0];
        // SAFETY: values are valid [f32; 2]
        unsafe {
            col.push_copy(a.as_ptr().cast());
            col.push_copy(b.as_ptr().cast());
            assert_eq!(*col.ptr(1).cast::<[f32; 2]>(), b);
        }
        assert_eq!(col.len(), 2);
    }

    #[test]
    fn test_push_default_zero_init() {
        let mut col = Column::new(schema_for(TypeDescription::pod::<u64>("Counter")));
        col.push_default().unwrap();
        // SAFETY: row 0 initialised above
        unsafe { assert_eq!(*col.ptr(0).cast::<u64>(), 0) };
    }

    #[test]
    fn test_push_default_without_hook_fails() {
        let mut col = Column::new(schema_for(TypeDescription::of::<String>("Name")));
        assert!(col.push_default().is_err());
        assert_eq!(col.len(), 0);
    }

    #[test]
    fn test_swap_remove_runs_drop_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut col = Column::new(schema_for(TypeDescription::of::<Counted>("Counted")));

        for _ in 0..3 {
            let value = Counted(Arc::clone(&drops));
            // SAFETY: copy leaves the original valid; it is dropped at scope end
            unsafe { col.push_copy(std::ptr::from_ref(&value).cast()) };
        }
        assert_eq!(drops.load(Ordering::SeqCst), 3);

        // SAFETY: row 0 is valid
        unsafe { col.swap_remove_drop(0) };
        assert_eq!(drops.load(Ordering::SeqCst), 4);
        assert_eq!(col.len(), 2);

        drop(col);
        assert_eq!(drops.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_growth_preserves_values() {
        let mut col = Column::new(schema_for(TypeDescription::of::<String>("Name")));
        for i in 0..20 {
            let mut value = std::mem::ManuallyDrop::new(format!("n{i}"));
            // SAFETY: value is moved into the column and never dropped here
            unsafe { col.push_move(std::ptr::from_mut(&mut *value).cast()) };
        }
        // SAFETY: row 17 exists
        unsafe { assert_eq!(&*col.ptr(17).cast::<String>(), "n17") };
    }

    #[test]
    fn test_swap_remove_into_moves_between_columns() {
        let schema = schema_for(TypeDescription::of::<String>("Name"));
        let mut a = Column::new(schema.clone());
        let mut b = Column::new(schema);
        for s in ["x", "y"] {
            let mut value = std::mem::ManuallyDrop::new(s.to_owned());
            // SAFETY: value ownership moves into the column
            unsafe { a.push_move(std::ptr::from_mut(&mut *value).cast()) };
        }
        // SAFETY: row 0 exists and both columns hold String
        unsafe {
            a.swap_remove_into(0, &mut b);
            assert_eq!(&*a.ptr(0).cast::<String>(), "y");
            assert_eq!(&*b.ptr(0).cast::<String>(), "x");
        }
    }

    #[test]
    fn test_zero_sized_column_tracks_len() {
        let mut col = Column::new(schema_for(TypeDescription::tag("Frozen")));
        col.push_default().unwrap();
        col.push_default().unwrap();
        assert_eq!(col.len(), 2);
        // SAFETY: row 0 exists
        unsafe { col.swap_remove_drop(0) };
        assert_eq!(col.len(), 1);
    }
}
