use core::ops::{Deref, DerefMut};

/// Wraps a value and records whether it has been written through
/// `deref_mut` since the last `sync`.
pub struct Dirty<T> {
    value: T,
    dirty: bool,
}

impl<T> Dirty<T> {
    pub fn new(value: T) -> Dirty<T> {
        Dirty {
            value,
            dirty: false,
        }
    }

    /// A value that still has to be written back at least once.
    pub fn new_dirty(value: T) -> Dirty<T> {
        Dirty { value, dirty: true }
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Mark the value as written back.
    pub fn sync(&mut self) {
        self.dirty = false;
    }
}

impl<T> Deref for Dirty<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Dirty<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.dirty = true;
        &mut self.value
    }
}
