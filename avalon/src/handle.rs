use ash::vk::Handle;
use std::{fmt, mem};

/// A vulkan handle with unique ownership.
///
/// The wrapper panics if dropped while still holding a non-null handle: every
/// owner must either destroy the underlying object or pass the handle on with
/// [`take`](UniqueHandle::take) before letting go of it.
#[repr(transparent)]
pub(crate) struct UniqueHandle<T: Handle + Copy>(T);

impl<T: Handle + Copy> Drop for UniqueHandle<T> {
    fn drop(&mut self) {
        if self.0.as_raw() != 0 {
            panic!("non-null UniqueHandle was dropped")
        }
    }
}

impl<T: Handle + Copy + fmt::Debug> fmt::Debug for UniqueHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<T: Handle + Copy> Default for UniqueHandle<T> {
    fn default() -> Self {
        UniqueHandle::null()
    }
}

impl<T: Handle + Copy> UniqueHandle<T> {
    pub fn null() -> UniqueHandle<T> {
        UniqueHandle(Handle::from_raw(0))
    }

    pub fn new(inner: T) -> UniqueHandle<T> {
        UniqueHandle(inner)
    }

    /// Returns a copy of the handle without releasing ownership.
    pub fn get(&self) -> T {
        self.0
    }

    /// Releases ownership, leaving the null handle behind.
    pub fn take(&mut self) -> T {
        mem::replace(&mut self.0, T::from_raw(0))
    }

    pub fn is_null(&self) -> bool {
        self.0.as_raw() == 0
    }
}
