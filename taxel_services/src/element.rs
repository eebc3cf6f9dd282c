//! Typed element views.

use std::marker::PhantomData;
use std::ptr;

use taxel::record::Record;

use crate::buffer::ElementBuffer;

/// Borrowed, typed view of one element in a buffer.
///
/// Reads and writes are volatile: the other side of the mapping may be
/// a different process and the compiler must not cache the memory.
/// Consistency across multiple elements is the seqlock's job, not this
/// view's; writers are expected to be inside an invocation window.
#[derive(Debug)]
pub struct ElementRef<'a, T: Record> {
    ptr: *mut T,
    _buffer: PhantomData<&'a ElementBuffer>,
}

impl<'a, T: Record> ElementRef<'a, T> {
    pub(crate) fn new(_buffer: &'a ElementBuffer, ptr: *mut T) -> Self {
        Self {
            ptr,
            _buffer: PhantomData,
        }
    }

    /// Read the element.
    #[inline]
    pub fn get(&self) -> T {
        unsafe { ptr::read_volatile(self.ptr) }
    }

    /// Overwrite the element.
    #[inline]
    pub fn set(&self, value: T) {
        unsafe { ptr::write_volatile(self.ptr, value) }
    }

    /// Read-modify-write the element in place.
    #[inline]
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut value = self.get();
        f(&mut value);
        self.set(value);
    }
}
