//! The record schema shared by every buffer participant.
//!
//! Element buffers hold fixed-size binary records. Rather than leaving
//! the layout implicit in application code, every participant shares a
//! `#[repr(C)]` struct implementing [`Record`]; the accessor checks its
//! size against the buffer's declared element size before handing out a
//! typed view.

/// Marker trait for types usable as buffer elements.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no pointers or references,
/// and be valid for any bit pattern (the buffer is shared memory another
/// process may have written arbitrarily).
pub unsafe trait Record: Copy + Send + Sync + 'static {}

unsafe impl Record for u8 {}
unsafe impl Record for u16 {}
unsafe impl Record for u32 {}
unsafe impl Record for u64 {}
unsafe impl Record for f32 {}
unsafe impl Record for f64 {}

/// One taxel sample: position of the sensing point plus its response.
///
/// 16 bytes, no internal padding.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct TaxelSample {
    /// Sensor position in the skin frame [m].
    pub position: [f32; 3],
    /// Measured response, normalized.
    pub response: f32,
}

unsafe impl Record for TaxelSample {}
