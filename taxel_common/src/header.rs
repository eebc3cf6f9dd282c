//! Element buffer header — 128 bytes, cache-line aligned.
//!
//! Every element buffer starts with this header. The registering side
//! populates the immutable fields once at creation; the service runtime
//! and connected clients communicate through the atomic fields.
//!
//! ## Lock-free protocol
//!
//! `write_seq` uses the odd/even protocol:
//! - Odd = invocation in progress (reader must retry)
//! - Even = committed (reader can safely read the element array)
//!
//! `request_seq`/`response_seq` carry sporadic signalling: a client bumps
//! `request_seq` to trigger an invocation and waits for `response_seq` to
//! catch up with its ticket. The runtime advances `response_seq` past all
//! requests it observed, so coalesced triggers release every waiter.

use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::consts::CACHE_LINE_SIZE;

/// Magic bytes identifying a valid element buffer: `"TAXELEB\0"`.
pub const BUFFER_MAGIC: [u8; 8] = *b"TAXELEB\0";

/// Size of the header prepended to the element array.
pub const HEADER_SIZE: usize = 2 * CACHE_LINE_SIZE;

/// Temporal class discriminant stored in the header `mode` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum BufferMode {
    /// Routine invoked on a fixed clock.
    Periodic = 1,
    /// Routine invoked on triggers, rate-bounded.
    Sporadic = 2,
}

impl BufferMode {
    /// Convert from the raw header word. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u64(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Periodic),
            2 => Some(Self::Sporadic),
            _ => None,
        }
    }
}

/// Shared header at the start of every element buffer.
#[repr(C, align(64))]
pub struct BufferHeader {
    /// Magic bytes: must be [`BUFFER_MAGIC`].
    pub magic: [u8; 8],
    /// Size of one element in bytes. Fixed at creation.
    pub element_size: u64,
    /// Number of elements. Fixed at creation.
    pub element_count: u64,
    /// Temporal class, raw [`BufferMode`] value.
    pub mode: u64,
    /// Period (periodic) or minimum inter-arrival time (sporadic) [ns].
    pub period_ns: u64,
    /// Number of runtimes currently driving this buffer. Several
    /// services may share one buffer; the buffer is alive while any of
    /// them runs.
    pub status: AtomicU64,
    /// Monotonic time of the last completed invocation [ns].
    pub timestamp_ns: AtomicU64,
    /// Odd/even invocation framing counter.
    pub write_seq: AtomicU64,
    /// Sporadic trigger counter, bumped by clients.
    pub request_seq: AtomicU64,
    /// Last request sequence the runtime has answered.
    pub response_seq: AtomicU64,
    /// Application-defined request tag.
    pub request_tag: u32,
    /// Application-defined response tag.
    pub response_tag: u32,
    /// Padding to fill two cache lines.
    _padding: [u8; 40],
}

const_assert_eq!(core::mem::size_of::<BufferHeader>(), HEADER_SIZE);
const_assert_eq!(core::mem::align_of::<BufferHeader>(), CACHE_LINE_SIZE);

impl BufferHeader {
    /// Create a header for a fresh buffer. Status starts dead; a runtime
    /// flips it alive when the service starts.
    pub fn new(
        element_size: u64,
        element_count: u64,
        mode: BufferMode,
        period_ns: u64,
        request_tag: u32,
        response_tag: u32,
    ) -> Self {
        Self {
            magic: BUFFER_MAGIC,
            element_size,
            element_count,
            mode: mode as u64,
            period_ns,
            status: AtomicU64::new(0),
            timestamp_ns: AtomicU64::new(0),
            write_seq: AtomicU64::new(0),
            request_seq: AtomicU64::new(0),
            response_seq: AtomicU64::new(0),
            request_tag,
            response_tag,
            _padding: [0u8; 40],
        }
    }

    /// Validate the magic bytes.
    #[inline]
    pub fn is_magic_valid(&self) -> bool {
        self.magic == BUFFER_MAGIC
    }

    /// Decoded temporal class, `None` if the mode word is corrupt.
    #[inline]
    pub fn buffer_mode(&self) -> Option<BufferMode> {
        BufferMode::from_u64(self.mode)
    }

    /// Whether any runtime is currently driving this buffer.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.status.load(Ordering::Acquire) > 0
    }

    /// Whether an invocation is in progress (write_seq odd).
    #[inline]
    pub fn is_invocation_in_progress(&self) -> bool {
        self.write_seq.load(Ordering::Acquire) % 2 == 1
    }
}
