//! Buffer sizing and naming constants.
//!
//! These are the fundamental parameters of the element-buffer protocol.
//! All other crates import from here.

/// Directory backing all element buffers (tmpfs on every supported target).
pub const SHM_DIR: &str = "/dev/shm";

/// Filename prefix for element buffers and their metadata sidecars.
pub const BUFFER_PREFIX: &str = "txl_";

/// Suffix of the JSON discovery sidecar next to each buffer file.
pub const META_SUFFIX: &str = ".meta";

/// Maximum length of a buffer name.
pub const MAX_NAME_LEN: usize = 64;

/// Maximum number of services a single manager will register.
///
/// The registry is not resized past this point; runtimes hold references
/// into it for their whole lifetime.
pub const MAX_SERVICES: usize = 128;

/// Maximum size of a single element in bytes.
pub const MAX_ELEMENT_SIZE: usize = 64 * 1024;

/// Maximum element count per buffer.
pub const MAX_ELEMENT_COUNT: usize = 16 * 1024 * 1024;

/// CPU cache line size in bytes, used for header alignment.
pub const CACHE_LINE_SIZE: usize = 64;

/// Poll interval for sporadic-trigger and drain waits [ns].
///
/// Bounded so a waiting task re-checks its stop flag at least this often,
/// the same role the original timed semaphore waits played.
pub const POLL_INTERVAL_NS: u64 = 1_000_000;

/// Grace period granted on top of one period when draining a service [ns].
pub const STOP_GRACE_NS: u64 = 1_500_000_000;
