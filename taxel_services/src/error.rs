//! Error types for service registration, lifecycle and element access.

use thiserror::Error;

use crate::manager::ServiceId;

/// Errors surfaced by the service manager and the element accessor.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The real-time substrate (tmpfs, monotonic clock) is not reachable.
    #[error("substrate unavailable: {reason}")]
    SubstrateUnavailable {
        /// What failed during `load()`
        reason: String,
    },

    /// A descriptor parameter failed validation.
    #[error("invalid descriptor: {reason}")]
    InvalidDescriptor {
        /// Which parameter and why
        reason: String,
    },

    /// The buffer name is already bound with an incompatible layout.
    #[error("buffer '{name}' already exists with a different element layout")]
    DuplicateName {
        /// Buffer name
        name: String,
    },

    /// The substrate rejected the registration.
    #[error("registration of '{name}' failed: {reason}")]
    Registration {
        /// Buffer name
        name: String,
        /// Rejection cause
        reason: String,
    },

    /// No service is registered under this identifier.
    #[error("unknown service: {id}")]
    UnknownService {
        /// The offending identifier
        id: ServiceId,
    },

    /// The service already has a running execution context.
    #[error("service {id} is already started")]
    AlreadyStarted {
        /// The offending identifier
        id: ServiceId,
    },

    /// Element index outside `[0, element_count)`.
    #[error("element index {index} out of range (count {count})")]
    OutOfRange {
        /// Requested index
        index: usize,
        /// Buffer capacity
        count: usize,
    },

    /// The buffer is not mapped, corrupt, or its layout disagrees with
    /// the requested record type.
    #[error("buffer '{name}' unavailable: {reason}")]
    BufferUnavailable {
        /// Buffer name
        name: String,
        /// Why the view could not be produced
        reason: String,
    },

    /// A user routine surfaced an error from one invocation.
    #[error("service routine failed: {reason}")]
    RoutineFailed {
        /// Routine-provided cause
        reason: String,
    },

    /// A blocking wait was abandoned: shutdown requested or service dead.
    #[error("operation cancelled: {reason}")]
    Cancelled {
        /// Why the wait stopped
        reason: String,
    },

    /// A consistent read could not be obtained under write contention.
    #[error("read contention on buffer '{name}' - retry recommended")]
    ReadContention {
        /// Buffer name
        name: String,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("system call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },

    /// Metadata serialization/deserialization error
    #[error("metadata error: {source}")]
    Meta {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;
