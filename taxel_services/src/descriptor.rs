//! Service descriptors: validated registration parameters.

use std::time::Duration;

use taxel::consts::{MAX_ELEMENT_COUNT, MAX_ELEMENT_SIZE, MAX_NAME_LEN};
use taxel::header::BufferMode;
use taxel::tags::ServiceTag;

use crate::error::{ServiceError, ServiceResult};

/// Temporal class of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalClass {
    /// Invoked at a fixed period.
    Periodic {
        /// Invocation period.
        period: Duration,
    },
    /// Invoked on triggers, no more often than `min_interval`.
    Sporadic {
        /// Minimum inter-arrival time between invocations.
        min_interval: Duration,
    },
}

impl TemporalClass {
    /// The header mode word for this class.
    pub(crate) fn buffer_mode(&self) -> BufferMode {
        match self {
            TemporalClass::Periodic { .. } => BufferMode::Periodic,
            TemporalClass::Sporadic { .. } => BufferMode::Sporadic,
        }
    }

    /// Period or minimum inter-arrival time [ns].
    pub(crate) fn interval_ns(&self) -> u64 {
        match self {
            TemporalClass::Periodic { period } => period.as_nanos() as u64,
            TemporalClass::Sporadic { min_interval } => min_interval.as_nanos() as u64,
        }
    }
}

/// Validated parameters for registering a service.
///
/// Immutable once registered; re-registration requires a new descriptor.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    /// System-wide buffer name.
    pub buffer_name: String,
    /// Size of one element in bytes.
    pub element_size: usize,
    /// Number of elements in the buffer.
    pub element_count: usize,
    /// Temporal class of the service.
    pub class: TemporalClass,
    /// Application-defined request tag.
    pub request_tag: ServiceTag,
    /// Application-defined response tag.
    pub response_tag: ServiceTag,
}

impl ServiceDescriptor {
    /// Build a descriptor, validating every parameter.
    ///
    /// # Errors
    /// [`ServiceError::InvalidDescriptor`] on an empty or over-long name,
    /// a zero element size/count, a zero period, or sizes beyond the
    /// protocol limits.
    pub fn new(
        buffer_name: impl Into<String>,
        element_size: usize,
        element_count: usize,
        class: TemporalClass,
        request_tag: ServiceTag,
        response_tag: ServiceTag,
    ) -> ServiceResult<Self> {
        let buffer_name = buffer_name.into();

        if buffer_name.is_empty() {
            return Err(invalid("buffer name is empty"));
        }
        if buffer_name.len() > MAX_NAME_LEN {
            return Err(invalid("buffer name too long"));
        }
        if buffer_name
            .bytes()
            .any(|b| !(b.is_ascii_alphanumeric() || b == b'_' || b == b'-'))
        {
            return Err(invalid("buffer name must be [A-Za-z0-9_-]"));
        }
        if element_size == 0 {
            return Err(invalid("element size is zero"));
        }
        if element_size > MAX_ELEMENT_SIZE {
            return Err(invalid("element size beyond limit"));
        }
        if element_count == 0 {
            return Err(invalid("element count is zero"));
        }
        if element_count > MAX_ELEMENT_COUNT {
            return Err(invalid("element count beyond limit"));
        }
        match class {
            TemporalClass::Periodic { period } if period.is_zero() => {
                return Err(invalid("period is zero"));
            }
            // A zero minimum inter-arrival time is allowed: triggers are
            // then bounded only by invocation duration.
            _ => {}
        }

        Ok(Self {
            buffer_name,
            element_size,
            element_count,
            class,
            request_tag,
            response_tag,
        })
    }

    /// Total mapped size of the backing buffer, header included.
    pub fn mapped_size(&self) -> usize {
        taxel::header::HEADER_SIZE + self.element_size * self.element_count
    }
}

fn invalid(reason: &str) -> ServiceError {
    ServiceError::InvalidDescriptor {
        reason: reason.to_string(),
    }
}
