//! Service manager and shared element buffers for real-time skin
//! sensor services.
//!
//! A *service* periodically or sporadically refreshes a named,
//! fixed-layout shared-memory buffer of elements that any process can
//! attach to. This crate provides:
//!
//! - [`Substrate`]: the explicit handle to the tmpfs and monotonic
//!   clock, carrying the process-wide shutdown token
//! - [`ServiceManager`]: registration and lifecycle of this process's
//!   services
//! - [`ServiceClient`]: attach, read, and trigger from the consuming
//!   side
//! - [`discovery`]: enumerate buffers other processes registered
//!
//! ```no_run
//! use std::time::Duration;
//! use taxel::record::TaxelSample;
//! use taxel::tags::ServiceTag;
//! use taxel_services::{ServiceDescriptor, ServiceManager, Substrate, TemporalClass};
//!
//! # fn main() -> taxel_services::ServiceResult<()> {
//! let substrate = Substrate::load()?;
//! let manager = ServiceManager::new(&substrate);
//!
//! let desc = ServiceDescriptor::new(
//!     "palm",
//!     core::mem::size_of::<TaxelSample>(),
//!     64,
//!     TemporalClass::Periodic { period: Duration::from_millis(10) },
//!     ServiceTag::UNTAGGED,
//!     ServiceTag::UNTAGGED,
//! )?;
//! let id = manager.register_periodic(desc)?;
//! manager.start_service(id, Box::new(|buffer| {
//!     // refresh the elements
//!     Ok(())
//! }))?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod descriptor;
pub mod discovery;
pub mod element;
pub mod error;
pub mod manager;
pub mod runtime;
pub mod substrate;

pub use buffer::{BufferMeta, ElementBuffer};
pub use client::{ServiceClient, Ticket};
pub use descriptor::{ServiceDescriptor, TemporalClass};
pub use discovery::BufferInfo;
pub use element::ElementRef;
pub use error::{ServiceError, ServiceResult};
pub use manager::{ServiceId, ServiceManager, ServiceState};
pub use runtime::{InvocationStats, ServiceRoutine};
pub use substrate::Substrate;
