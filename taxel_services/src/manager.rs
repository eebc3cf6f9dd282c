//! Service registry and lifecycle.
//!
//! The manager owns every registered service of a process: its
//! descriptor, its mapped buffer and, once started, its runtime thread.
//! Identifiers are monotonic and never reused; a stopped service is
//! gone, and every later operation on its identifier reports
//! [`ServiceError::UnknownService`].
//!
//! Several services may bind the same buffer name; registrations with a
//! matching layout share one mapping, and the files are unlinked when
//! the last owning reference drops.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use taxel::consts::{MAX_SERVICES, STOP_GRACE_NS};

use crate::buffer::ElementBuffer;
use crate::descriptor::{ServiceDescriptor, TemporalClass};
use crate::error::{ServiceError, ServiceResult};
use crate::runtime::{self, InvocationStats, ServiceRoutine, TaskControl};
use crate::substrate::Substrate;

/// Opaque service identifier. Monotonic per manager, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(u32);

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "svc:{}", self.0)
    }
}

/// Externally observable lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Registered, buffer mapped, no runtime yet.
    Registered,
    /// Runtime thread launched and invoking.
    Running,
    /// Runtime thread launched but suspended.
    Paused,
}

struct ServiceEntry {
    descriptor: ServiceDescriptor,
    buffer: Arc<ElementBuffer>,
    control: Arc<TaskControl>,
    handle: Option<JoinHandle<()>>,
}

/// Registry of this process's services.
pub struct ServiceManager {
    substrate: Substrate,
    next_id: AtomicU32,
    services: Mutex<HashMap<ServiceId, ServiceEntry>>,
    // Live mappings by buffer name, so services binding the same name
    // share one mapping instead of racing on file creation.
    buffers: Mutex<HashMap<String, Weak<ElementBuffer>>>,
}

impl ServiceManager {
    /// Create a manager bound to a loaded substrate handle.
    pub fn new(substrate: &Substrate) -> Self {
        Self {
            substrate: substrate.clone(),
            next_id: AtomicU32::new(1),
            services: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a periodic service. The buffer is created immediately;
    /// nothing runs until [`start_service`](Self::start_service)
    /// attaches a routine.
    ///
    /// # Errors
    /// [`ServiceError::InvalidDescriptor`] if the descriptor is not
    /// periodic; the registration errors of [`register`](Self::register)
    /// otherwise.
    pub fn register_periodic(&self, descriptor: ServiceDescriptor) -> ServiceResult<ServiceId> {
        if !matches!(descriptor.class, TemporalClass::Periodic { .. }) {
            return Err(ServiceError::InvalidDescriptor {
                reason: "descriptor is not periodic".to_string(),
            });
        }
        self.register(descriptor)
    }

    /// Register a sporadic service. See [`register_periodic`](Self::register_periodic).
    pub fn register_sporadic(&self, descriptor: ServiceDescriptor) -> ServiceResult<ServiceId> {
        if !matches!(descriptor.class, TemporalClass::Sporadic { .. }) {
            return Err(ServiceError::InvalidDescriptor {
                reason: "descriptor is not sporadic".to_string(),
            });
        }
        self.register(descriptor)
    }

    /// Register a service of either temporal class.
    ///
    /// A name already bound with the same layout shares the existing
    /// mapping; both services then observe the same underlying data.
    ///
    /// # Errors
    /// [`ServiceError::DuplicateName`] if the buffer name is bound with
    /// an incompatible layout, here or by another process;
    /// [`ServiceError::Registration`] if the registry is full.
    pub fn register(&self, descriptor: ServiceDescriptor) -> ServiceResult<ServiceId> {
        let mut services = self.services.lock();

        if services.len() >= MAX_SERVICES {
            return Err(ServiceError::Registration {
                name: descriptor.buffer_name.clone(),
                reason: format!("registry full ({MAX_SERVICES} services)"),
            });
        }

        let buffer = self.bind_buffer(&descriptor)?;

        let id = ServiceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(%id, buffer = %descriptor.buffer_name, class = ?descriptor.class, "service registered");
        services.insert(
            id,
            ServiceEntry {
                descriptor,
                buffer,
                control: TaskControl::new(),
                handle: None,
            },
        );
        Ok(id)
    }

    // Reuse a live mapping for the name when one exists, otherwise
    // create or attach. Entries whose mapping has dropped are swept so
    // the cache stays bounded by the number of live buffers.
    fn bind_buffer(&self, descriptor: &ServiceDescriptor) -> ServiceResult<Arc<ElementBuffer>> {
        let mut buffers = self.buffers.lock();
        buffers.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = buffers
            .get(&descriptor.buffer_name)
            .and_then(Weak::upgrade)
        {
            if !existing.layout_matches(descriptor) {
                return Err(ServiceError::DuplicateName {
                    name: descriptor.buffer_name.clone(),
                });
            }
            return Ok(existing);
        }

        let buffer = Arc::new(ElementBuffer::create_or_attach(descriptor)?);
        buffers.insert(descriptor.buffer_name.clone(), Arc::downgrade(&buffer));
        Ok(buffer)
    }

    /// Attach `routine` to a registered service and launch its runtime
    /// thread.
    ///
    /// # Errors
    /// [`ServiceError::UnknownService`] for an unregistered or stopped
    /// identifier; [`ServiceError::AlreadyStarted`] if the runtime is
    /// already running. No state changes on failure.
    pub fn start_service(&self, id: ServiceId, routine: ServiceRoutine) -> ServiceResult<()> {
        let mut services = self.services.lock();
        let entry = services
            .get_mut(&id)
            .ok_or(ServiceError::UnknownService { id })?;

        if entry.handle.is_some() {
            return Err(ServiceError::AlreadyStarted { id });
        }

        let handle = match entry.descriptor.class {
            TemporalClass::Periodic { .. } => runtime::spawn_periodic(
                self.substrate.clone(),
                Arc::clone(&entry.buffer),
                routine,
                Arc::clone(&entry.control),
            ),
            TemporalClass::Sporadic { .. } => runtime::spawn_sporadic(
                self.substrate.clone(),
                Arc::clone(&entry.buffer),
                routine,
                Arc::clone(&entry.control),
            ),
        };
        entry.handle = Some(handle);
        Ok(())
    }

    /// Suspend invocations. The buffer stays mapped and alive; sporadic
    /// triggers queue until [`resume_service`](Self::resume_service).
    pub fn pause_service(&self, id: ServiceId) -> ServiceResult<()> {
        let services = self.services.lock();
        let entry = services.get(&id).ok_or(ServiceError::UnknownService { id })?;
        entry.control.pause();
        debug!(%id, "service paused");
        Ok(())
    }

    /// Resume a paused service.
    pub fn resume_service(&self, id: ServiceId) -> ServiceResult<()> {
        let services = self.services.lock();
        let entry = services.get(&id).ok_or(ServiceError::UnknownService { id })?;
        entry.control.resume();
        debug!(%id, "service resumed");
        Ok(())
    }

    /// Stop a service and release its buffer.
    ///
    /// Blocks until the runtime thread drains its current invocation.
    /// The identifier is dead afterwards; it is never reassigned.
    pub fn stop_service(&self, id: ServiceId) -> ServiceResult<()> {
        let entry = self
            .services
            .lock()
            .remove(&id)
            .ok_or(ServiceError::UnknownService { id })?;
        self.drain(id, entry);
        Ok(())
    }

    /// Stop every service, in no particular order.
    pub fn stop_all(&self) {
        let drained: Vec<(ServiceId, ServiceEntry)> =
            self.services.lock().drain().collect();
        for (id, entry) in drained {
            self.drain(id, entry);
        }
    }

    // Joins outside the registry lock; a slow routine must not block
    // registration of unrelated services.
    fn drain(&self, id: ServiceId, entry: ServiceEntry) {
        entry.control.request_stop();
        if let Some(handle) = entry.handle {
            let grace_ns = entry.descriptor.class.interval_ns() + STOP_GRACE_NS;
            let begun = self.substrate.now_ns();
            if handle.join().is_err() {
                warn!(%id, "service runtime panicked");
            }
            let waited = self.substrate.now_ns() - begun;
            if waited > grace_ns {
                warn!(%id, waited_ns = waited, grace_ns, "service drain exceeded its grace period");
            }
        }
        info!(%id, buffer = %entry.descriptor.buffer_name, "service stopped");
        // Dropping the entry drops the owning buffer mapping, which
        // unlinks the files.
    }

    /// Lifecycle state of a service.
    pub fn service_state(&self, id: ServiceId) -> ServiceResult<ServiceState> {
        let services = self.services.lock();
        let entry = services.get(&id).ok_or(ServiceError::UnknownService { id })?;
        Ok(if entry.handle.is_none() {
            ServiceState::Registered
        } else if entry.control.is_paused() {
            ServiceState::Paused
        } else {
            ServiceState::Running
        })
    }

    /// Statistics snapshot for a service.
    pub fn stats(&self, id: ServiceId) -> ServiceResult<InvocationStats> {
        let services = self.services.lock();
        let entry = services.get(&id).ok_or(ServiceError::UnknownService { id })?;
        Ok(entry.control.stats())
    }

    /// The mapped buffer backing a service.
    pub fn buffer(&self, id: ServiceId) -> ServiceResult<Arc<ElementBuffer>> {
        let services = self.services.lock();
        let entry = services.get(&id).ok_or(ServiceError::UnknownService { id })?;
        Ok(Arc::clone(&entry.buffer))
    }

    /// Identifiers of every live service.
    pub fn service_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.services.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of live services.
    pub fn len(&self) -> usize {
        self.services.lock().len()
    }

    /// Whether no services are registered.
    pub fn is_empty(&self) -> bool {
        self.services.lock().is_empty()
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}
