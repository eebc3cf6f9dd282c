//! Client side of a service: attach, read, trigger.
//!
//! A client maps an existing buffer without taking ownership. For
//! periodic services it reads consistent snapshots; for sporadic
//! services it additionally triggers invocations and waits for them.
//!
//! Triggering is a ticket protocol over the header counters: a trigger
//! bumps `request_seq` and the resulting ticket is answered once
//! `response_seq` reaches it. The runtime answers coalesced batches, so
//! several concurrent tickets may be released by one invocation.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use taxel::consts::POLL_INTERVAL_NS;
use taxel::header::BufferMode;
use taxel::record::Record;
use taxel::tags::ServiceTag;

use crate::buffer::ElementBuffer;
use crate::element::ElementRef;
use crate::error::{ServiceError, ServiceResult};
use crate::substrate::Substrate;

/// Receipt for one trigger, redeemed with [`ServiceClient::await_ticket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

/// Connection to a service's buffer from the consuming side.
pub struct ServiceClient {
    substrate: Substrate,
    buffer: ElementBuffer,
}

impl ServiceClient {
    /// Attach to the named buffer.
    ///
    /// # Errors
    /// [`ServiceError::BufferUnavailable`] if no valid buffer of this
    /// name exists.
    pub fn connect(substrate: &Substrate, name: &str) -> ServiceResult<Self> {
        let buffer = ElementBuffer::attach(name)?;
        Ok(Self {
            substrate: substrate.clone(),
            buffer,
        })
    }

    /// The underlying mapped buffer.
    pub fn buffer(&self) -> &ElementBuffer {
        &self.buffer
    }

    /// Whether a runtime is currently driving the service.
    pub fn is_alive(&self) -> bool {
        self.buffer.header().is_alive()
    }

    /// Temporal class of the service, `None` if the header is corrupt.
    pub fn mode(&self) -> Option<BufferMode> {
        self.buffer.header().buffer_mode()
    }

    /// Period or minimum inter-arrival time [ns].
    pub fn period_ns(&self) -> u64 {
        self.buffer.header().period_ns
    }

    /// Application-defined request tag.
    pub fn request_tag(&self) -> ServiceTag {
        ServiceTag(self.buffer.header().request_tag)
    }

    /// Application-defined response tag.
    pub fn response_tag(&self) -> ServiceTag {
        ServiceTag(self.buffer.header().response_tag)
    }

    /// Monotonic time of the last completed invocation [ns].
    pub fn last_timestamp_ns(&self) -> u64 {
        self.buffer.header().timestamp_ns.load(Ordering::Acquire)
    }

    /// Typed view of one element. See [`ElementBuffer::element`].
    pub fn element<T: Record>(&self, index: usize) -> ServiceResult<ElementRef<'_, T>> {
        self.buffer.element(index)
    }

    /// Consistent snapshot of the element array. See [`ElementBuffer::snapshot`].
    pub fn snapshot<T: Record>(&self) -> ServiceResult<Vec<T>> {
        self.buffer.snapshot()
    }

    /// Trigger a sporadic invocation without waiting for it.
    ///
    /// # Errors
    /// [`ServiceError::BufferUnavailable`] on a periodic buffer;
    /// [`ServiceError::Cancelled`] if the service is not alive.
    pub fn trigger(&self) -> ServiceResult<Ticket> {
        let header = self.buffer.header();
        match header.buffer_mode() {
            Some(BufferMode::Sporadic) => {}
            _ => {
                return Err(ServiceError::BufferUnavailable {
                    name: self.buffer.name().to_string(),
                    reason: "buffer does not accept triggers (not sporadic)".to_string(),
                });
            }
        }
        if !header.is_alive() {
            return Err(ServiceError::Cancelled {
                reason: "service is not running".to_string(),
            });
        }
        let ticket = header.request_seq.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(Ticket(ticket))
    }

    /// Wait until the invocation behind `ticket` completes.
    ///
    /// # Errors
    /// [`ServiceError::Cancelled`] on timeout, on process shutdown, or
    /// if the service stops before answering.
    pub fn await_ticket(&self, ticket: Ticket, timeout: Duration) -> ServiceResult<()> {
        let header = self.buffer.header();
        let deadline = self.substrate.now_ns() + timeout.as_nanos() as u64;
        let poll = Duration::from_nanos(POLL_INTERVAL_NS);

        loop {
            // Answer first: a service that died after answering still
            // answered.
            if header.response_seq.load(Ordering::Acquire) >= ticket.0 {
                return Ok(());
            }
            if !header.is_alive() {
                return Err(ServiceError::Cancelled {
                    reason: "service stopped before answering".to_string(),
                });
            }
            if self.substrate.is_shutdown_requested() {
                return Err(ServiceError::Cancelled {
                    reason: "shutdown requested".to_string(),
                });
            }
            if self.substrate.now_ns() > deadline {
                return Err(ServiceError::Cancelled {
                    reason: format!("timed out after {timeout:?}"),
                });
            }
            thread::sleep(poll);
        }
    }

    /// Trigger an invocation and wait for it to complete.
    pub fn request(&self, timeout: Duration) -> ServiceResult<()> {
        let ticket = self.trigger()?;
        self.await_ticket(ticket, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ServiceDescriptor, TemporalClass};
    use crate::manager::ServiceManager;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use taxel::tags::ServiceTag;

    fn unique(name: &str) -> String {
        format!("{name}-{}", std::process::id())
    }

    fn sporadic_desc(name: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(
            name,
            8,
            1,
            TemporalClass::Sporadic {
                min_interval: Duration::from_micros(100),
            },
            ServiceTag(11),
            ServiceTag(12),
        )
        .unwrap()
    }

    #[test]
    fn request_runs_the_routine() {
        let substrate = Substrate::load().unwrap();
        let manager = ServiceManager::new(&substrate);
        let name = unique("cli-req");

        let invocations = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&invocations);
        let id = manager.register_sporadic(sporadic_desc(&name)).unwrap();
        manager
            .start_service(
                id,
                Box::new(move |buffer| {
                    let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                    buffer.element::<u64>(0)?.set(n);
                    Ok(())
                }),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let client = ServiceClient::connect(&substrate, &name).unwrap();
        assert_eq!(client.mode(), Some(BufferMode::Sporadic));
        assert_eq!(client.request_tag(), ServiceTag(11));

        client.request(Duration::from_secs(1)).unwrap();
        assert!(client.element::<u64>(0).unwrap().get() >= 1);
        assert!(client.last_timestamp_ns() > 0);
    }

    #[test]
    fn burst_of_triggers_all_released() {
        let substrate = Substrate::load().unwrap();
        let manager = ServiceManager::new(&substrate);
        let name = unique("cli-burst");

        let id = manager.register_sporadic(sporadic_desc(&name)).unwrap();
        manager.start_service(id, Box::new(|_| Ok(()))).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let client = ServiceClient::connect(&substrate, &name).unwrap();
        let tickets: Vec<Ticket> = (0..8).map(|_| client.trigger().unwrap()).collect();
        for ticket in tickets {
            client.await_ticket(ticket, Duration::from_secs(1)).unwrap();
        }
        // Fewer invocations than triggers once any were coalesced.
        let stats = manager.stats(id).unwrap();
        assert!(stats.invocation_count >= 1);
        assert_eq!(
            stats.invocation_count + stats.coalesced_triggers,
            8,
            "every trigger is either invoked or coalesced"
        );
    }

    #[test]
    fn trigger_on_periodic_buffer_rejected() {
        let substrate = Substrate::load().unwrap();
        let manager = ServiceManager::new(&substrate);
        let name = unique("cli-per");

        let desc = ServiceDescriptor::new(
            &name,
            8,
            1,
            TemporalClass::Periodic {
                period: Duration::from_millis(5),
            },
            ServiceTag::UNTAGGED,
            ServiceTag::UNTAGGED,
        )
        .unwrap();
        let id = manager.register_periodic(desc).unwrap();
        manager.start_service(id, Box::new(|_| Ok(()))).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let client = ServiceClient::connect(&substrate, &name).unwrap();
        assert!(matches!(
            client.trigger(),
            Err(ServiceError::BufferUnavailable { .. })
        ));
    }

    #[test]
    fn trigger_on_stopped_service_cancelled() {
        let substrate = Substrate::load().unwrap();
        let manager = ServiceManager::new(&substrate);
        let name = unique("cli-dead");

        // Registered but never started: the buffer exists but stays dead.
        let _id = manager.register_sporadic(sporadic_desc(&name)).unwrap();
        let client = ServiceClient::connect(&substrate, &name).unwrap();
        assert!(!client.is_alive());
        assert!(matches!(
            client.trigger(),
            Err(ServiceError::Cancelled { .. })
        ));
    }

    #[test]
    fn await_times_out_on_paused_service() {
        let substrate = Substrate::load().unwrap();
        let manager = ServiceManager::new(&substrate);
        let name = unique("cli-timeout");

        let id = manager.register_sporadic(sporadic_desc(&name)).unwrap();
        manager.start_service(id, Box::new(|_| Ok(()))).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        manager.pause_service(id).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let client = ServiceClient::connect(&substrate, &name).unwrap();
        let ticket = client.trigger().unwrap();
        let err = client
            .await_ticket(ticket, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled { .. }));

        // Resuming answers the queued trigger.
        manager.resume_service(id).unwrap();
        client
            .await_ticket(ticket, Duration::from_secs(1))
            .unwrap();
    }
}
