//! End-to-end service lifecycle tests: registration through shutdown,
//! with concurrent readers and triggering clients.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use taxel::record::TaxelSample;
use taxel::tags::ServiceTag;
use taxel_services::{
    ServiceClient, ServiceDescriptor, ServiceError, ServiceManager, Substrate, TemporalClass,
    discovery,
};

fn unique(name: &str) -> String {
    format!("it-{name}-{}", std::process::id())
}

fn periodic(name: &str, period: Duration, size: usize, count: usize) -> ServiceDescriptor {
    ServiceDescriptor::new(
        name,
        size,
        count,
        TemporalClass::Periodic { period },
        ServiceTag::UNTAGGED,
        ServiceTag::UNTAGGED,
    )
    .unwrap()
}

fn sporadic(name: &str, min_interval: Duration, size: usize, count: usize) -> ServiceDescriptor {
    ServiceDescriptor::new(
        name,
        size,
        count,
        TemporalClass::Sporadic { min_interval },
        ServiceTag(21),
        ServiceTag(22),
    )
    .unwrap()
}

#[test]
fn periodic_service_refreshes_on_its_own_clock() {
    let substrate = Substrate::load().unwrap();
    let manager = ServiceManager::new(&substrate);
    let name = unique("cadence");

    let id = manager
        .register_periodic(periodic(&name, Duration::from_millis(5), 8, 1))
        .unwrap();
    manager
        .start_service(
            id,
            Box::new(|buffer| {
                buffer.element::<u64>(0)?.update(|v| *v += 1);
                Ok(())
            }),
        )
        .unwrap();
    thread::sleep(Duration::from_millis(100));

    let stats = manager.stats(id).unwrap();
    // 100 ms at a 5 ms period: generous bounds for a loaded CI host.
    assert!(
        stats.invocation_count >= 5,
        "too few invocations: {}",
        stats.invocation_count
    );
    assert!(
        stats.invocation_count <= 40,
        "pacing did not bound invocations: {}",
        stats.invocation_count
    );

    let client = ServiceClient::connect(&substrate, &name).unwrap();
    let ts_a = client.last_timestamp_ns();
    thread::sleep(Duration::from_millis(20));
    let ts_b = client.last_timestamp_ns();
    assert!(ts_b > ts_a, "timestamp should advance between invocations");

    manager.stop_service(id).unwrap();
}

#[test]
fn snapshots_never_observe_a_torn_write() {
    let substrate = Substrate::load().unwrap();
    let manager = ServiceManager::new(&substrate);
    let name = unique("torn");
    const COUNT: usize = 256;

    // Each invocation writes one generation number into every element;
    // a consistent snapshot therefore holds a single value throughout.
    let id = manager
        .register_periodic(periodic(&name, Duration::from_millis(1), 8, COUNT))
        .unwrap();
    manager
        .start_service(
            id,
            Box::new(|buffer| {
                let generation = buffer.element::<u64>(0)?.get() + 1;
                for i in 0..COUNT {
                    buffer.element::<u64>(i)?.set(generation);
                }
                Ok(())
            }),
        )
        .unwrap();
    thread::sleep(Duration::from_millis(5));

    let client = ServiceClient::connect(&substrate, &name).unwrap();
    let mut consistent_reads = 0u32;
    let deadline = std::time::Instant::now() + Duration::from_millis(200);
    while std::time::Instant::now() < deadline {
        match client.snapshot::<u64>() {
            Ok(snap) => {
                let first = snap[0];
                assert!(
                    snap.iter().all(|&v| v == first),
                    "torn snapshot: mixed generations"
                );
                consistent_reads += 1;
            }
            // Contention is a legal outcome, a torn result is not.
            Err(ServiceError::ReadContention { .. }) => {}
            Err(e) => panic!("unexpected snapshot error: {e}"),
        }
    }
    assert!(consistent_reads > 0, "no snapshot ever succeeded");

    manager.stop_service(id).unwrap();
}

#[test]
fn sporadic_round_trip_with_typed_elements() {
    let substrate = Substrate::load().unwrap();
    let manager = ServiceManager::new(&substrate);
    let name = unique("roundtrip");

    let id = manager
        .register_sporadic(sporadic(
            &name,
            Duration::from_micros(100),
            core::mem::size_of::<TaxelSample>(),
            4,
        ))
        .unwrap();
    manager
        .start_service(
            id,
            Box::new(|buffer| {
                for i in 0..4 {
                    buffer.element::<TaxelSample>(i)?.set(TaxelSample {
                        position: [i as f32, 0.0, 0.0],
                        response: 1.0,
                    });
                }
                Ok(())
            }),
        )
        .unwrap();
    thread::sleep(Duration::from_millis(5));

    let client = ServiceClient::connect(&substrate, &name).unwrap();
    assert_eq!(client.request_tag(), ServiceTag(21));
    assert_eq!(client.response_tag(), ServiceTag(22));

    client.request(Duration::from_secs(1)).unwrap();
    let snap = client.snapshot::<TaxelSample>().unwrap();
    assert_eq!(snap[3].position[0], 3.0);
    assert_eq!(snap[3].response, 1.0);

    manager.stop_service(id).unwrap();
}

#[test]
fn concurrent_triggers_from_many_clients_all_complete() {
    let substrate = Substrate::load().unwrap();
    let manager = ServiceManager::new(&substrate);
    let name = unique("many-clients");

    let invocations = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&invocations);
    let id = manager
        .register_sporadic(sporadic(&name, Duration::from_micros(500), 8, 1))
        .unwrap();
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
    thread::sleep(Duration::from_millis(5));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let substrate = substrate.clone();
        let name = name.clone();
        handles.push(thread::spawn(move || {
            let client = ServiceClient::connect(&substrate, &name).unwrap();
            for _ in 0..5 {
                client.request(Duration::from_secs(2)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = manager.stats(id).unwrap();
    assert_eq!(
        stats.invocation_count + stats.coalesced_triggers,
        20,
        "every trigger accounted for, invoked or coalesced"
    );

    manager.stop_service(id).unwrap();
}

#[test]
fn stopping_a_service_cancels_blocked_waiters() {
    let substrate = Substrate::load().unwrap();
    let manager = ServiceManager::new(&substrate);
    let name = unique("cancel");

    let id = manager
        .register_sporadic(sporadic(&name, Duration::from_millis(1), 8, 1))
        .unwrap();
    manager.start_service(id, Box::new(|_| Ok(()))).unwrap();
    thread::sleep(Duration::from_millis(5));
    // Pause so the trigger queues instead of being answered.
    manager.pause_service(id).unwrap();
    thread::sleep(Duration::from_millis(5));

    let client = ServiceClient::connect(&substrate, &name).unwrap();
    let ticket = client.trigger().unwrap();

    let waiter = thread::spawn(move || client.await_ticket(ticket, Duration::from_secs(5)));
    thread::sleep(Duration::from_millis(10));
    manager.stop_service(id).unwrap();

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(ServiceError::Cancelled { .. })));
}

#[test]
fn shutdown_token_drains_every_runtime() {
    let substrate = Substrate::load().unwrap();
    let manager = ServiceManager::new(&substrate);

    let mut ids = Vec::new();
    for i in 0..3 {
        let id = manager
            .register_periodic(periodic(
                &unique(&format!("shutdown-{i}")),
                Duration::from_millis(2),
                8,
                1,
            ))
            .unwrap();
        manager.start_service(id, Box::new(|_| Ok(()))).unwrap();
        ids.push(id);
    }
    thread::sleep(Duration::from_millis(10));
    for &id in &ids {
        assert!(manager.buffer(id).unwrap().header().is_alive());
    }

    substrate.request_shutdown();
    thread::sleep(Duration::from_millis(50));
    for &id in &ids {
        assert!(
            !manager.buffer(id).unwrap().header().is_alive(),
            "runtime should observe the shutdown token on its own"
        );
    }

    // stop_all after shutdown joins the already-exited threads.
    manager.stop_all();
    assert!(manager.is_empty());
}

#[test]
fn slow_routine_reports_deadline_misses() {
    let substrate = Substrate::load().unwrap();
    let manager = ServiceManager::new(&substrate);
    let name = unique("overrun");

    let id = manager
        .register_periodic(periodic(&name, Duration::from_millis(2), 8, 1))
        .unwrap();
    manager
        .start_service(
            id,
            Box::new(|_| {
                thread::sleep(Duration::from_millis(7));
                Ok(())
            }),
        )
        .unwrap();
    thread::sleep(Duration::from_millis(60));

    let stats = manager.stats(id).unwrap();
    assert!(stats.deadline_misses > 0, "overruns should be counted");
    // Missed slots are skipped, not replayed in a burst.
    assert!(
        stats.invocation_count < 15,
        "catch-up burst detected: {} invocations",
        stats.invocation_count
    );

    manager.stop_service(id).unwrap();
}

#[test]
fn panicking_routine_does_not_corrupt_the_buffer() {
    let substrate = Substrate::load().unwrap();
    let manager = ServiceManager::new(&substrate);
    let name = unique("panic");

    let id = manager
        .register_periodic(periodic(&name, Duration::from_millis(2), 8, 1))
        .unwrap();
    manager
        .start_service(
            id,
            Box::new(|_| {
                panic!("sensor exploded");
            }),
        )
        .unwrap();
    thread::sleep(Duration::from_millis(30));

    // The runtime survives every panic: still alive, still invoking,
    // write_seq left even so readers keep getting snapshots. Transient
    // contention during an invocation window is fine; it must clear.
    let client = ServiceClient::connect(&substrate, &name).unwrap();
    assert!(client.is_alive());
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    loop {
        match client.snapshot::<u64>() {
            Ok(_) => break,
            Err(ServiceError::ReadContention { .. }) if std::time::Instant::now() < deadline => {}
            Err(e) => panic!("snapshot permanently broken: {e}"),
        }
    }

    let stats = manager.stats(id).unwrap();
    assert!(stats.routine_errors > 0);
    assert_eq!(stats.invocation_count, stats.routine_errors);

    manager.stop_service(id).unwrap();
    assert!(!client.is_alive(), "status must drop to zero on stop");
}

#[test]
fn started_service_is_discoverable_as_alive() {
    let substrate = Substrate::load().unwrap();
    let manager = ServiceManager::new(&substrate);
    let name = unique("discover");

    let id = manager
        .register_periodic(periodic(&name, Duration::from_millis(5), 16, 2))
        .unwrap();
    manager.start_service(id, Box::new(|_| Ok(()))).unwrap();
    thread::sleep(Duration::from_millis(10));

    let listed = discovery::list().unwrap();
    let info = listed
        .iter()
        .find(|i| i.meta.name == name)
        .expect("started buffer should be listed");
    assert!(info.alive);
    assert_eq!(info.meta.element_size, 16);
    assert_eq!(info.meta.owner_pid, std::process::id());

    manager.stop_service(id).unwrap();
    assert!(!discovery::list().unwrap().iter().any(|i| i.meta.name == name));
}

#[test]
fn every_element_is_processed_each_invocation() {
    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    #[repr(C)]
    struct Coord {
        x: f32,
        y: f32,
    }
    unsafe impl taxel::record::Record for Coord {}

    let substrate = Substrate::load().unwrap();
    let manager = ServiceManager::new(&substrate);
    let name = unique("elems");

    let desc = ServiceDescriptor::new(
        &name,
        core::mem::size_of::<Coord>(),
        10,
        TemporalClass::Sporadic {
            min_interval: Duration::from_micros(100),
        },
        ServiceTag(1),
        ServiceTag(2),
    )
    .unwrap();
    let id = manager.register_sporadic(desc).unwrap();

    // Seed known values before the first invocation.
    let buffer = manager.buffer(id).unwrap();
    for i in 0..10 {
        buffer.element::<Coord>(i).unwrap().set(Coord {
            x: i as f32,
            y: 10.0 + i as f32,
        });
    }

    manager
        .start_service(
            id,
            Box::new(|buffer| {
                for i in 0..10 {
                    buffer.element::<Coord>(i)?.update(|c| {
                        c.x += 1.0;
                        c.y += 2.0;
                    });
                }
                Ok(())
            }),
        )
        .unwrap();
    thread::sleep(Duration::from_millis(5));
    let client = ServiceClient::connect(&substrate, &name).unwrap();
    client.request(Duration::from_secs(1)).unwrap();

    let snap = client.snapshot::<Coord>().unwrap();
    for (i, coord) in snap.iter().enumerate() {
        assert_eq!(coord.x, i as f32 + 1.0);
        assert_eq!(coord.y, 10.0 + i as f32 + 2.0);
    }

    manager.stop_service(id).unwrap();
}

#[test]
fn identical_descriptors_get_distinct_ids_on_one_buffer() {
    let substrate = Substrate::load().unwrap();
    let manager = ServiceManager::new(&substrate);
    let name = unique("twins");

    let a = manager
        .register_sporadic(sporadic(&name, Duration::from_millis(1), 8, 2))
        .unwrap();
    let b = manager
        .register_sporadic(sporadic(&name, Duration::from_millis(1), 8, 2))
        .unwrap();
    assert_ne!(a, b);

    manager.buffer(a).unwrap().element::<u64>(0).unwrap().set(7);
    assert_eq!(manager.buffer(b).unwrap().element::<u64>(0).unwrap().get(), 7);
}

#[test]
fn manager_drop_stops_outstanding_services() {
    let substrate = Substrate::load().unwrap();
    let name = unique("drop");

    {
        let manager = ServiceManager::new(&substrate);
        let id = manager
            .register_periodic(periodic(&name, Duration::from_millis(2), 8, 1))
            .unwrap();
        manager.start_service(id, Box::new(|_| Ok(()))).unwrap();
        thread::sleep(Duration::from_millis(10));
    }

    // Buffer files are gone once the manager is dropped.
    assert!(ServiceClient::connect(&substrate, &name).is_err());
}
