//! Service runtimes: the threads that drive registered buffers.
//!
//! Each started service owns one runtime thread. Periodic runtimes pace
//! invocations with absolute-time sleeps on `CLOCK_MONOTONIC` so pacing
//! never drifts; sporadic runtimes poll the header trigger counter at a
//! bounded interval and answer all outstanding requests with a single
//! invocation (coalesced release).
//!
//! An invocation is framed by the header `write_seq` odd/even protocol:
//! bump to odd, run the routine, bump to even, publish the timestamp.
//! Routine errors never kill the runtime; they are logged and counted.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use taxel::consts::POLL_INTERVAL_NS;

use crate::buffer::ElementBuffer;
use crate::error::ServiceResult;
use crate::substrate::Substrate;

/// A service routine: invoked once per slot (periodic) or per coalesced
/// trigger batch (sporadic), inside an invocation window on `buffer`.
pub type ServiceRoutine = Box<dyn FnMut(&ElementBuffer) -> ServiceResult<()> + Send>;

/// SCHED_FIFO priority for promoted service runtimes.
#[cfg(feature = "rt")]
const RT_PRIORITY: i32 = 60;

/// O(1) per-invocation statistics, updated without allocation.
#[derive(Debug, Clone)]
pub struct InvocationStats {
    /// Total completed invocations.
    pub invocation_count: u64,
    /// Last invocation duration [ns].
    pub last_ns: i64,
    /// Minimum invocation duration [ns].
    pub min_ns: i64,
    /// Maximum invocation duration [ns].
    pub max_ns: i64,
    /// Running sum for average computation.
    pub sum_ns: i64,
    /// Periodic slots that overran their deadline.
    pub deadline_misses: u64,
    /// Sporadic triggers answered together with an earlier one.
    pub coalesced_triggers: u64,
    /// Invocations whose routine returned an error.
    pub routine_errors: u64,
}

impl InvocationStats {
    /// Zeroed stats.
    pub const fn new() -> Self {
        Self {
            invocation_count: 0,
            last_ns: 0,
            min_ns: i64::MAX,
            max_ns: 0,
            sum_ns: 0,
            deadline_misses: 0,
            coalesced_triggers: 0,
            routine_errors: 0,
        }
    }

    #[inline]
    fn record(&mut self, duration_ns: i64) {
        self.invocation_count += 1;
        self.last_ns = duration_ns;
        if duration_ns < self.min_ns {
            self.min_ns = duration_ns;
        }
        if duration_ns > self.max_ns {
            self.max_ns = duration_ns;
        }
        self.sum_ns += duration_ns;
    }

    /// Average invocation duration [ns], 0 before the first invocation.
    #[inline]
    pub fn avg_ns(&self) -> i64 {
        if self.invocation_count == 0 {
            0
        } else {
            self.sum_ns / self.invocation_count as i64
        }
    }
}

impl Default for InvocationStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared control block between a runtime thread and its manager.
pub struct TaskControl {
    paused: AtomicBool,
    stop: AtomicBool,
    stats: Mutex<InvocationStats>,
}

impl TaskControl {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            paused: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            stats: Mutex::new(InvocationStats::new()),
        })
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn should_stop(&self, substrate: &Substrate) -> bool {
        self.stop.load(Ordering::SeqCst) || substrate.is_shutdown_requested()
    }

    /// Snapshot of the runtime's statistics.
    pub fn stats(&self) -> InvocationStats {
        self.stats.lock().clone()
    }
}

/// Promote the current thread for deterministic invocation timing.
///
/// No-op without the `rt` feature.
#[cfg(feature = "rt")]
fn rt_promote(name: &str) {
    use nix::sys::mman::{MlockallFlags, mlockall};

    if let Err(e) = mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE) {
        warn!(service = name, error = %e, "mlockall failed, continuing unpromoted");
    }
    let param = libc::sched_param {
        sched_priority: RT_PRIORITY,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(service = name, error = %err, "SCHED_FIFO promotion failed, continuing unpromoted");
    }
}

#[cfg(not(feature = "rt"))]
fn rt_promote(_name: &str) {}

/// One invocation: odd/even framing around the routine, timestamp after.
///
/// The routine runs under `catch_unwind` so a panic cannot leave
/// `write_seq` odd or skip the status decrement at runtime exit; a
/// panicked invocation is counted like a failed one and the loop
/// continues.
fn invoke(
    substrate: &Substrate,
    buffer: &ElementBuffer,
    routine: &mut ServiceRoutine,
    control: &TaskControl,
) {
    let header = buffer.header();
    let start = substrate.now_ns();

    header.write_seq.fetch_add(1, Ordering::Release);
    let result = catch_unwind(AssertUnwindSafe(|| routine(buffer)));
    header.write_seq.fetch_add(1, Ordering::Release);

    let end = substrate.now_ns();
    header.timestamp_ns.store(end, Ordering::Release);

    let mut stats = control.stats.lock();
    stats.record((end - start) as i64);
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            stats.routine_errors += 1;
            drop(stats);
            warn!(buffer = buffer.name(), error = %e, "service routine failed");
        }
        Err(_) => {
            stats.routine_errors += 1;
            drop(stats);
            warn!(buffer = buffer.name(), "service routine panicked");
        }
    }
}

/// Sleep until the absolute monotonic instant `deadline_ns`.
///
/// With the `rt` feature this is a drift-free `clock_nanosleep` with
/// `TIMER_ABSTIME`; otherwise a relative sleep computed from the clock.
#[cfg(feature = "rt")]
fn sleep_until(_substrate: &Substrate, deadline_ns: u64) {
    use nix::sys::time::TimeSpec;
    use nix::time::{ClockId, ClockNanosleepFlags, clock_nanosleep};

    let target = TimeSpec::new(
        (deadline_ns / 1_000_000_000) as i64,
        (deadline_ns % 1_000_000_000) as i64,
    );
    let _ = clock_nanosleep(
        ClockId::CLOCK_MONOTONIC,
        ClockNanosleepFlags::TIMER_ABSTIME,
        &target,
    );
}

#[cfg(not(feature = "rt"))]
fn sleep_until(substrate: &Substrate, deadline_ns: u64) {
    let now = substrate.now_ns();
    if deadline_ns > now {
        thread::sleep(Duration::from_nanos(deadline_ns - now));
    }
}

const POLL_INTERVAL: Duration = Duration::from_nanos(POLL_INTERVAL_NS);

/// Spawn the runtime thread for a periodic service.
pub(crate) fn spawn_periodic(
    substrate: Substrate,
    buffer: Arc<ElementBuffer>,
    mut routine: ServiceRoutine,
    control: Arc<TaskControl>,
) -> JoinHandle<()> {
    let thread_name = format!("txl-per-{}", buffer.name());
    thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            rt_promote(buffer.name());
            let header = buffer.header();
            let period_ns = header.period_ns;
            header.status.fetch_add(1, Ordering::Release);
            info!(buffer = buffer.name(), period_ns, "periodic service running");

            let mut next_wake = substrate.now_ns() + period_ns;
            loop {
                if control.should_stop(&substrate) {
                    break;
                }
                if control.is_paused() {
                    thread::sleep(POLL_INTERVAL);
                    // Re-anchor on resume so the backlog is not replayed.
                    next_wake = substrate.now_ns() + period_ns;
                    continue;
                }

                invoke(&substrate, &buffer, &mut routine, &control);

                let now = substrate.now_ns();
                next_wake += period_ns;
                if now > next_wake {
                    // Missed one or more slots: skip them rather than
                    // bursting to catch up, and count the miss.
                    let missed = (now - next_wake) / period_ns + 1;
                    next_wake += missed * period_ns;
                    let mut stats = control.stats.lock();
                    stats.deadline_misses += missed;
                    drop(stats);
                    warn!(
                        buffer = buffer.name(),
                        missed,
                        "periodic service overran its deadline"
                    );
                }
                sleep_until(&substrate, next_wake);
            }

            header.status.fetch_sub(1, Ordering::Release);
            debug!(buffer = buffer.name(), "periodic service stopped");
        })
        .expect("spawning a service runtime thread")
}

/// Spawn the runtime thread for a sporadic service.
pub(crate) fn spawn_sporadic(
    substrate: Substrate,
    buffer: Arc<ElementBuffer>,
    mut routine: ServiceRoutine,
    control: Arc<TaskControl>,
) -> JoinHandle<()> {
    let thread_name = format!("txl-spo-{}", buffer.name());
    thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            rt_promote(buffer.name());
            let header = buffer.header();
            let min_interval_ns = header.period_ns;
            header.status.fetch_add(1, Ordering::Release);
            info!(
                buffer = buffer.name(),
                min_interval_ns, "sporadic service running"
            );

            let mut answered = header.response_seq.load(Ordering::Acquire);
            let mut last_invocation_ns = 0u64;
            loop {
                if control.should_stop(&substrate) {
                    break;
                }
                if control.is_paused() {
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }

                let pending = header.request_seq.load(Ordering::Acquire);
                if pending == answered {
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }

                // Rate bound: space invocations by the minimum
                // inter-arrival time, measured start to start.
                let earliest = last_invocation_ns + min_interval_ns;
                let now = substrate.now_ns();
                if now < earliest {
                    sleep_until(&substrate, earliest);
                }

                last_invocation_ns = substrate.now_ns();
                invoke(&substrate, &buffer, &mut routine, &control);

                // One invocation answers every trigger seen before it
                // started; all their waiters release together.
                let coalesced = pending - answered - 1;
                if coalesced > 0 {
                    control.stats.lock().coalesced_triggers += coalesced;
                }
                answered = pending;
                header.response_seq.store(answered, Ordering::Release);
            }

            // Unanswered tickets stay unanswered: polling waiters
            // observe the dead status and cancel.
            header.status.fetch_sub(1, Ordering::Release);
            debug!(buffer = buffer.name(), "sporadic service stopped");
        })
        .expect("spawning a service runtime thread")
}
