//! Internal software timer for hardware without a usable counter.
//!
//! A parallel thread increments a shared counter as fast as it can; the
//! collector reads that counter as "the time". The thread is spawned at the
//! start of every read request and joined at the end, so an attacker never
//! gets a long-lived thread whose tick rate could be profiled. Reads and
//! writes use relaxed atomics: a torn or stale read is additional jitter,
//! not a bug; the only hard requirements are that the increment cannot be
//! hoisted out of the loop and the read cannot be cached.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::Error;
use crate::platform;

/// Shared state between the counter thread and the reader.
pub struct CounterCell {
    tick: AtomicU64,
    interrupt: AtomicBool,
}

impl CounterCell {
    pub fn new() -> Self {
        Self {
            tick: AtomicU64::new(0),
            interrupt: AtomicBool::new(false),
        }
    }

    /// Prepare for a new counter-thread run.
    pub fn reset(&self) {
        self.tick.store(0, Ordering::Relaxed);
        self.interrupt.store(false, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn advance(&self) {
        self.tick.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    pub fn set_interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    /// Spin until the counter moved past `prev`, yielding cooperatively,
    /// then return the new value. This guarantees the counter thread is
    /// running and has ticked since the last read.
    pub fn wait_next(&self, prev: &mut u64) -> u64 {
        loop {
            let now = self.tick.load(Ordering::Relaxed);
            if now != *prev {
                *prev = now;
                return now;
            }
            platform::yield_now();
        }
    }
}

impl Default for CounterCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Running counter thread; interrupting and joining happens on drop.
pub struct CounterGuard {
    cell: Arc<CounterCell>,
    join: Option<JoinHandle<()>>,
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.cell.set_interrupt();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Pluggable counter-thread implementation.
///
/// Replacing the implementation is only permitted before `entropy_init`;
/// afterwards the selection is locked for the lifetime of the process.
pub trait CounterThread: Send + Sync {
    /// Start the counter over `cell`; the returned guard stops it.
    fn start(&self, cell: Arc<CounterCell>) -> Result<CounterGuard, Error>;
}

/// Default implementation backed by a std thread.
pub struct BuiltinCounterThread;

impl CounterThread for BuiltinCounterThread {
    fn start(&self, cell: Arc<CounterCell>) -> Result<CounterGuard, Error> {
        cell.reset();
        let worker = Arc::clone(&cell);
        let join = std::thread::Builder::new()
            .name("jitterseed-counter".into())
            .spawn(move || {
                while !worker.interrupted() {
                    worker.advance();
                }
            })
            .map_err(|_| Error::TimerStart)?;
        Ok(CounterGuard {
            cell,
            join: Some(join),
        })
    }
}

// ---------------------------------------------------------------------------
// Process-global implementation selection
// ---------------------------------------------------------------------------

static SWITCH_BLOCKED: AtomicBool = AtomicBool::new(false);
static CUSTOM_IMPL: Mutex<Option<Box<dyn CounterThread>>> = Mutex::new(None);

/// Replace the counter-thread implementation. Fails once `entropy_init`
/// has locked the selection.
pub fn switch_timer_impl(imp: Box<dyn CounterThread>) -> Result<(), Error> {
    if SWITCH_BLOCKED.load(Ordering::Relaxed) {
        return Err(Error::ProgErr);
    }
    *CUSTOM_IMPL.lock().map_err(|_| Error::ProgErr)? = Some(imp);
    Ok(())
}

/// Lock the implementation selection; called by `entropy_init`.
pub(crate) fn block_switch() {
    SWITCH_BLOCKED.store(true, Ordering::Relaxed);
}

/// Start a counter thread with the selected implementation.
///
/// The internal timer needs a second CPU: on a single core the counter and
/// the measurement would time-slice instead of running in parallel.
pub(crate) fn start_counter(cell: Arc<CounterCell>) -> Result<CounterGuard, Error> {
    if platform::ncpu() < 2 {
        return Err(Error::TimerStart);
    }
    let guard = CUSTOM_IMPL.lock().map_err(|_| Error::ProgErr)?;
    match guard.as_ref() {
        Some(imp) => imp.start(cell),
        None => BuiltinCounterThread.start(cell),
    }
}
