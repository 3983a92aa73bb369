//! Process-wide I/O concurrency limits.
//!
//! Every physical read (`pread`) and write/fsync of block data takes a permit
//! from one of two global semaphores, so total disk concurrency stays bounded
//! no matter how many shards are active.

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Condvar, Mutex};

/// Simple counting semaphore
pub struct Semaphore {
    available: Mutex<usize>,
    condvar: Condvar,
    capacity: usize,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            available: Mutex::new(capacity),
            condvar: Condvar::new(),
            capacity,
        }
    }

    /// Acquire one permit, blocking while none is available.
    pub fn acquire(&self) -> Permit<'_> {
        let mut available = self.available.lock();
        while *available == 0 {
            self.condvar.wait(&mut available);
        }
        *available -= 1;
        Permit { semaphore: self }
    }

    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut available = self.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(Permit { semaphore: self })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *self.available.lock()
    }
}

/// Released on drop
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut available = self.semaphore.available.lock();
        *available += 1;
        self.semaphore.condvar.notify_one();
    }
}

static IO_THREADS: OnceCell<(usize, usize)> = OnceCell::new();

static READ_LIMITER: Lazy<Semaphore> = Lazy::new(|| Semaphore::new(io_threads().0));
static WRITE_LIMITER: Lazy<Semaphore> = Lazy::new(|| Semaphore::new(io_threads().1));

fn io_threads() -> (usize, usize) {
    *IO_THREADS.get_or_init(default_io_threads)
}

/// Default permits: `(reads, writes)` derived from the CPU count.
pub fn default_io_threads() -> (usize, usize) {
    let cpus = num_cpus::get();
    ((cpus * 4).clamp(8, 128), cpus.clamp(2, 16))
}

/// Size the global semaphores. Only the first call before any I/O wins;
/// returns whether this call took effect.
pub fn set_io_threads(reads: usize, writes: usize) -> bool {
    IO_THREADS.set((reads.max(1), writes.max(1))).is_ok()
}

/// Permit for one physical read.
pub fn read_permit() -> Permit<'static> {
    READ_LIMITER.acquire()
}

/// Permit for one physical write or fsync.
pub fn write_permit() -> Permit<'static> {
    WRITE_LIMITER.acquire()
}
