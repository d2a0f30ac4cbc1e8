// Concurrency gate: bounded permit pool for resource-sensitive queues
use crate::domain::Queue;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

/// Default permit capacity for gated queues
pub const DEFAULT_GATE_CAPACITY: usize = 3;

/// Non-blocking admission control for one queue
///
/// The permit counter only moves through `try_acquire` and the drop of a
/// `GatePermit`, so it is released on every exit path, panics included.
/// Counters live in memory and reset with the process.
#[derive(Clone)]
pub struct ConcurrencyGate {
    queue: Queue,
    capacity: usize,
    permits: Arc<Semaphore>,
}

/// Held for the duration of one handler invocation
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(queue: Queue, capacity: usize) -> Self {
        Self {
            queue,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Take a permit if one is free; never waits
    pub fn try_acquire(&self) -> Option<GatePermit> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                debug!(queue = %self.queue, in_use = self.in_use(), "Gate permit acquired");
                Some(GatePermit { _permit: permit })
            }
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                debug!(queue = %self.queue, capacity = self.capacity, "Gate full");
                None
            }
        }
    }

    pub fn queue(&self) -> Queue {
        self.queue
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Fraction of permits held, 0.0..=1.0
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.in_use() as f64 / self.capacity as f64
    }
}
