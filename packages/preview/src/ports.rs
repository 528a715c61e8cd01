// ABOUTME: Port allocation for sandbox dev servers
// ABOUTME: Hands out free ports from a bounded range without double allocation under concurrency

use crate::types::{SandboxError, SandboxResult};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct AllocatorState {
    /// Ports handed to a sandbox and not yet released
    allocated: HashSet<u16>,
    /// Candidates currently being probed by some `acquire` call
    leased: HashSet<u16>,
    /// Where the next scan starts, so freed ports are not immediately reused
    cursor: u16,
}

/// Allocates ports from an inclusive `[min, max]` range.
///
/// Cheap to clone; clones share the same allocation table.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    max_active: usize,
    state: Arc<Mutex<AllocatorState>>,
}

/// Short-lived claim on one candidate port while it is being probed.
///
/// Dropping the lease without calling [`PortLease::commit`] returns the candidate.
struct PortLease<'a> {
    allocator: &'a PortAllocator,
    port: u16,
    committed: bool,
}

impl PortLease<'_> {
    fn commit(mut self) -> u16 {
        let mut state = self.allocator.lock();
        state.leased.remove(&self.port);
        state.allocated.insert(self.port);
        self.committed = true;
        self.port
    }
}

impl Drop for PortLease<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.allocator.lock().leased.remove(&self.port);
        }
    }
}

enum LeaseAttempt<'a> {
    Won(PortLease<'a>),
    Busy,
    AtCapacity,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16, max_active: usize) -> Self {
        debug_assert!(min <= max, "port range is inverted");
        Self {
            min,
            max,
            max_active,
            state: Arc::new(Mutex::new(AllocatorState {
                cursor: min,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn range_len(&self) -> u32 {
        u32::from(self.max) - u32::from(self.min) + 1
    }

    /// Claim a free port.
    ///
    /// Fails fast with [`SandboxError::CapacityExceeded`] when the active count already
    /// meets the configured maximum. Otherwise scans the range, probing each candidate
    /// the caller wins a lease on, and returns [`SandboxError::NoPortsAvailable`] when
    /// every candidate is held or bound by another process.
    pub async fn acquire(&self) -> SandboxResult<u16> {
        let start = {
            let state = self.lock();
            if state.allocated.len() >= self.max_active {
                warn!(
                    "Port allocation refused: {} sandboxes active (max {})",
                    state.allocated.len(),
                    self.max_active
                );
                return Err(SandboxError::CapacityExceeded {
                    max: self.max_active,
                });
            }
            state.cursor
        };

        for offset in 0..self.range_len() {
            let port = self.nth_candidate(start, offset);

            let lease = match self.try_lease(port) {
                LeaseAttempt::Won(lease) => lease,
                LeaseAttempt::Busy => continue,
                LeaseAttempt::AtCapacity => {
                    return Err(SandboxError::CapacityExceeded {
                        max: self.max_active,
                    })
                }
            };

            if !is_port_free(port).await {
                debug!("Port {} is bound by another process, skipping", port);
                continue;
            }

            let port = lease.commit();
            {
                let mut state = self.lock();
                state.cursor = self.nth_candidate(port, 1);
            }
            info!("Allocated sandbox port {}", port);
            return Ok(port);
        }

        warn!("No available ports in range {}-{}", self.min, self.max);
        Err(SandboxError::NoPortsAvailable {
            min: self.min,
            max: self.max,
        })
    }

    fn nth_candidate(&self, start: u16, offset: u32) -> u16 {
        let base = u32::from(start.clamp(self.min, self.max)) - u32::from(self.min);
        let index = (base + offset) % self.range_len();
        (u32::from(self.min) + index) as u16
    }

    fn try_lease(&self, port: u16) -> LeaseAttempt<'_> {
        let mut state = self.lock();
        if state.allocated.contains(&port) || state.leased.contains(&port) {
            return LeaseAttempt::Busy;
        }
        // In-flight leases count against capacity so concurrent callers cannot overshoot it
        if state.allocated.len() + state.leased.len() >= self.max_active {
            return LeaseAttempt::AtCapacity;
        }
        state.leased.insert(port);
        LeaseAttempt::Won(PortLease {
            allocator: self,
            port,
            committed: false,
        })
    }

    /// Return a port to the pool. Releasing a port that is not held is a no-op.
    pub fn release(&self, port: u16) {
        if self.lock().allocated.remove(&port) {
            info!("Released sandbox port {}", port);
        } else {
            debug!("Port {} was not allocated, nothing to release", port);
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.lock().allocated.contains(&port)
    }

    pub fn active_count(&self) -> usize {
        self.lock().allocated.len()
    }
}

/// OS-level liveness check: a port is free if we can bind it on loopback.
async fn is_port_free(port: u16) -> bool {
    tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .is_ok()
}
