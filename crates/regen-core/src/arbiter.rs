//! Resource arbitration across worker processes.
//!
//! Workers never touch a shared OS primitive. They ask the supervisor for a
//! permit (`Acquire`), block until it answers (`Grant`/`Denied`), and hand it
//! back (`Release`). Because every permit is recorded against the holding
//! [`WorkerId`], killing a worker can release its permits atomically with
//! [`ResourceHandles::release_all`], no matter what state the process died in.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::ipc::Resource;
use crate::supervisor::WorkerId;

/// Spans kept by [`ResourceHandles::history`].
const HISTORY_LEN: usize = 256;

/// Outcome of a permit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The permit is held by the requester now.
    Granted,
    /// The requester is waiting in FIFO order.
    Queued,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    worker: WorkerId,
    since: Instant,
}

/// FIFO counting permit pool with per-holder ownership tracking.
///
/// With capacity 1 this is a mutual-exclusion lock.
#[derive(Debug)]
pub struct PermitPool {
    resource: Resource,
    capacity: usize,
    held: usize,
    holders: FxHashMap<WorkerId, usize>,
    waiters: VecDeque<Waiter>,
}

impl PermitPool {
    pub fn new(resource: Resource, capacity: usize) -> Self {
        Self {
            resource,
            capacity: capacity.max(1),
            held: 0,
            holders: FxHashMap::default(),
            waiters: VecDeque::new(),
        }
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held across all workers.
    pub fn held(&self) -> usize {
        self.held
    }

    /// Permits held by one worker.
    pub fn held_by(&self, worker: WorkerId) -> usize {
        self.holders.get(&worker).copied().unwrap_or(0)
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_waiting(&self, worker: WorkerId) -> bool {
        self.waiters.iter().any(|w| w.worker == worker)
    }

    /// Request one permit. Never grants past a waiter that asked earlier.
    pub fn request(&mut self, worker: WorkerId) -> Acquire {
        if self.held < self.capacity && self.waiters.is_empty() {
            self.take(worker);
            Acquire::Granted
        } else {
            self.waiters.push_back(Waiter {
                worker,
                since: Instant::now(),
            });
            Acquire::Queued
        }
    }

    /// Return one permit held by `worker`, granting it onward.
    ///
    /// Returns `None` if the worker held nothing (the release is ignored),
    /// otherwise the waiters that were granted as a result.
    pub fn release(&mut self, worker: WorkerId) -> Option<Vec<WorkerId>> {
        let count = self.holders.get_mut(&worker)?;
        *count -= 1;
        if *count == 0 {
            self.holders.remove(&worker);
        }
        self.held -= 1;
        Some(self.grant_waiting())
    }

    /// Drop every permit and pending request of `worker`.
    ///
    /// Returns how many permits it held and the waiters granted as a result.
    pub fn release_all(&mut self, worker: WorkerId) -> (usize, Vec<WorkerId>) {
        self.waiters.retain(|w| w.worker != worker);
        let freed = self.holders.remove(&worker).unwrap_or(0);
        self.held -= freed;
        (freed, self.grant_waiting())
    }

    /// Remove waiters that have queued for longer than `limit`.
    pub fn expire_waiters(&mut self, now: Instant, limit: Duration) -> Vec<WorkerId> {
        let mut expired = Vec::new();
        self.waiters.retain(|w| {
            if now.duration_since(w.since) >= limit {
                expired.push(w.worker);
                false
            } else {
                true
            }
        });
        expired
    }

    fn take(&mut self, worker: WorkerId) {
        *self.holders.entry(worker).or_insert(0) += 1;
        self.held += 1;
    }

    fn grant_waiting(&mut self) -> Vec<WorkerId> {
        let mut granted = Vec::new();
        while self.held < self.capacity {
            let Some(next) = self.waiters.pop_front() else {
                break;
            };
            self.take(next.worker);
            granted.push(next.worker);
        }
        granted
    }

    fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            resource: self.resource,
            capacity: self.capacity,
            held: self.held,
            waiting: self.waiters.len(),
        }
    }
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub resource: Resource,
    pub capacity: usize,
    pub held: usize,
    pub waiting: usize,
}

/// One interval during which a worker held a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSpan {
    pub resource: Resource,
    pub worker: WorkerId,
    pub granted_at: Instant,
    /// `None` while the permit is still held.
    pub released_at: Option<Instant>,
}

impl ResourceSpan {
    /// Whether two spans were held at the same time.
    pub fn overlaps(&self, other: &ResourceSpan) -> bool {
        let now = Instant::now();
        let self_end = self.released_at.unwrap_or(now);
        let other_end = other.released_at.unwrap_or(now);
        self.granted_at < other_end && other.granted_at < self_end
    }
}

/// The shared resources of one supervisor: the inference pool and the disk pool.
#[derive(Debug)]
pub struct ResourceHandles {
    inference: PermitPool,
    disk: PermitPool,
    history: VecDeque<ResourceSpan>,
}

impl ResourceHandles {
    pub fn new(inference_slots: usize, disk_permits: usize) -> Self {
        Self {
            inference: PermitPool::new(Resource::Inference, inference_slots),
            disk: PermitPool::new(Resource::Disk, disk_permits),
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub fn pool(&self, resource: Resource) -> &PermitPool {
        match resource {
            Resource::Inference => &self.inference,
            Resource::Disk => &self.disk,
        }
    }

    fn pool_mut(&mut self, resource: Resource) -> &mut PermitPool {
        match resource {
            Resource::Inference => &mut self.inference,
            Resource::Disk => &mut self.disk,
        }
    }

    pub fn request(&mut self, resource: Resource, worker: WorkerId) -> Acquire {
        let outcome = self.pool_mut(resource).request(worker);
        if outcome == Acquire::Granted {
            self.record_grant(resource, worker);
        }
        outcome
    }

    /// Release one permit; returns the workers that should now be told `Grant`.
    pub fn release(&mut self, resource: Resource, worker: WorkerId) -> Option<Vec<WorkerId>> {
        let granted = self.pool_mut(resource).release(worker)?;
        self.record_release(resource, worker);
        for &next in &granted {
            self.record_grant(resource, next);
        }
        Some(granted)
    }

    /// Release everything `worker` holds or waits for, in every pool.
    ///
    /// Returns the `(resource, worker)` grants this unblocked.
    pub fn release_all(&mut self, worker: WorkerId) -> Vec<(Resource, WorkerId)> {
        let mut grants = Vec::new();
        for resource in [Resource::Inference, Resource::Disk] {
            let (freed, granted) = self.pool_mut(resource).release_all(worker);
            for _ in 0..freed {
                self.record_release(resource, worker);
            }
            if freed > 0 {
                tracing::debug!(%worker, %resource, freed, "Released permits of departed holder");
            }
            for next in granted {
                self.record_grant(resource, next);
                grants.push((resource, next));
            }
        }
        grants
    }

    /// Deny requests that waited longer than `limit`.
    pub fn expire_waiters(&mut self, now: Instant, limit: Duration) -> Vec<(Resource, WorkerId)> {
        let mut expired = Vec::new();
        for resource in [Resource::Inference, Resource::Disk] {
            for worker in self.pool_mut(resource).expire_waiters(now, limit) {
                expired.push((resource, worker));
            }
        }
        expired
    }

    pub fn usage(&self) -> [ResourceUsage; 2] {
        [self.inference.usage(), self.disk.usage()]
    }

    /// Recent grant/release spans, oldest first.
    pub fn history(&self) -> Vec<ResourceSpan> {
        self.history.iter().copied().collect()
    }

    fn record_grant(&mut self, resource: Resource, worker: WorkerId) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(ResourceSpan {
            resource,
            worker,
            granted_at: Instant::now(),
            released_at: None,
        });
    }

    fn record_release(&mut self, resource: Resource, worker: WorkerId) {
        if let Some(span) = self.history.iter_mut().find(|s| {
            s.resource == resource && s.worker == worker && s.released_at.is_none()
        }) {
            span.released_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn w(id: u32) -> WorkerId {
        WorkerId::new(id)
    }

    #[test]
    fn test_grants_up_to_capacity_then_queues() {
        let mut pool = PermitPool::new(Resource::Inference, 2);
        assert_eq!(pool.request(w(1)), Acquire::Granted);
        assert_eq!(pool.request(w(2)), Acquire::Granted);
        assert_eq!(pool.request(w(3)), Acquire::Queued);
        assert_eq!(pool.held(), 2);
        assert_eq!(pool.waiting(), 1);
    }

    #[test]
    fn test_release_grants_in_fifo_order() {
        let mut pool = PermitPool::new(Resource::Disk, 1);
        pool.request(w(1));
        pool.request(w(2));
        pool.request(w(3));

        assert_eq!(pool.release(w(1)), Some(vec![w(2)]));
        assert_eq!(pool.release(w(2)), Some(vec![w(3)]));
        assert_eq!(pool.release(w(3)), Some(vec![]));
        assert_eq!(pool.held(), 0);
    }

    #[test]
    fn test_release_by_non_holder_is_ignored() {
        let mut pool = PermitPool::new(Resource::Disk, 1);
        pool.request(w(1));
        assert_eq!(pool.release(w(2)), None);
        assert_eq!(pool.held(), 1);
    }

    #[test]
    fn test_new_request_does_not_jump_the_queue() {
        let mut pool = PermitPool::new(Resource::Inference, 1);
        pool.request(w(1));
        pool.request(w(2));
        pool.release_all(w(2));
        pool.request(w(3));
        pool.request(w(4));
        // w(1) releases: w(3) was first in line.
        assert_eq!(pool.release(w(1)), Some(vec![w(3)]));
    }

    #[test]
    fn test_release_all_frees_a_killed_holder() {
        let mut handles = ResourceHandles::new(1, 1);
        handles.request(Resource::Inference, w(1));
        handles.request(Resource::Disk, w(1));
        handles.request(Resource::Inference, w(2));
        handles.request(Resource::Disk, w(3));

        let grants = handles.release_all(w(1));
        assert_eq!(grants, vec![(Resource::Inference, w(2)), (Resource::Disk, w(3))]);
        assert_eq!(handles.pool(Resource::Inference).held_by(w(1)), 0);
        assert_eq!(handles.pool(Resource::Disk).held_by(w(3)), 1);
    }

    #[test]
    fn test_release_all_cancels_pending_waits() {
        let mut handles = ResourceHandles::new(1, 1);
        handles.request(Resource::Disk, w(1));
        handles.request(Resource::Disk, w(2));
        handles.release_all(w(2));
        assert!(!handles.pool(Resource::Disk).is_waiting(w(2)));
        assert_eq!(handles.release(Resource::Disk, w(1)), Some(vec![]));
    }

    #[test]
    fn test_expired_waiters_are_removed() {
        let mut handles = ResourceHandles::new(1, 1);
        handles.request(Resource::Inference, w(1));
        handles.request(Resource::Inference, w(2));
        let later = Instant::now() + Duration::from_secs(5);
        let expired = handles.expire_waiters(later, Duration::from_secs(1));
        assert_eq!(expired, vec![(Resource::Inference, w(2))]);
        assert_eq!(handles.release(Resource::Inference, w(1)), Some(vec![]));
    }

    #[test]
    fn test_history_records_disjoint_disk_spans() {
        let mut handles = ResourceHandles::new(2, 1);
        handles.request(Resource::Disk, w(1));
        handles.request(Resource::Disk, w(2));
        std::thread::sleep(Duration::from_millis(2));
        handles.release(Resource::Disk, w(1));
        std::thread::sleep(Duration::from_millis(2));
        handles.release(Resource::Disk, w(2));

        let spans = handles.history();
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s.released_at.is_some()));
        assert!(!spans[0].overlaps(&spans[1]));
    }

    #[test]
    fn test_random_operations_never_exceed_capacity() {
        for seed in 1..=20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let capacity: usize = rng.random_range(1..=4);
            let mut pool = PermitPool::new(Resource::Inference, capacity);

            for _ in 0..500 {
                let worker = w(rng.random_range(0..8));
                match rng.random_range(0..3) {
                    0 => {
                        pool.request(worker);
                    }
                    1 => {
                        pool.release(worker);
                    }
                    _ => {
                        pool.release_all(worker);
                    }
                }

                assert!(pool.held() <= pool.capacity(), "seed {seed}: oversubscribed");
                let total: usize = (0..8).map(|id| pool.held_by(w(id))).sum();
                assert_eq!(total, pool.held(), "seed {seed}: holder accounting drifted");
                if pool.held() < pool.capacity() {
                    assert_eq!(pool.waiting(), 0, "seed {seed}: lost wakeup");
                }
            }
        }
    }
}
