//! Bounded intake queue with model-stickiness selection.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::job::{Job, JobId};

/// Times the head of the queue may be passed over before it is forced.
const MAX_PASS_OVER: u32 = 3;

/// Jobs waiting for an idle inference worker.
#[derive(Debug)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.iter().any(|job| &job.id == id)
    }

    /// Enqueue, or refuse immediately when full.
    pub fn push(&mut self, job: Job) -> Result<()> {
        if self.jobs.len() >= self.capacity {
            return Err(Error::Backpressure {
                capacity: self.capacity,
            });
        }
        self.jobs.push_back(job);
        Ok(())
    }

    /// Take the next job for a worker holding `resident` models.
    ///
    /// FIFO, except that a job for a resident model may jump ahead when it
    /// sits within the first `ceil(stickiness * len)` entries. The head can be
    /// passed over at most [`MAX_PASS_OVER`] times.
    pub fn take_for(&mut self, resident: &[String], stickiness: f64) -> Option<Job> {
        let head = self.jobs.front_mut()?;
        let holds = |job: &Job| resident.iter().any(|m| m == job.model());

        if holds(head) || head.passed_over >= MAX_PASS_OVER {
            return self.jobs.pop_front();
        }

        let window = (stickiness.clamp(0.0, 1.0) * self.jobs.len() as f64).ceil() as usize;
        let sticky = self
            .jobs
            .iter()
            .take(window)
            .skip(1)
            .position(holds)
            .map(|i| i + 1);

        match sticky {
            Some(index) => {
                if let Some(head) = self.jobs.front_mut() {
                    head.passed_over += 1;
                }
                self.jobs.remove(index)
            }
            None => self.jobs.pop_front(),
        }
    }

    /// Empty the queue in FIFO order.
    pub fn drain(&mut self) -> impl Iterator<Item = Job> + '_ {
        self.jobs.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{GenerationParams, JobPayload};

    fn job(id: &str, model: &str) -> Job {
        Job::with_id(
            JobId::new(id),
            JobPayload::new(model, GenerationParams::default()),
        )
    }

    fn resident(models: &[&str]) -> Vec<String> {
        models.iter().map(|m| m.to_string()).collect()
    }

    #[test]
    fn test_push_refuses_when_full() {
        let mut queue = JobQueue::new(2);
        queue.push(job("a", "m")).unwrap();
        queue.push(job("b", "m")).unwrap();
        let err = queue.push(job("c", "m")).unwrap_err();
        assert!(matches!(err, Error::Backpressure { capacity: 2 }));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_zero_capacity_refuses_everything() {
        let mut queue = JobQueue::new(0);
        assert!(queue.push(job("a", "m")).is_err());
    }

    #[test]
    fn test_no_stickiness_is_fifo() {
        let mut queue = JobQueue::new(3);
        queue.push(job("a", "sd15")).unwrap();
        queue.push(job("b", "sdxl")).unwrap();
        let next = queue.take_for(&resident(&["sdxl"]), 0.0).unwrap();
        assert_eq!(next.id.as_str(), "a");
    }

    #[test]
    fn test_resident_model_jumps_within_window() {
        let mut queue = JobQueue::new(4);
        queue.push(job("a", "sd15")).unwrap();
        queue.push(job("b", "flux")).unwrap();
        queue.push(job("c", "sdxl")).unwrap();
        queue.push(job("d", "sdxl")).unwrap();

        // Window of ceil(0.5 * 4) = 2 entries does not reach "c".
        let next = queue.take_for(&resident(&["sdxl"]), 0.5).unwrap();
        assert_eq!(next.id.as_str(), "a");

        // Window of ceil(1.0 * 3) = 3 does.
        let next = queue.take_for(&resident(&["sdxl"]), 1.0).unwrap();
        assert_eq!(next.id.as_str(), "c");
    }

    #[test]
    fn test_head_is_forced_after_being_passed_over() {
        let mut queue = JobQueue::new(8);
        queue.push(job("head", "sd15")).unwrap();
        for i in 0..5 {
            queue.push(job(&format!("x{i}"), "sdxl")).unwrap();
        }
        let sdxl = resident(&["sdxl"]);

        for _ in 0..MAX_PASS_OVER {
            let next = queue.take_for(&sdxl, 1.0).unwrap();
            assert_ne!(next.id.as_str(), "head");
        }
        let next = queue.take_for(&sdxl, 1.0).unwrap();
        assert_eq!(next.id.as_str(), "head");
    }

    #[test]
    fn test_drain_returns_everything_in_order() {
        let mut queue = JobQueue::new(3);
        queue.push(job("a", "m")).unwrap();
        queue.push(job("b", "m")).unwrap();
        let ids: Vec<_> = queue.drain().map(|j| j.id.to_string()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(queue.is_empty());
    }
}
