//! Process supervisor.
//!
//! The [`Supervisor`] owns every worker process, every in-flight job and the
//! shared resource permits. It runs as a single control loop: each
//! [`Supervisor::step`] handles one control-channel event or one periodic
//! tick, so all state changes happen on one task and need no locking.
//!
//! Jobs flow `dispatch → inference worker → (safety worker) → report`. Every
//! job leaves the supervisor's tables exactly once, as a [`JobReport`]
//! returned by [`Supervisor::next_report`] or [`Supervisor::shutdown`].

mod backoff;
mod handle;
mod intake;
mod spawner;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use crate::arbiter::{Acquire, ResourceHandles, ResourceSpan, ResourceUsage};
use crate::error::{Error, Result};
use crate::ipc::{
    self, ChannelEvent, Resource, SupervisorMessage, WorkerEvent, WorkerKind, WorkerMessage,
};
use crate::job::{Expiry, FailureCause, Job, JobId, JobOutcome, JobReport, Phase, Verdict};
use crate::settings::{FaultPolicy, PhaseTimeouts, ResolvedSettings};

use backoff::RestartBackoff;

pub(crate) use handle::WorkerHandle;
pub use handle::{WorkerId, WorkerInfo, WorkerState};
pub use intake::JobQueue;
pub use spawner::{ProcessSpawner, WORKER_PATH_ENV, WorkerSpawner, find_worker_binary};

/// Why a worker is being forcibly terminated.
#[derive(Debug, Clone)]
enum Fault {
    Timeout(Phase),
    Death(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Timeout(phase) => write!(f, "exceeded its {phase} deadline"),
            Fault::Death(reason) => write!(f, "died: {reason}"),
        }
    }
}

/// A replacement worker waiting out its restart delay.
#[derive(Debug, Clone, Copy)]
struct PendingRespawn {
    kind: WorkerKind,
    due: Instant,
}

fn phase_limit(timeouts: &PhaseTimeouts, phase: Phase) -> Option<Duration> {
    match phase {
        Phase::Preloading => Some(timeouts.preload),
        Phase::Inferring => Some(timeouts.inference_step),
        Phase::PostProcessing => Some(timeouts.post_process),
        Phase::SafetyCheck => Some(timeouts.safety_check),
        Phase::Queued | Phase::Done | Phase::Failed => None,
    }
}

/// Supervises N inference workers and one safety worker.
pub struct Supervisor {
    settings: ResolvedSettings,
    spawner: Box<dyn WorkerSpawner>,
    workers: BTreeMap<WorkerId, WorkerHandle>,
    /// Jobs assigned to a worker or waiting for the safety stage.
    jobs: FxHashMap<JobId, Job>,
    intake: JobQueue,
    safety_queue: VecDeque<JobId>,
    resources: ResourceHandles,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    reports: VecDeque<JobReport>,
    next_worker: u32,
    backoff: RestartBackoff,
    pending_respawns: Vec<PendingRespawn>,
    /// Workers of each kind that died before `Ready`, in a row.
    startup_failures: FxHashMap<WorkerKind, u32>,
    halted: Option<String>,
    ticker: Interval,
}

impl Supervisor {
    /// Spawn the configured workers and wait until all of them are ready.
    ///
    /// Any worker failing to start is fatal.
    pub async fn start(
        settings: ResolvedSettings,
        spawner: impl WorkerSpawner + 'static,
    ) -> Result<Self> {
        tracing::info!(
            inference_processes = settings.inference_processes,
            max_threads = settings.max_threads,
            queue_depth = settings.queue_depth,
            disk_permits = settings.disk_permits,
            "Starting supervisor"
        );

        let mut supervisor = Self::new(settings, Box::new(spawner));
        for _ in 0..supervisor.settings.inference_processes {
            supervisor.spawn(WorkerKind::Inference)?;
        }
        supervisor.spawn(WorkerKind::Safety)?;
        supervisor.await_ready().await?;

        tracing::info!(workers = supervisor.workers.len(), "All workers ready");
        Ok(supervisor)
    }

    /// A supervisor with no workers yet.
    fn new(settings: ResolvedSettings, spawner: Box<dyn WorkerSpawner>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut ticker = tokio::time::interval(settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            resources: ResourceHandles::new(settings.max_threads, settings.disk_permits),
            intake: JobQueue::new(settings.queue_depth),
            backoff: RestartBackoff {
                first: settings.restart_backoff,
                max: settings.restart_backoff_max,
            },
            settings,
            spawner,
            workers: BTreeMap::new(),
            jobs: FxHashMap::default(),
            safety_queue: VecDeque::new(),
            events_tx,
            events_rx,
            reports: VecDeque::new(),
            next_worker: 0,
            pending_respawns: Vec::new(),
            startup_failures: FxHashMap::default(),
            halted: None,
            ticker,
        }
    }

    async fn await_ready(&mut self) -> Result<()> {
        let limit = self.settings.spawn_timeout;
        let deadline = tokio::time::Instant::now() + limit;

        while self
            .workers
            .values()
            .any(|w| w.state == WorkerState::Starting)
        {
            let event = tokio::time::timeout_at(deadline, self.events_rx.recv())
                .await
                .map_err(|_| Error::Spawn(format!("workers did not become ready within {limit:?}")))?;
            let Some(event) = event else {
                break;
            };

            if let ChannelEvent::Closed(reason) = &event.event
                && self
                    .workers
                    .get(&event.worker)
                    .is_some_and(|w| w.state == WorkerState::Starting)
            {
                return Err(Error::Spawn(format!(
                    "{} exited during startup: {}",
                    event.worker, reason
                )));
            }
            self.handle_event(event);

            if let Some(failed) = self
                .workers
                .values()
                .find(|w| w.state == WorkerState::Faulted)
            {
                return Err(Error::Spawn(format!(
                    "{} failed during startup: {}",
                    failed.id,
                    failed.fault.as_deref().unwrap_or("unknown fault")
                )));
            }
        }
        Ok(())
    }

    /// Launch one worker process and send it the `Hello` handshake.
    ///
    /// The worker is `Starting` until it answers `Ready`.
    pub fn spawn(&mut self, kind: WorkerKind) -> Result<WorkerId> {
        let mut child = self.spawner.spawn(kind)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("worker stdin is not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("worker stdout is not piped".to_string()))?;

        self.next_worker += 1;
        let id = WorkerId::new(self.next_worker);
        let channel = ipc::attach(id, stdin, stdout, self.events_tx.clone());
        let handle = WorkerHandle::new(id, kind, child, channel);

        handle.send(SupervisorMessage::Hello {
            process_id: id.get(),
            kind,
            config: self.settings.worker_config(),
        });
        tracing::info!(worker = %id, %kind, pid = ?handle.pid, "Spawned worker");

        self.workers.insert(id, handle);
        Ok(id)
    }

    /// Replace a worker: at once, or after a growing delay while replacements
    /// of this kind keep failing before `Ready`.
    fn respawn(&mut self, kind: WorkerKind) {
        let failures = self.startup_failures.get(&kind).copied().unwrap_or(0);
        if failures == 0 {
            self.spawn_replacement(kind);
            return;
        }
        let delay = self.backoff.next(failures - 1);
        tracing::info!(%kind, failures, ?delay, "Delaying replacement worker");
        self.pending_respawns.push(PendingRespawn {
            kind,
            due: Instant::now() + delay,
        });
    }

    fn spawn_replacement(&mut self, kind: WorkerKind) {
        if let Err(e) = self.spawn(kind) {
            tracing::warn!(%kind, "Replacement worker failed to start: {}", e);
            self.startup_failed(kind, &e.to_string());
        }
    }

    /// Count a worker that never became ready. Halts once too many in a row
    /// failed, otherwise schedules the next attempt.
    fn startup_failed(&mut self, kind: WorkerKind, reason: &str) {
        let failures = self.startup_failures.entry(kind).or_default();
        *failures += 1;
        let failures = *failures;
        if failures >= self.settings.max_startup_failures {
            self.halt(format!(
                "{kind} workers failed to start {failures} times in a row, last: {reason}"
            ));
            return;
        }
        self.respawn(kind);
    }

    /// Assign a job to an idle inference worker, or queue it.
    ///
    /// Fails with [`Error::Backpressure`] when the intake queue is full; the
    /// job is not kept.
    pub fn dispatch(&mut self, job: Job) -> Result<()> {
        if let Some(reason) = &self.halted {
            return Err(Error::Halted(reason.clone()));
        }
        if self.jobs.contains_key(&job.id) || self.intake.contains(&job.id) {
            return Err(Error::DuplicateJob(job.id));
        }

        match self.pick_idle_worker(job.model()) {
            Some(worker) => {
                self.assign(worker, job);
                Ok(())
            }
            None => {
                tracing::debug!(job = %job.id, queued = self.intake.len(), "No idle worker, queueing job");
                self.intake.push(job)
            }
        }
    }

    /// Idle inference worker with the model resident, else the least used one.
    fn pick_idle_worker(&self, model: &str) -> Option<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.kind == WorkerKind::Inference && w.is_idle())
            .min_by_key(|w| (!w.holds_model(model), w.jobs_completed))
            .map(|w| w.id)
    }

    fn assign(&mut self, worker: WorkerId, mut job: Job) {
        let Some(handle) = self.workers.get_mut(&worker) else {
            let reason = format!("{worker} exited before the job was assigned");
            self.finish(
                job,
                JobOutcome::Failed {
                    cause: FailureCause::WorkerDeath { reason },
                    retryable: true,
                },
            );
            return;
        };

        job.assigned = Some(worker);
        job.total_deadline = Some(Instant::now() + self.settings.timeouts.process);

        handle.state = WorkerState::Busy;
        handle.job = Some(job.id.clone());
        handle.models_changed = false;
        handle.denied = None;
        handle.send(SupervisorMessage::Infer {
            job_id: job.id.clone(),
            model: job.payload.model.clone(),
            params: job.payload.params.clone(),
        });

        tracing::info!(job = %job.id, %worker, model = %job.payload.model, "Assigned job");
        self.jobs.insert(job.id.clone(), job);
    }

    /// Ask an idle inference worker that lacks `model` to load it ahead of
    /// demand. Returns `None` when no such worker is idle.
    pub fn preload(&mut self, model: &str) -> Result<Option<WorkerId>> {
        if let Some(reason) = &self.halted {
            return Err(Error::Halted(reason.clone()));
        }
        let deadline = Instant::now() + self.settings.timeouts.preload;
        let Some(handle) = self
            .workers
            .values_mut()
            .find(|w| w.kind == WorkerKind::Inference && w.is_idle() && !w.holds_model(model))
        else {
            return Ok(None);
        };

        handle.state = WorkerState::Busy;
        handle.load_deadline = Some(deadline);
        handle.send(SupervisorMessage::Load {
            model: model.to_string(),
        });
        tracing::info!(worker = %handle.id, model, "Preloading model");
        Ok(Some(handle.id))
    }

    /// Process one control-channel event or one tick.
    pub async fn step(&mut self) -> Result<()> {
        if let Some(reason) = &self.halted {
            return Err(Error::Halted(reason.clone()));
        }
        tokio::select! {
            event = self.events_rx.recv() => {
                if let Some(event) = event {
                    self.handle_event(event);
                }
            }
            _ = self.ticker.tick() => self.tick(),
        }
        Ok(())
    }

    /// Run the control loop until a job reaches a terminal state.
    ///
    /// Once halted, remaining reports are still handed out, then every call
    /// returns [`Error::Halted`].
    pub async fn next_report(&mut self) -> Result<JobReport> {
        loop {
            if let Some(report) = self.reports.pop_front() {
                return Ok(report);
            }
            if let Some(reason) = &self.halted {
                return Err(Error::Halted(reason.clone()));
            }
            self.step().await?;
        }
    }

    /// A terminal report that is already available, without driving the loop.
    pub fn try_report(&mut self) -> Option<JobReport> {
        self.reports.pop_front()
    }

    /// Periodic scan for missed deadlines, lost heartbeats and stuck waits.
    pub fn tick(&mut self) {
        if self.halted.is_some() {
            return;
        }
        let now = Instant::now();
        self.retry_respawns(now);
        if self.halted.is_some() {
            return;
        }

        let mut faults = Vec::new();
        let mut stragglers = Vec::new();
        for handle in self.workers.values() {
            match handle.state {
                WorkerState::Starting => {
                    if now.saturating_duration_since(handle.started_at) > self.settings.spawn_timeout {
                        faults.push((
                            handle.id,
                            Fault::Death(format!(
                                "not ready after {:?}",
                                self.settings.spawn_timeout
                            )),
                        ));
                    }
                }
                WorkerState::Idle | WorkerState::Busy => {
                    let silent = handle.silent_for(now);
                    if silent > self.settings.heartbeat_timeout {
                        faults.push((
                            handle.id,
                            Fault::Death(format!("no heartbeat for {silent:?}")),
                        ));
                    } else if let Some(phase) = self.expired_phase(handle, now) {
                        faults.push((handle.id, Fault::Timeout(phase)));
                    }
                }
                WorkerState::Faulted | WorkerState::Terminated => {
                    if handle
                        .exiting_since
                        .is_some_and(|t| now.saturating_duration_since(t) > self.settings.shutdown_grace)
                    {
                        stragglers.push((handle.id, handle.state));
                    }
                }
            }
        }

        for (worker, fault) in faults {
            if self.halted.is_some() {
                return;
            }
            self.fault_worker(worker, fault);
        }
        for (worker, state) in stragglers {
            if self.halted.is_some() {
                return;
            }
            if state == WorkerState::Terminated {
                self.force_exit(worker);
                continue;
            }
            let fault = self
                .workers
                .get_mut(&worker)
                .and_then(|h| h.fault.take())
                .unwrap_or_else(|| "did not exit after a fatal fault".to_string());
            self.fault_worker(worker, Fault::Death(fault));
        }

        self.expire_safety_waits(now);

        if let Some(limit) = self.settings.resource_acquire_timeout {
            for (resource, worker) in self.resources.expire_waiters(now, limit) {
                self.deny(resource, worker);
            }
        }
    }

    fn expired_phase(&self, handle: &WorkerHandle, now: Instant) -> Option<Phase> {
        if let Some(job_id) = &handle.job {
            let job = self.jobs.get(job_id)?;
            return match job.expired(now)? {
                Expiry::Phase(phase) => Some(phase),
                Expiry::Total => {
                    tracing::warn!(job = %job.id, phase = %job.phase, "Job exceeded the process timeout");
                    Some(job.phase)
                }
            };
        }
        match handle.load_deadline {
            Some(deadline) if now >= deadline => Some(Phase::Preloading),
            _ => None,
        }
    }

    fn retry_respawns(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_respawns)
            .into_iter()
            .partition(|pending| pending.due <= now);
        self.pending_respawns = waiting;
        for pending in due {
            if self.halted.is_some() {
                return;
            }
            self.spawn_replacement(pending.kind);
        }
    }

    /// Jobs that ran out of time waiting for the safety worker.
    fn expire_safety_waits(&mut self, now: Instant) {
        let expired: Vec<JobId> = self
            .safety_queue
            .iter()
            .filter(|id| self.jobs.get(*id).is_some_and(|job| job.expired(now).is_some()))
            .cloned()
            .collect();
        for job_id in expired {
            self.safety_queue.retain(|id| id != &job_id);
            if let Some(job) = self.jobs.remove(&job_id) {
                tracing::warn!(job = %job_id, "Safety check never started in time, flagging");
                self.finish_flagged(job);
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event.event {
            ChannelEvent::Message(message) => self.handle_message(event.worker, message),
            ChannelEvent::Closed(reason) => self.handle_closed(event.worker, reason),
        }
    }

    fn handle_message(&mut self, worker: WorkerId, message: WorkerMessage) {
        let Some(handle) = self.workers.get_mut(&worker) else {
            tracing::trace!(%worker, ?message, "Ignoring message from departed worker");
            return;
        };
        handle.last_heartbeat = Instant::now();

        match message {
            WorkerMessage::Ready { pid } => {
                if handle.state == WorkerState::Starting {
                    handle.state = WorkerState::Idle;
                    handle.pid = Some(pid);
                    handle.ready = true;
                    let kind = handle.kind;
                    tracing::info!(%worker, %kind, pid, "Worker ready");
                    self.startup_failures.remove(&kind);
                    self.on_worker_idle(worker);
                }
            }
            WorkerMessage::Heartbeat { .. } => {}
            WorkerMessage::Progress { job_id, phase } => {
                if let Some(job) = self.jobs.get_mut(&job_id)
                    && job.assigned == Some(worker)
                {
                    let limit = phase_limit(&self.settings.timeouts, phase);
                    if job.advance(phase, limit) {
                        tracing::debug!(job = %job_id, %worker, %phase, "Job entered phase");
                    } else {
                        tracing::debug!(job = %job_id, from = %job.phase, to = %phase, "Ignoring backwards phase change");
                    }
                }
            }
            WorkerMessage::Step { job_id, step, total } => {
                if let Some(job) = self.jobs.get_mut(&job_id)
                    && job.assigned == Some(worker)
                {
                    job.rearm(self.settings.timeouts.inference_step);
                    tracing::trace!(job = %job_id, step, total, "Step");
                }
            }
            WorkerMessage::Acquire { resource } => match self.resources.request(resource, worker) {
                Acquire::Granted => {
                    handle.send(SupervisorMessage::Grant { resource });
                }
                Acquire::Queued => {
                    tracing::debug!(%worker, %resource, "Waiting for resource");
                    // Disk waits count against the preload deadline.
                    if resource == Resource::Inference
                        && let Some(job_id) = &handle.job
                        && let Some(job) = self.jobs.get_mut(job_id)
                    {
                        job.suspend_deadline();
                    }
                }
            },
            WorkerMessage::Release { resource } => match self.resources.release(resource, worker) {
                Some(granted) => {
                    for next in granted {
                        self.grant(resource, next);
                    }
                }
                None => {
                    tracing::debug!(%worker, %resource, "Ignoring release of a permit that is not held");
                }
            },
            WorkerMessage::ModelsResident { models } => {
                if handle.job.is_some() && !handle.resident.is_empty() && handle.resident != models {
                    handle.models_changed = true;
                }
                tracing::debug!(%worker, ?models, "Resident models changed");
                handle.resident = models;
                if handle.job.is_none() && handle.load_deadline.take().is_some() {
                    tracing::info!(%worker, "Preload finished");
                    self.mark_idle(worker);
                }
            }
            WorkerMessage::Result { job_id, output_ref } => {
                self.complete_inference(worker, job_id, output_ref);
            }
            WorkerMessage::SafetyResult { job_id, verdict } => {
                self.complete_safety(worker, job_id, verdict);
            }
            WorkerMessage::Error {
                job_id: None,
                cause,
                ..
            } => {
                if handle.job.is_none() && handle.load_deadline.take().is_some() {
                    tracing::warn!(%worker, %cause, "Preload failed");
                    self.mark_idle(worker);
                } else {
                    tracing::warn!(%worker, %cause, "Worker reported an error outside of a job");
                }
            }
            WorkerMessage::Error {
                job_id: Some(job_id),
                cause,
                retryable,
            } => {
                self.fail_from_worker(worker, job_id, cause, retryable);
            }
            WorkerMessage::Fatal { message } => {
                tracing::error!(%worker, %message, "Worker reported a fatal fault");
                handle.state = WorkerState::Faulted;
                handle.fault = Some(format!("fatal fault: {message}"));
                handle.exiting_since = Some(Instant::now());
            }
            WorkerMessage::ShuttingDown => {
                tracing::debug!(%worker, "Worker acknowledged shutdown");
                if handle.state != WorkerState::Faulted {
                    handle.state = WorkerState::Terminated;
                    handle.exiting_since.get_or_insert_with(Instant::now);
                }
            }
        }
    }

    fn handle_closed(&mut self, worker: WorkerId, reason: String) {
        let Some(handle) = self.workers.get_mut(&worker) else {
            return;
        };
        match handle.state {
            WorkerState::Terminated => {
                if let Some(handle) = self.workers.remove(&worker) {
                    tracing::info!(%worker, "Worker exited");
                    handle.kill();
                }
                self.release_permits(worker);
            }
            WorkerState::Faulted => {
                let fault = handle.fault.take().unwrap_or(reason);
                self.fault_worker(worker, Fault::Death(fault));
            }
            _ => self.fault_worker(worker, Fault::Death(format!("control channel closed: {reason}"))),
        }
    }

    fn on_worker_idle(&mut self, worker: WorkerId) {
        let Some(handle) = self.workers.get(&worker) else {
            return;
        };
        if !handle.is_idle() {
            return;
        }
        match handle.kind {
            WorkerKind::Inference => {
                let next = self
                    .intake
                    .take_for(&handle.resident, self.settings.model_stickiness);
                if let Some(job) = next {
                    self.assign(worker, job);
                }
            }
            WorkerKind::Safety => {
                while let Some(job_id) = self.safety_queue.pop_front() {
                    if self.jobs.contains_key(&job_id) {
                        self.start_safety_check(worker, job_id);
                        break;
                    }
                }
            }
        }
    }

    fn mark_idle(&mut self, worker: WorkerId) {
        if let Some(handle) = self.workers.get_mut(&worker) {
            handle.state = WorkerState::Idle;
            handle.job = None;
            handle.denied = None;
            self.on_worker_idle(worker);
        }
    }

    fn complete_inference(&mut self, worker: WorkerId, job_id: JobId, output_ref: String) {
        let Some(handle) = self.workers.get_mut(&worker) else {
            return;
        };
        if handle.job.as_ref() != Some(&job_id) {
            tracing::warn!(%worker, job = %job_id, "Ignoring result for a job the worker does not hold");
            return;
        }
        handle.job = None;
        handle.jobs_completed += 1;
        let retire = self.settings.cycle_process_on_model_change && handle.models_changed;
        handle.models_changed = false;

        self.release_permits(worker);
        if let Some(mut job) = self.jobs.remove(&job_id) {
            if job.payload.safety_check {
                job.output_ref = Some(output_ref);
                self.hand_to_safety(job);
            } else {
                self.finish(
                    job,
                    JobOutcome::Done {
                        output_ref,
                        verdict: None,
                    },
                );
            }
        }

        if retire {
            self.retire(worker);
            self.respawn(WorkerKind::Inference);
        } else {
            self.mark_idle(worker);
        }
    }

    fn hand_to_safety(&mut self, mut job: Job) {
        job.assigned = None;
        job.advance(Phase::SafetyCheck, None);
        let job_id = job.id.clone();
        self.jobs.insert(job_id.clone(), job);

        let idle_safety = self
            .workers
            .values()
            .find(|w| w.kind == WorkerKind::Safety && w.is_idle())
            .map(|w| w.id);
        match idle_safety {
            Some(worker) => self.start_safety_check(worker, job_id),
            None => {
                tracing::debug!(job = %job_id, "Safety worker busy, queueing check");
                self.safety_queue.push_back(job_id);
            }
        }
    }

    fn start_safety_check(&mut self, worker: WorkerId, job_id: JobId) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let Some(handle) = self.workers.get_mut(&worker) else {
            self.safety_queue.push_front(job_id);
            return;
        };

        job.assigned = Some(worker);
        job.rearm(self.settings.timeouts.safety_check);
        handle.state = WorkerState::Busy;
        handle.job = Some(job_id.clone());
        handle.send(SupervisorMessage::SafetyCheck {
            job_id: job_id.clone(),
            artifact_ref: job.output_ref.clone().unwrap_or_default(),
            prompt: job.payload.params.prompt.clone(),
        });
        tracing::debug!(job = %job_id, %worker, "Started safety check");
    }

    fn complete_safety(&mut self, worker: WorkerId, job_id: JobId, verdict: Verdict) {
        let Some(handle) = self.workers.get_mut(&worker) else {
            return;
        };
        if handle.job.as_ref() != Some(&job_id) {
            tracing::warn!(%worker, job = %job_id, "Ignoring verdict for a job the worker does not hold");
            return;
        }
        handle.jobs_completed += 1;

        self.release_permits(worker);
        if let Some(mut job) = self.jobs.remove(&job_id) {
            let output_ref = job.output_ref.take().unwrap_or_default();
            self.finish(
                job,
                JobOutcome::Done {
                    output_ref,
                    verdict: Some(verdict),
                },
            );
        }
        self.mark_idle(worker);
    }

    fn fail_from_worker(&mut self, worker: WorkerId, job_id: JobId, cause: String, retryable: bool) {
        let Some(handle) = self.workers.get_mut(&worker) else {
            return;
        };
        if handle.job.as_ref() != Some(&job_id) {
            tracing::warn!(%worker, job = %job_id, "Ignoring error for a job the worker does not hold");
            return;
        }
        let kind = handle.kind;
        let denied = handle.denied.take();

        self.release_permits(worker);
        if let Some(job) = self.jobs.remove(&job_id) {
            match (kind, denied) {
                (WorkerKind::Safety, _) => {
                    tracing::warn!(job = %job_id, %cause, "Safety check failed, flagging");
                    self.finish_flagged(job);
                }
                (WorkerKind::Inference, Some(resource)) => self.finish(
                    job,
                    JobOutcome::Failed {
                        cause: FailureCause::ResourceAcquisitionTimeout { resource },
                        retryable: true,
                    },
                ),
                (WorkerKind::Inference, None) => self.finish(
                    job,
                    JobOutcome::Failed {
                        cause: FailureCause::WorkerFault {
                            message: cause.clone(),
                        },
                        retryable,
                    },
                ),
            }
        }

        if self.settings.fault_policy == FaultPolicy::Halt && !retryable {
            self.halt(format!("{worker} reported an unhandled fault: {cause}"));
            return;
        }
        self.mark_idle(worker);
    }

    /// Kill a worker, settle its job, free its permits and replace it.
    fn fault_worker(&mut self, worker: WorkerId, fault: Fault) {
        let Some(handle) = self.workers.remove(&worker) else {
            return;
        };
        let kind = handle.kind;
        let job_id = handle.job.clone();
        let never_ready = !handle.ready;
        tracing::warn!(%worker, %kind, %fault, "Terminating worker");
        handle.kill();
        self.release_permits(worker);

        if let Some(job_id) = job_id
            && let Some(job) = self.jobs.remove(&job_id)
        {
            match kind {
                WorkerKind::Safety => {
                    tracing::warn!(job = %job_id, "Safety check did not complete, flagging");
                    self.finish_flagged(job);
                }
                WorkerKind::Inference => {
                    let cause = match &fault {
                        Fault::Timeout(phase) => FailureCause::PhaseTimeout { phase: *phase },
                        Fault::Death(reason) => FailureCause::WorkerDeath {
                            reason: reason.clone(),
                        },
                    };
                    self.finish(
                        job,
                        JobOutcome::Failed {
                            cause,
                            retryable: true,
                        },
                    );
                }
            }
        }

        if self.settings.fault_policy == FaultPolicy::Halt {
            self.halt(format!("{worker} {fault}"));
            return;
        }
        if never_ready {
            self.startup_failed(kind, &fault.to_string());
        } else {
            self.respawn(kind);
        }
    }

    /// Kill a retiring worker that ignored `Shutdown`. Its replacement is
    /// already running.
    fn force_exit(&mut self, worker: WorkerId) {
        if let Some(handle) = self.workers.remove(&worker) {
            tracing::warn!(%worker, grace = ?self.settings.shutdown_grace, "Retired worker did not exit, killing it");
            handle.kill();
        }
        self.release_permits(worker);
    }

    /// Ask a healthy worker to exit once it is idle; it is removed when its
    /// channel closes.
    fn retire(&mut self, worker: WorkerId) {
        if let Some(handle) = self.workers.get_mut(&worker) {
            tracing::info!(%worker, "Cycling worker after model change");
            handle.state = WorkerState::Terminated;
            handle.exiting_since = Some(Instant::now());
            handle.send(SupervisorMessage::Shutdown);
        }
    }

    fn halt(&mut self, reason: String) {
        tracing::error!(%reason, "Halting supervisor");
        for (worker, handle) in std::mem::take(&mut self.workers) {
            self.resources.release_all(worker);
            handle.kill();
        }
        self.pending_respawns.clear();
        self.safety_queue.clear();
        self.fail_remaining();
        self.halted = Some(reason);
    }

    fn fail_remaining(&mut self) {
        let mut remaining: Vec<Job> = self
            .jobs
            .drain()
            .map(|(_, job)| job)
            .chain(self.intake.drain())
            .collect();
        remaining.sort_by_key(|job| job.submitted_at);
        for job in remaining {
            self.finish(
                job,
                JobOutcome::Failed {
                    cause: FailureCause::Shutdown,
                    retryable: true,
                },
            );
        }
    }

    fn release_permits(&mut self, worker: WorkerId) {
        for (resource, next) in self.resources.release_all(worker) {
            self.grant(resource, next);
        }
    }

    fn grant(&mut self, resource: Resource, worker: WorkerId) {
        let Some(handle) = self.workers.get(&worker) else {
            return;
        };
        handle.send(SupervisorMessage::Grant { resource });
        tracing::debug!(%worker, %resource, "Granted resource");
        if resource == Resource::Inference
            && let Some(job_id) = &handle.job
            && let Some(job) = self.jobs.get_mut(job_id)
            && let Some(limit) = phase_limit(&self.settings.timeouts, job.phase)
        {
            job.rearm(limit);
        }
    }

    fn deny(&mut self, resource: Resource, worker: WorkerId) {
        if let Some(handle) = self.workers.get_mut(&worker) {
            tracing::warn!(%worker, %resource, "Resource wait timed out, denying");
            handle.denied = Some(resource);
            handle.send(SupervisorMessage::Denied { resource });
        }
    }

    fn finish_flagged(&mut self, mut job: Job) {
        let output_ref = job.output_ref.take().unwrap_or_default();
        self.finish(
            job,
            JobOutcome::Done {
                output_ref,
                verdict: Some(Verdict::Flagged),
            },
        );
    }

    fn finish(&mut self, job: Job, outcome: JobOutcome) {
        match &outcome {
            JobOutcome::Done { verdict, .. } => {
                tracing::info!(job = %job.id, ?verdict, "Job done");
            }
            JobOutcome::Failed { cause, retryable } => {
                tracing::warn!(job = %job.id, %cause, retryable, "Job failed");
            }
        }
        self.reports.push_back(job.into_report(outcome));
    }

    /// Stop every worker and report all unfinished jobs as failed.
    ///
    /// Workers get `Shutdown` and up to `shutdown_grace` to exit before they
    /// are killed. Returns every report not yet handed out.
    pub async fn shutdown(mut self) -> Vec<JobReport> {
        tracing::info!(
            workers = self.workers.len(),
            in_flight = self.in_flight(),
            "Shutting down supervisor"
        );
        self.safety_queue.clear();
        self.fail_remaining();

        let deadline = Instant::now() + self.settings.shutdown_grace;
        let workers = std::mem::take(&mut self.workers);
        for handle in workers.values() {
            handle.send(SupervisorMessage::Shutdown);
        }
        for (worker, handle) in workers {
            self.resources.release_all(worker);
            handle.exit_within(deadline).await;
        }

        self.reports.drain(..).collect()
    }

    pub fn settings(&self) -> &ResolvedSettings {
        &self.settings
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.workers.values().map(WorkerHandle::info).collect()
    }

    /// Current phase of a job that has not yet been reported.
    pub fn job_phase(&self, id: &JobId) -> Option<Phase> {
        if let Some(job) = self.jobs.get(id) {
            return Some(job.phase());
        }
        self.intake.contains(id).then_some(Phase::Queued)
    }

    pub fn queued_len(&self) -> usize {
        self.intake.len()
    }

    /// Jobs accepted but not yet reported.
    pub fn in_flight(&self) -> usize {
        self.jobs.len() + self.intake.len()
    }

    pub fn resources(&self) -> [ResourceUsage; 2] {
        self.resources.usage()
    }

    pub fn resource_history(&self) -> Vec<ResourceSpan> {
        self.resources.history()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }
}
