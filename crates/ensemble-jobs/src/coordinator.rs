// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Single-flight job coordination.
//!
//! The [`Coordinator`] owns the registry of jobs. For each signature at most
//! one job is active; concurrent requests for the same signature join it
//! instead of dispatching duplicate work. A job is installed synchronously
//! (`NOT_INIT → INSTALLING → READY`) and then handed to a driver task that
//! submits it to the [`Executor`], retries transient failures with backoff,
//! and commits the produced trajectories to the cache on `COMPLETE`.
//!
//! # Locking
//!
//! The registry mutex is taken before any job mutex, never the reverse. No
//! mutex is held across an `.await`. The `COMPLETE` transition appends to the
//! cache while holding the job mutex, so a racing `STOPPED` either lands first
//! (and the completion is rejected) or is itself rejected.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ensemble_cache::{CacheStore, JobId, Signature, Trajectory};
use ensemble_fingerprint::{SimulationRequest, TRAJECTORY_COUNT_KEY};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::executor::{Executor, ExecutorError, TaskHandle, WorkSpec};
use crate::retry::RetryPolicy;
use crate::status::JobStatus;
use crate::workspace::{Workspace, WorkspaceRoot};

/// File the originating request is written to when a workspace is installed.
pub const REQUEST_FILE: &str = "request.json";

/// Coordinator tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Retry budget for failed executor attempts.
    pub retry: RetryPolicy,
    /// Upper bound on a single executor attempt.
    pub task_timeout: Duration,
    /// Finished jobs kept pollable after they reach a terminal status.
    pub finished_retention: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            task_timeout: Duration::from_secs(3600),
            finished_retention: 1024,
        }
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    /// Job identifier.
    pub job_id: JobId,
    /// Signature the job produces trajectories for.
    pub signature: Signature,
    /// Trajectories the job was created to produce.
    pub delta: u64,
    /// Coverage the signature reaches once the job completes.
    pub target: u64,
    /// Current status.
    pub status: JobStatus,
    /// Failure or cancellation reason, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcome of [`Coordinator::reserve_delta`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The cache already covers the request; no work was created.
    Satisfied {
        /// Trajectories stored for the signature.
        stored_count: u64,
    },
    /// An active job already owns the signature.
    Joined(JobSnapshot),
    /// A new job was created for the shortfall.
    Created(JobSnapshot),
}

impl Reservation {
    /// The job joined or created, if any.
    pub fn job(&self) -> Option<&JobSnapshot> {
        match self {
            Self::Satisfied { .. } => None,
            Self::Joined(job) | Self::Created(job) => Some(job),
        }
    }
}

/// Most recent permanent failure recorded for a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    /// Job that halted.
    pub job_id: JobId,
    /// Why it halted.
    pub message: String,
}

/// Errors returned by coordinator operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// The requested status change is not an edge of the job state machine.
    #[error("job {job}: illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Job addressed.
        job: JobId,
        /// Status at the time of the attempt.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },
    /// No job with this id is known (never existed or aged out).
    #[error("unknown job {job}")]
    UnknownJob {
        /// Job addressed.
        job: JobId,
    },
    /// `COMPLETE` requested before the executor produced any trajectories.
    #[error("job {job} has no results to commit")]
    ResultsPending {
        /// Job addressed.
        job: JobId,
    },
    /// Called outside a Tokio runtime; jobs could not be driven.
    #[error("no tokio runtime available to drive jobs")]
    NoRuntime,
    /// [`Coordinator::shutdown`] has been called.
    #[error("coordinator is shutting down")]
    ShuttingDown,
}

struct JobState {
    status: JobStatus,
    message: Option<String>,
    workspace: Option<Workspace>,
    produced: Option<Vec<Trajectory>>,
}

struct JobCell {
    id: JobId,
    signature: Signature,
    delta: u64,
    target: u64,
    request: SimulationRequest,
    state: Mutex<JobState>,
    status_tx: watch::Sender<JobStatus>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl JobCell {
    fn new(signature: Signature, delta: u64, target: u64, request: SimulationRequest) -> Self {
        let (status_tx, _) = watch::channel(JobStatus::NotInit);
        Self {
            id: JobId::new(),
            signature,
            delta,
            target,
            request,
            state: Mutex::new(JobState {
                status: JobStatus::NotInit,
                message: None,
                workspace: None,
                produced: None,
            }),
            status_tx,
            driver: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> JobStatus {
        self.lock().status
    }

    /// Last status broadcast to watchers. Never waits on the job lock, which
    /// a commit holds across the cache append.
    fn published(&self) -> JobStatus {
        *self.status_tx.borrow()
    }

    fn snapshot(&self) -> JobSnapshot {
        let state = self.lock();
        JobSnapshot {
            job_id: self.id,
            signature: self.signature,
            delta: self.delta,
            target: self.target,
            status: state.status,
            message: state.message.clone(),
        }
    }

    fn work_spec(&self) -> Option<WorkSpec> {
        let workspace = self.lock().workspace.as_ref()?.path().to_path_buf();
        let mut kwargs = self.request.kwargs.clone();
        kwargs.insert(TRAJECTORY_COUNT_KEY.to_owned(), self.delta.into());
        Some(WorkSpec {
            job_id: self.id,
            signature: self.signature,
            model: self.request.model.clone(),
            kwargs,
            trajectories: self.delta,
            workspace,
        })
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<Signature, JobId>,
    jobs: HashMap<JobId, Arc<JobCell>>,
    finished: VecDeque<JobId>,
    demand: HashMap<Signature, u64>,
    failures: HashMap<Signature, JobFailure>,
    /// Bumped whenever a job completes, i.e. whenever coverage may have grown.
    completions: u64,
    closed: bool,
}

impl Registry {
    fn active_cell(&self, signature: &Signature) -> Option<Arc<JobCell>> {
        let id = self.active.get(signature)?;
        self.jobs.get(id).cloned()
    }
}

struct Inner<C, E> {
    cache: C,
    executor: E,
    workspaces: WorkspaceRoot,
    config: CoordinatorConfig,
    registry: Mutex<Registry>,
}

impl<C, E> Inner<C, E> {
    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Attempt {
    Produced(Vec<Trajectory>),
    Failed(ExecutorError),
    Abandoned,
}

/// Owns every job and the single-flight guarantee.
///
/// Cloning is cheap; clones share the same registry.
pub struct Coordinator<C, E> {
    inner: Arc<Inner<C, E>>,
}

impl<C, E> Clone for Coordinator<C, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, E> Coordinator<C, E>
where
    C: CacheStore + 'static,
    E: Executor,
{
    /// Coordinator committing to `cache` and dispatching through `executor`.
    pub fn new(cache: C, executor: E, workspaces: WorkspaceRoot, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                executor,
                workspaces,
                config,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// The cache jobs commit to.
    pub fn cache(&self) -> &C {
        &self.inner.cache
    }

    /// The executor jobs are dispatched through.
    pub fn executor(&self) -> &E {
        &self.inner.executor
    }

    /// Make sure `n` trajectories for `signature` exist or are being produced.
    ///
    /// Single-flight: the active-job check and job creation happen in one
    /// critical section, so concurrent callers create at most one job. A
    /// caller that joins a job whose target falls short of `n` records `n`
    /// as deferred demand; once that job completes, a follow-up reservation
    /// is made for the remainder.
    ///
    /// Coverage is read before the registry lock is taken and re-read only
    /// if a job completed in between, so registry users never wait on a cold
    /// cache load. Never awaits simulation work, but must run inside a Tokio
    /// runtime.
    #[instrument(skip(self, request, signature), fields(signature = %signature))]
    pub fn reserve_delta(
        &self,
        signature: Signature,
        n: u64,
        request: &SimulationRequest,
    ) -> Result<Reservation, CoordinatorError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| CoordinatorError::NoRuntime)?;
        let seen = self.inner.lock_registry().completions;
        let mut stored = self.inner.cache.stored_count(&signature);
        let cell = {
            let mut reg = self.inner.lock_registry();
            if reg.closed {
                return Err(CoordinatorError::ShuttingDown);
            }
            if let Some(cell) = reg
                .active_cell(&signature)
                .filter(|cell| cell.published().is_active())
            {
                if n > cell.target {
                    let deferred = reg.demand.entry(signature).or_insert(0);
                    *deferred = (*deferred).max(n);
                    debug!(job = %cell.id, n, target = cell.target, "deferred demand recorded");
                }
                drop(reg);
                return Ok(Reservation::Joined(cell.snapshot()));
            }
            if reg.completions != seen {
                stored = self.inner.cache.stored_count(&signature);
            }
            let delta = n.saturating_sub(stored);
            if delta == 0 {
                return Ok(Reservation::Satisfied {
                    stored_count: stored,
                });
            }
            let cell = Arc::new(JobCell::new(signature, delta, n, request.clone()));
            reg.active.insert(signature, cell.id);
            reg.jobs.insert(cell.id, Arc::clone(&cell));
            reg.failures.remove(&signature);
            cell
        };
        info!(job = %cell.id, delta = cell.delta, target = cell.target, "job created");

        if self.install(&cell) {
            let driver = runtime.spawn(self.clone().drive(Arc::clone(&cell)));
            *cell.driver.lock().unwrap_or_else(|e| e.into_inner()) = Some(driver);
        }
        Ok(Reservation::Created(cell.snapshot()))
    }

    /// Apply `status` to `job` if the state machine allows it.
    ///
    /// `STOPPED` and `HALTED` release the workspace at once; the job's driver
    /// cancels any executor task as soon as it observes the change.
    #[instrument(skip(self))]
    pub fn signal(&self, job: JobId, status: JobStatus) -> Result<JobStatus, CoordinatorError> {
        let cell = self.cell(job)?;
        let message = match status {
            JobStatus::Stopped => Some("stopped by request".to_owned()),
            JobStatus::Halted => Some("halted by request".to_owned()),
            _ => None,
        };
        self.apply(&cell, status, message)
    }

    /// Shorthand for `signal(job, STOPPED)`.
    pub fn cancel(&self, job: JobId) -> Result<JobStatus, CoordinatorError> {
        self.signal(job, JobStatus::Stopped)
    }

    /// Current status of `job`, if it is active or recently finished.
    pub fn poll(&self, job: JobId) -> Option<JobStatus> {
        self.cell(job).ok().map(|cell| cell.status())
    }

    /// Snapshot of `job`, if it is active or recently finished.
    pub fn job(&self, job: JobId) -> Option<JobSnapshot> {
        self.cell(job).ok().map(|cell| cell.snapshot())
    }

    /// The active job for `signature`, if any.
    pub fn active_job(&self, signature: &Signature) -> Option<JobSnapshot> {
        let cell = self.inner.lock_registry().active_cell(signature)?;
        let snapshot = cell.snapshot();
        snapshot.status.is_active().then_some(snapshot)
    }

    /// Last permanent failure for `signature`, cleared when a new job starts
    /// or a job completes.
    pub fn failure(&self, signature: &Signature) -> Option<JobFailure> {
        self.inner.lock_registry().failures.get(signature).cloned()
    }

    /// Deferred demand recorded against the active job for `signature`.
    pub fn deferred_demand(&self, signature: &Signature) -> Option<u64> {
        self.inner.lock_registry().demand.get(signature).copied()
    }

    /// Number of active jobs.
    pub fn active_count(&self) -> usize {
        self.inner.lock_registry().active.len()
    }

    /// Resolve once `job` reaches a terminal status.
    pub async fn wait(&self, job: JobId) -> Result<JobSnapshot, CoordinatorError> {
        let cell = self.cell(job)?;
        let mut rx = cell.status_tx.subscribe();
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        Ok(cell.snapshot())
    }

    /// Stop every active job and wait for their drivers to exit.
    ///
    /// Later reservations fail with [`CoordinatorError::ShuttingDown`].
    pub async fn shutdown(&self) {
        let cells: Vec<Arc<JobCell>> = {
            let mut reg = self.inner.lock_registry();
            reg.closed = true;
            reg.active
                .values()
                .filter_map(|id| reg.jobs.get(id).cloned())
                .collect()
        };
        info!(active = cells.len(), "coordinator shutting down");
        for cell in &cells {
            if let Err(err) = self.apply(cell, JobStatus::Stopped, Some("shutdown".to_owned())) {
                debug!(job = %cell.id, error = %err, "job not stoppable at shutdown");
            }
        }
        for cell in cells {
            let driver = cell.driver.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(driver) = driver {
                if let Err(err) = driver.await {
                    warn!(job = %cell.id, error = %err, "job driver panicked");
                }
            }
        }
    }

    fn cell(&self, job: JobId) -> Result<Arc<JobCell>, CoordinatorError> {
        self.inner
            .lock_registry()
            .jobs
            .get(&job)
            .cloned()
            .ok_or(CoordinatorError::UnknownJob { job })
    }

    /// `NOT_INIT → INSTALLING → READY`. Returns `false` if the job did not
    /// reach `READY`.
    fn install(&self, cell: &Arc<JobCell>) -> bool {
        if let Err(err) = self.apply(cell, JobStatus::Installing, None) {
            debug!(job = %cell.id, error = %err, "install skipped");
            return false;
        }
        let prepared = self
            .inner
            .workspaces
            .create(cell.id)
            .and_then(|ws| ws.write_json(REQUEST_FILE, &cell.request).map(|_| ws));
        let workspace = match prepared {
            Ok(ws) => ws,
            Err(err) => {
                warn!(job = %cell.id, error = %err, "workspace install failed");
                self.apply_quietly(cell, JobStatus::Halted, format!("install failed: {err}"));
                return false;
            }
        };
        {
            let mut state = cell.lock();
            if state.status != JobStatus::Installing {
                return false;
            }
            state.workspace = Some(workspace);
        }
        self.apply(cell, JobStatus::Ready, None).is_ok()
    }

    fn apply(
        &self,
        cell: &Arc<JobCell>,
        to: JobStatus,
        message: Option<String>,
    ) -> Result<JobStatus, CoordinatorError> {
        let (status, reason, released) = {
            let mut state = cell.lock();
            let from = state.status;
            if !from.can_transition_to(to) {
                return Err(CoordinatorError::IllegalTransition {
                    job: cell.id,
                    from,
                    to,
                });
            }
            let mut status = to;
            if to == JobStatus::Complete {
                let Some(batch) = state.produced.take() else {
                    return Err(CoordinatorError::ResultsPending { job: cell.id });
                };
                match self.inner.cache.append(&cell.signature, cell.id, &batch) {
                    Ok(outcome) => info!(
                        job = %cell.id,
                        signature = %cell.signature,
                        added = batch.len(),
                        stored_count = outcome.stored_count(),
                        "trajectories committed"
                    ),
                    Err(err) => {
                        warn!(job = %cell.id, error = %err, "cache append failed; halting job");
                        status = JobStatus::Halted;
                        state.message = Some(format!("cache append failed: {err}"));
                    }
                }
            }
            if let Some(message) = message {
                state.message = Some(message);
            }
            state.status = status;
            if status.is_terminal() {
                (status, state.message.clone(), state.workspace.take())
            } else {
                cell.status_tx.send_replace(status);
                (status, None, None)
            }
        };
        debug!(job = %cell.id, %status, "job transitioned");
        if status.is_terminal() {
            drop(released);
            self.retire(cell, status, reason);
            cell.status_tx.send_replace(status);
        }
        Ok(status)
    }

    fn apply_quietly(&self, cell: &Arc<JobCell>, to: JobStatus, message: String) {
        if let Err(err) = self.apply(cell, to, Some(message)) {
            debug!(job = %cell.id, error = %err, "transition superseded");
        }
    }

    /// Registry bookkeeping for a job that just reached `status`.
    fn retire(&self, cell: &Arc<JobCell>, status: JobStatus, reason: Option<String>) {
        let follow_up = {
            let mut reg = self.inner.lock_registry();
            let owner = reg.active.get(&cell.signature) == Some(&cell.id);
            let mut demand = None;
            if owner {
                reg.active.remove(&cell.signature);
                demand = reg.demand.remove(&cell.signature);
                match status {
                    JobStatus::Halted => {
                        reg.failures.insert(
                            cell.signature,
                            JobFailure {
                                job_id: cell.id,
                                message: reason.unwrap_or_else(|| "halted".to_owned()),
                            },
                        );
                    }
                    JobStatus::Complete => {
                        reg.failures.remove(&cell.signature);
                    }
                    _ => {}
                }
            }
            if status == JobStatus::Complete {
                reg.completions += 1;
            }
            reg.finished.push_back(cell.id);
            while reg.finished.len() > self.inner.config.finished_retention {
                if let Some(old) = reg.finished.pop_front() {
                    reg.jobs.remove(&old);
                }
            }
            demand.filter(|_| status == JobStatus::Complete && !reg.closed)
        };
        info!(job = %cell.id, %status, "job finished");

        if let Some(n) = follow_up {
            let request = cell.request.clone().with_trajectories(n);
            match self.reserve_delta(cell.signature, n, &request) {
                Ok(reservation) => {
                    debug!(n, ?reservation, "deferred demand re-reserved");
                }
                Err(err) => warn!(n, error = %err, "deferred demand dropped"),
            }
        }
    }

    async fn drive(self, cell: Arc<JobCell>) {
        let mut status_rx = cell.status_tx.subscribe();
        let policy = self.inner.config.retry.clone();
        let mut retries = 0u32;
        let closed = self.inner.lock_registry().closed;
        if closed {
            self.apply_quietly(&cell, JobStatus::Stopped, "shutdown".to_owned());
            return;
        }
        loop {
            if !until_runnable(&mut status_rx).await {
                return;
            }
            let Some(spec) = cell.work_spec() else {
                return;
            };
            match self.attempt(&cell, &mut status_rx, spec).await {
                Attempt::Produced(batch) => {
                    self.commit(&cell, &mut status_rx, batch).await;
                    return;
                }
                Attempt::Abandoned => return,
                Attempt::Failed(err) if !policy.allows_retry(retries) => {
                    warn!(job = %cell.id, error = %err, attempts = retries + 1, "retry budget exhausted");
                    // PAUSED cannot halt directly; wait for resume or stop.
                    if until_runnable(&mut status_rx).await {
                        self.apply_quietly(
                            &cell,
                            JobStatus::Halted,
                            format!("{err} (after {} attempts)", retries + 1),
                        );
                    }
                    return;
                }
                Attempt::Failed(err) => {
                    retries += 1;
                    let delay = policy.delay_for_attempt(retries);
                    warn!(job = %cell.id, error = %err, retries, ?delay, "executor attempt failed; retrying");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = until_terminal(&mut status_rx) => return,
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        cell: &Arc<JobCell>,
        status_rx: &mut watch::Receiver<JobStatus>,
        spec: WorkSpec,
    ) -> Attempt {
        let executor = &self.inner.executor;
        let submitted = tokio::select! {
            submitted = executor.submit(spec) => submitted,
            () = until_terminal(status_rx) => return Attempt::Abandoned,
        };
        let handle = match submitted {
            Ok(handle) => handle,
            Err(err) => return Attempt::Failed(err),
        };
        if !self.attach(cell, &handle) {
            executor.cancel(&handle).await;
            return Attempt::Abandoned;
        }
        let outcome = tokio::select! {
            outcome = executor.wait(&handle, self.inner.config.task_timeout) => outcome,
            () = until_terminal(status_rx) => {
                executor.cancel(&handle).await;
                return Attempt::Abandoned;
            }
        };
        match outcome {
            Ok(batch) if batch.len() as u64 == cell.delta => Attempt::Produced(batch),
            Ok(batch) => Attempt::Failed(ExecutorError::Failed(format!(
                "expected {} trajectories, executor returned {}",
                cell.delta,
                batch.len()
            ))),
            Err(err) => {
                executor.cancel(&handle).await;
                Attempt::Failed(err)
            }
        }
    }

    /// Move a freshly submitted job to `RUNNING`. `false` means the job went
    /// terminal in the meantime and the task must be cancelled.
    fn attach(&self, cell: &Arc<JobCell>, handle: &TaskHandle) -> bool {
        match self.apply(cell, JobStatus::Running, None) {
            Ok(_) => {
                info!(job = %cell.id, task = %handle, "job running");
                true
            }
            Err(CoordinatorError::IllegalTransition {
                from: JobStatus::Running | JobStatus::Paused,
                ..
            }) => true,
            Err(_) => false,
        }
    }

    async fn commit(
        &self,
        cell: &Arc<JobCell>,
        status_rx: &mut watch::Receiver<JobStatus>,
        batch: Vec<Trajectory>,
    ) {
        cell.lock().produced = Some(batch);
        loop {
            match self.apply(cell, JobStatus::Complete, None) {
                Ok(_) => return,
                Err(CoordinatorError::IllegalTransition {
                    from: JobStatus::Paused,
                    ..
                }) => {
                    debug!(job = %cell.id, "results held until resume");
                    if !until_runnable(status_rx).await {
                        return;
                    }
                }
                Err(err) => {
                    debug!(job = %cell.id, error = %err, "results discarded");
                    return;
                }
            }
        }
    }
}

/// `true` once the job may run (`READY`/`RUNNING`), `false` once it is
/// terminal. Waits through `PAUSED`.
async fn until_runnable(rx: &mut watch::Receiver<JobStatus>) -> bool {
    match rx
        .wait_for(|s| matches!(s, JobStatus::Ready | JobStatus::Running) || s.is_terminal())
        .await
    {
        Ok(status) => !status.is_terminal(),
        Err(_) => false,
    }
}

async fn until_terminal(rx: &mut watch::Receiver<JobStatus>) {
    let _ = rx.wait_for(|s| s.is_terminal()).await;
}
