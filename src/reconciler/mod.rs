//! State reconciler
//!
//! One worker task per unit owns that unit's [`ReconciliationSession`] and
//! is the only writer of its published report. Requests reach the worker
//! through a channel and are read only between steps, so actions on a unit
//! are issued in order and never overlap.
//!
//! ```text
//!   Pending ──► InFlight ──► Converged
//!      ▲           │
//!      └─ Retrying ◄┘──► Failed
//! ```

mod session;

pub use session::{decide, Decision, ReconciliationSession};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::aggregator::StatusAggregator;
use crate::client::{deadline_after, ManagerError, ServiceManager};
use crate::config::SupervisorSettings;
use crate::resolver::UnitSpec;
use crate::state::{DesiredState, FailReason, ObservedState, SessionStatus};

enum Command {
    Desired {
        spec: UnitSpec,
        desired: DesiredState,
        seq: u64,
    },
    Acknowledge(oneshot::Sender<bool>),
}

struct WorkerHandle {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    /// Every session whose request sequence is at or below this value is cancelled
    cancel: watch::Sender<u64>,
}

type Registry = Mutex<HashMap<String, WorkerHandle>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, WorkerHandle>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Reconciler<M> {
    manager: Arc<M>,
    settings: Arc<SupervisorSettings>,
    aggregator: StatusAggregator,
    workers: Arc<Registry>,
    /// Request sequence; only advanced while holding the registry lock
    seq: AtomicU64,
    generations: Arc<AtomicU64>,
    worker_ids: AtomicU64,
}

impl<M: ServiceManager> Reconciler<M> {
    pub fn new(manager: Arc<M>, settings: Arc<SupervisorSettings>, aggregator: StatusAggregator) -> Self {
        Self {
            manager,
            settings,
            aggregator,
            workers: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicU64::new(0),
            generations: Arc::new(AtomicU64::new(0)),
            worker_ids: AtomicU64::new(0),
        }
    }

    pub fn aggregator(&self) -> &StatusAggregator {
        &self.aggregator
    }

    /// Ask for `spec.unit` to reach `desired`. Returns the request's sequence
    /// number; the unit's report carries it once the request is taken up.
    pub fn request(&self, spec: UnitSpec, desired: DesiredState) -> u64 {
        let mut workers = lock(&self.workers);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(handle) = workers.get(&spec.unit) {
            let cmd = Command::Desired {
                spec: spec.clone(),
                desired,
                seq,
            };
            if handle.commands.send(cmd).is_ok() {
                log::debug!("{}: queued request #{} for {}", spec.unit, seq, desired);
                return seq;
            }
            log::warn!("{}: worker is gone, starting a new one", spec.unit);
        }

        let unit = spec.unit.clone();
        let id = self.worker_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(0);

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let session = ReconciliationSession::new(spec, desired, None, generation, seq);
        self.aggregator.publish(session.view());

        let worker = Worker {
            id,
            manager: Arc::clone(&self.manager),
            settings: Arc::clone(&self.settings),
            aggregator: self.aggregator.clone(),
            registry: Arc::downgrade(&self.workers),
            generations: Arc::clone(&self.generations),
            commands: commands_rx,
            backlog: VecDeque::new(),
            cancel: cancel_rx,
            session,
        };
        workers.insert(
            unit.clone(),
            WorkerHandle {
                id,
                commands: commands_tx,
                cancel: cancel_tx,
            },
        );
        log::debug!("{}: new session for request #{} ({})", unit, seq, desired);
        tokio::spawn(worker.run());
        seq
    }

    /// Cancel every request for `unit` made so far. Returns false if the unit
    /// has no session.
    pub fn cancel(&self, unit: &str) -> bool {
        let workers = lock(&self.workers);
        match workers.get(unit) {
            Some(handle) => {
                handle.cancel.send_replace(self.seq.load(Ordering::SeqCst));
                true
            }
            None => false,
        }
    }

    /// Remove a terminal session. Returns false if the unit has no session or
    /// its session is still live when the worker reads the request, which
    /// happens between steps (after an outstanding job resolves).
    pub async fn acknowledge(&self, unit: &str) -> bool {
        let reply = {
            let workers = lock(&self.workers);
            let Some(handle) = workers.get(unit) else {
                return false;
            };
            let (tx, rx) = oneshot::channel();
            if handle.commands.send(Command::Acknowledge(tx)).is_err() {
                return false;
            }
            rx
        };
        reply.await.unwrap_or(false)
    }

    /// Units with a session, terminal or not
    pub fn units(&self) -> Vec<String> {
        let mut units: Vec<String> = lock(&self.workers).keys().cloned().collect();
        units.sort();
        units
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Why a retry wait ended
enum Wake {
    Due,
    Command(Option<Command>),
    Cancelled,
}

struct Worker<M> {
    id: u64,
    manager: Arc<M>,
    settings: Arc<SupervisorSettings>,
    aggregator: StatusAggregator,
    registry: Weak<Registry>,
    generations: Arc<AtomicU64>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Commands taken off the channel but not yet handled
    backlog: VecDeque<Command>,
    cancel: watch::Receiver<u64>,
    session: ReconciliationSession,
}

/// Resolves once every request up to `seq` is cancelled; never if the
/// reconciler is gone
async fn cancelled(rx: &mut watch::Receiver<u64>, seq: u64) {
    let hit = rx.wait_for(|c| *c >= seq).await.is_ok();
    if !hit {
        std::future::pending::<()>().await;
    }
}

impl<M: ServiceManager> Worker<M> {
    async fn run(mut self) {
        loop {
            match self.next_queued() {
                Ok(Some(cmd)) => {
                    if let Flow::Exit = self.handle(cmd) {
                        return;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(()) => return,
            }

            if !self.session.status.is_terminal() && self.check_cancelled() {
                continue;
            }

            match self.session.status {
                SessionStatus::Converged | SessionStatus::Failed(_) => match self.commands.recv().await {
                    Some(cmd) => {
                        if let Flow::Exit = self.handle(cmd) {
                            return;
                        }
                    }
                    None => return,
                },
                SessionStatus::Retrying => {
                    let at = self.session.next_retry.unwrap_or_else(Instant::now);
                    let seq = self.session.request_seq;
                    let wake = tokio::select! {
                        _ = tokio::time::sleep_until(at) => Wake::Due,
                        cmd = self.commands.recv() => Wake::Command(cmd),
                        _ = cancelled(&mut self.cancel, seq) => Wake::Cancelled,
                    };
                    match wake {
                        Wake::Due => self.attempt().await,
                        Wake::Command(Some(cmd)) => {
                            if let Flow::Exit = self.handle(cmd) {
                                return;
                            }
                        }
                        Wake::Command(None) => return,
                        // picked up at the top of the loop
                        Wake::Cancelled => {}
                    }
                }
                SessionStatus::Pending | SessionStatus::InFlight => self.attempt().await,
            }
        }
    }

    /// Next command without waiting; `Err` once the reconciler is gone
    fn next_queued(&mut self) -> Result<Option<Command>, ()> {
        if let Some(cmd) = self.backlog.pop_front() {
            return Ok(Some(cmd));
        }
        match self.commands.try_recv() {
            Ok(cmd) => Ok(Some(cmd)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(()),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() >= self.session.request_seq
    }

    /// Mark the session cancelled if its request was. True when cancelled.
    fn check_cancelled(&mut self) -> bool {
        if !self.is_cancelled() {
            return false;
        }
        if self.session.status != SessionStatus::Failed(FailReason::Cancelled) {
            self.session.last_error = Some("cancelled".to_string());
            self.finish(SessionStatus::Failed(FailReason::Cancelled));
        }
        true
    }

    /// Drive a manager call to completion. A cancellation while it runs
    /// marks the session failed at once; the call itself is not abandoned.
    async fn guarded<F: Future>(&mut self, call: F) -> F::Output {
        let seq = self.session.request_seq;
        tokio::pin!(call);
        if !self.is_cancelled() {
            tokio::select! {
                biased;
                out = &mut call => return out,
                _ = cancelled(&mut self.cancel, seq) => {}
            }
        }
        self.check_cancelled();
        call.await
    }

    fn unit(&self) -> String {
        self.session.unit().to_string()
    }

    fn publish(&self) {
        self.aggregator.publish(self.session.view());
    }

    fn handle(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Desired { spec, desired, seq } => {
                self.supersede(spec, desired, seq);
                Flow::Continue
            }
            Command::Acknowledge(reply) => self.acknowledge(reply),
        }
    }

    fn supersede(&mut self, spec: UnitSpec, desired: DesiredState, seq: u64) {
        if self.session.absorbs(&desired) {
            log::debug!("{}: request #{} matches the current session", spec.unit, seq);
            self.session.spec = spec;
            self.session.request_seq = seq;
            self.publish();
            return;
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!(
            "{}: {} (request #{}) replaces {} ({})",
            spec.unit,
            desired,
            seq,
            self.session.desired,
            self.session.status
        );
        let observed = self.session.observed.take();
        self.session = ReconciliationSession::new(spec, desired, observed, generation, seq);
        self.publish();
    }

    fn acknowledge(&mut self, reply: oneshot::Sender<bool>) -> Flow {
        if !self.session.status.is_terminal() {
            let _ = reply.send(false);
            return Flow::Continue;
        }

        let Some(registry) = self.registry.upgrade() else {
            let _ = reply.send(true);
            return Flow::Exit;
        };

        let mut workers = lock(&registry);
        // Nothing can be queued after this drain while the lock is held
        while let Ok(cmd) = self.commands.try_recv() {
            self.backlog.push_back(cmd);
        }
        if self
            .backlog
            .iter()
            .any(|cmd| matches!(cmd, Command::Desired { .. }))
        {
            let _ = reply.send(false);
            return Flow::Continue;
        }

        let unit = self.unit();
        if workers.get(&unit).map(|h| h.id) == Some(self.id) {
            workers.remove(&unit);
        }
        self.aggregator.remove(&unit);
        drop(workers);

        log::debug!("{}: session acknowledged", unit);
        let _ = reply.send(true);
        for cmd in self.backlog.drain(..) {
            if let Command::Acknowledge(other) = cmd {
                let _ = other.send(true);
            }
        }
        Flow::Exit
    }

    fn observe(&mut self, observed: ObservedState) {
        let observed = observed.supersede(self.session.observed.as_ref());
        self.session.observed = Some(observed);
    }

    fn finish(&mut self, status: SessionStatus) {
        let unit = self.unit();
        self.session.status = status;
        self.session.next_retry = None;
        match status {
            SessionStatus::Converged => {
                self.session.last_error = None;
                log::info!(
                    "{}: converged to {} after {} attempt(s)",
                    unit,
                    self.session.desired,
                    self.session.attempts
                );
            }
            _ => log::warn!(
                "{}: {} after {} attempt(s){}",
                unit,
                status,
                self.session.attempts,
                self.session
                    .last_error
                    .as_deref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            ),
        }
        self.publish();
    }

    fn on_error(&mut self, err: ManagerError) {
        log::debug!("{}: attempt {} failed: {}", self.unit(), self.session.attempts, err);
        self.session.last_error = Some(err.to_string());
        if err.is_retryable() {
            return self.retry();
        }
        let reason = match err {
            ManagerError::PermissionDenied(_) => FailReason::PermissionDenied,
            _ => FailReason::InvalidTransition,
        };
        self.finish(SessionStatus::Failed(reason));
    }

    fn retry(&mut self) {
        if self.session.retries >= self.settings.max_retries {
            return self.finish(SessionStatus::Failed(FailReason::RetriesExhausted));
        }

        let delay = self.settings.retry_backoff.delay(self.session.retries);
        let next = deadline_after(delay);
        if next > self.window_end() {
            return self.finish(SessionStatus::Failed(FailReason::WindowExceeded));
        }

        self.session.retries += 1;
        self.session.next_retry = Some(next);
        self.session.status = SessionStatus::Retrying;
        log::debug!(
            "{}: retry {}/{} in {:?}",
            self.unit(),
            self.session.retries,
            self.settings.max_retries,
            delay
        );
        self.publish();
    }

    fn window_end(&self) -> Instant {
        let started = self.session.started;
        started
            .checked_add(self.settings.supervision_window)
            .unwrap_or_else(|| started.max(deadline_after(self.settings.supervision_window)))
    }

    /// Query, decide, act and wait for the result
    async fn attempt(&mut self) {
        let unit = self.unit();
        let manager = Arc::clone(&self.manager);
        self.session.attempts += 1;

        let queried = self
            .guarded(manager.query(&unit, deadline_after(self.settings.call_timeout)))
            .await;
        let observed = match queried {
            Ok(observed) => observed,
            Err(ManagerError::UnitUnknown(_)) => ObservedState::not_found(&unit),
            Err(e) if !self.check_cancelled() => return self.on_error(e),
            Err(_) => return,
        };
        self.observe(observed);
        if self.check_cancelled() {
            return self.publish();
        }

        let decision = match &self.session.observed {
            Some(observed) => decide(&self.session.desired, observed, self.session.hint_pending),
            None => Decision::Wait,
        };

        let action = match decision {
            Decision::Converged => return self.finish(SessionStatus::Converged),
            Decision::Wait => {
                self.session.last_error = Some(format!("unit still {}", self.observed_state()));
                return self.retry();
            }
            Decision::Act(action) => action,
        };

        // From here until the ticket resolves a job may exist on the manager side
        self.session.outstanding = true;
        let applied = self
            .guarded(manager.apply(&unit, action, deadline_after(self.settings.call_timeout)))
            .await;
        let ticket = match applied {
            Ok(ticket) => ticket,
            Err(e) => {
                self.session.outstanding = false;
                if self.check_cancelled() {
                    return self.publish();
                }
                return self.on_error(e);
            }
        };
        self.session.hint_pending = false;
        if !self.check_cancelled() {
            self.session.status = SessionStatus::InFlight;
        }
        self.publish();

        let waited = self
            .guarded(manager.await_ticket(&ticket, deadline_after(self.settings.job_timeout)))
            .await;
        self.session.outstanding = false;
        let observed = match waited {
            Ok(observed) => observed,
            Err(e) if !self.check_cancelled() => return self.on_error(e),
            Err(_) => return self.publish(),
        };
        let job_error = observed.error.clone();
        self.observe(observed);
        if self.check_cancelled() {
            return self.publish();
        }

        if !action.creates_job() {
            // Unit files done; now converge the active state
            self.session.status = SessionStatus::Pending;
            self.publish();
            return;
        }

        let satisfied = self
            .session
            .observed
            .as_ref()
            .is_some_and(|o| self.session.desired.satisfied_by(o));
        if satisfied {
            self.finish(SessionStatus::Converged);
        } else {
            let state = self.observed_state();
            self.session.last_error = Some(job_error.unwrap_or_else(|| format!("{} left unit {}", action, state)));
            self.retry();
        }
    }

    fn observed_state(&self) -> &'static str {
        self.session
            .observed
            .as_ref()
            .map(|o| o.active.as_str())
            .unwrap_or("unknown")
    }
}
