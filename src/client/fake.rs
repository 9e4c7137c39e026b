//! Scriptable in-memory service manager
//!
//! Stands in for systemd in tests. Units are plain records; jobs finish
//! after a configurable delay and move the unit to the state the action
//! implies, unless the unit is marked sticky. Errors can be scripted per
//! unit and operation, once or permanently. Every completed call is logged.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use crate::state::{Action, ActiveState, ObservedState};

use super::{JobResult, ManagerError, ServiceManager, Ticket};

/// Which client operation a call or scripted error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Query,
    Apply,
    Await,
}

/// A call that reached the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub unit: String,
    pub op: FakeOp,
    pub action: Option<Action>,
}

struct FakeInner {
    units: HashMap<String, ObservedState>,
    enabled: HashSet<String>,
    once: HashMap<(String, FakeOp), VecDeque<ManagerError>>,
    always: HashMap<(String, FakeOp), ManagerError>,
    sticky: HashSet<String>,
    job_results: HashMap<String, String>,
    connected: bool,
    job_delay: Duration,
    call_delay: Duration,
    next_job: u64,
    jobs: HashMap<String, (String, Action)>,
    jobs_in_flight: HashMap<String, usize>,
    max_jobs_in_flight: HashMap<String, usize>,
    calls_in_flight: usize,
    max_calls_in_flight: usize,
    calls: Vec<FakeCall>,
}

pub struct FakeManager {
    inner: Mutex<FakeInner>,
}

impl Default for FakeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FakeInner {
                units: HashMap::new(),
                enabled: HashSet::new(),
                once: HashMap::new(),
                always: HashMap::new(),
                sticky: HashSet::new(),
                job_results: HashMap::new(),
                connected: true,
                job_delay: Duration::ZERO,
                call_delay: Duration::ZERO,
                next_job: 1,
                jobs: HashMap::new(),
                jobs_in_flight: HashMap::new(),
                max_jobs_in_flight: HashMap::new(),
                calls_in_flight: 0,
                max_calls_in_flight: 0,
                calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_unit(&self, unit: &str, active: ActiveState) {
        self.set_state(unit, active);
    }

    /// Set a unit's active state (creating the unit if needed)
    pub fn set_state(&self, unit: &str, active: ActiveState) {
        let observed = ObservedState::new(unit, active, default_sub(active));
        self.lock().units.insert(unit.to_string(), observed);
    }

    /// Forget a unit, as if its unit file was removed
    pub fn remove_unit(&self, unit: &str) {
        self.lock().units.remove(unit);
    }

    pub fn state(&self, unit: &str) -> Option<ObservedState> {
        self.lock().units.get(unit).cloned()
    }

    pub fn is_enabled(&self, unit: &str) -> bool {
        self.lock().enabled.contains(unit)
    }

    /// Fail the next `op` on `unit` with `err`; repeated calls queue up
    pub fn fail_next(&self, unit: &str, op: FakeOp, err: ManagerError) {
        self.lock()
            .once
            .entry((unit.to_string(), op))
            .or_default()
            .push_back(err);
    }

    /// Fail every `op` on `unit` with `err` until cleared
    pub fn fail_always(&self, unit: &str, op: FakeOp, err: ManagerError) {
        self.lock().always.insert((unit.to_string(), op), err);
    }

    pub fn clear_failures(&self, unit: &str) {
        let mut inner = self.lock();
        inner.once.retain(|(u, _), _| u != unit);
        inner.always.retain(|(u, _), _| u != unit);
    }

    /// Jobs on a sticky unit finish without changing its state
    pub fn set_sticky(&self, unit: &str, sticky: bool) {
        let mut inner = self.lock();
        if sticky {
            inner.sticky.insert(unit.to_string());
        } else {
            inner.sticky.remove(unit);
        }
    }

    /// Jobs on `unit` end with `result` ("failed", "dependency", ...) and
    /// leave the unit as it was; `None` goes back to "done"
    pub fn set_job_result(&self, unit: &str, result: Option<&str>) {
        let mut inner = self.lock();
        match result {
            Some(result) => inner.job_results.insert(unit.to_string(), result.to_string()),
            None => inner.job_results.remove(unit),
        };
    }

    /// Simulate a dropped bus: every call fails with `Unavailable`
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    pub fn reconnect(&self) {
        self.lock().connected = true;
    }

    /// How long a job takes between apply and completion
    pub fn set_job_delay(&self, delay: Duration) {
        self.lock().job_delay = delay;
    }

    /// How long query/apply take to answer
    pub fn set_call_delay(&self, delay: Duration) {
        self.lock().call_delay = delay;
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, unit: &str) -> Vec<FakeCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.unit == unit)
            .cloned()
            .collect()
    }

    /// Actions accepted for a unit, in order
    pub fn actions(&self, unit: &str) -> Vec<Action> {
        self.calls_for(unit)
            .into_iter()
            .filter(|c| c.op == FakeOp::Apply)
            .filter_map(|c| c.action)
            .collect()
    }

    pub fn count(&self, unit: &str, op: FakeOp) -> usize {
        self.calls_for(unit).iter().filter(|c| c.op == op).count()
    }

    /// Highest number of simultaneously outstanding jobs seen for a unit
    pub fn max_jobs_in_flight(&self, unit: &str) -> usize {
        self.lock().max_jobs_in_flight.get(unit).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous query/apply calls seen
    pub fn max_calls_in_flight(&self) -> usize {
        self.lock().max_calls_in_flight
    }

    fn record(&self, unit: &str, op: FakeOp, action: Option<Action>) {
        self.lock().calls.push(FakeCall {
            unit: unit.to_string(),
            op,
            action,
        });
    }

    fn scripted_error(&self, unit: &str, op: FakeOp) -> Option<ManagerError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Some(ManagerError::Unavailable("fake bus disconnected".into()));
        }
        let key = (unit.to_string(), op);
        if let Some(err) = inner.once.get_mut(&key).and_then(|q| q.pop_front()) {
            return Some(err);
        }
        inner.always.get(&key).cloned()
    }

    /// Simulated round trip: counts concurrency and honours the deadline
    async fn round_trip(&self, deadline: Instant) -> Result<(), ManagerError> {
        let delay = {
            let mut inner = self.lock();
            inner.calls_in_flight += 1;
            inner.max_calls_in_flight = inner.max_calls_in_flight.max(inner.calls_in_flight);
            inner.call_delay
        };
        let result = sleep_within(delay, deadline).await;
        self.lock().calls_in_flight -= 1;
        result
    }
}

fn default_sub(active: ActiveState) -> &'static str {
    match active {
        ActiveState::Inactive => "dead",
        ActiveState::Activating => "start",
        ActiveState::Active => "running",
        ActiveState::Deactivating => "stop",
        ActiveState::Failed => "failed",
    }
}

async fn sleep_within(delay: Duration, deadline: Instant) -> Result<(), ManagerError> {
    if delay.is_zero() {
        return Ok(());
    }
    tokio::time::timeout_at(deadline, tokio::time::sleep(delay))
        .await
        .map_err(|_| ManagerError::Timeout)
}

impl ServiceManager for FakeManager {
    async fn query(&self, unit: &str, deadline: Instant) -> Result<ObservedState, ManagerError> {
        self.round_trip(deadline).await?;
        self.record(unit, FakeOp::Query, None);
        if let Some(err) = self.scripted_error(unit, FakeOp::Query) {
            return Err(err);
        }
        self.state(unit)
            .ok_or_else(|| ManagerError::UnitUnknown(unit.to_string()))
    }

    async fn apply(&self, unit: &str, action: Action, deadline: Instant) -> Result<Ticket, ManagerError> {
        self.round_trip(deadline).await?;
        self.record(unit, FakeOp::Apply, Some(action));
        if let Some(err) = self.scripted_error(unit, FakeOp::Apply) {
            return Err(err);
        }

        let mut inner = self.lock();
        if !inner.units.contains_key(unit) {
            return Err(ManagerError::UnitUnknown(unit.to_string()));
        }

        if !action.creates_job() {
            if action == Action::Enable {
                inner.enabled.insert(unit.to_string());
            } else {
                inner.enabled.remove(unit);
            }
            return Ok(Ticket {
                unit: unit.to_string(),
                action,
                job: None,
                generation: 1,
            });
        }

        let job = format!("/org/freedesktop/systemd1/job/{}", inner.next_job);
        inner.next_job += 1;
        inner.jobs.insert(job.clone(), (unit.to_string(), action));

        let in_flight = inner.jobs_in_flight.entry(unit.to_string()).or_default();
        *in_flight += 1;
        let in_flight = *in_flight;
        let max = inner.max_jobs_in_flight.entry(unit.to_string()).or_default();
        *max = (*max).max(in_flight);

        Ok(Ticket {
            unit: unit.to_string(),
            action,
            job: Some(job),
            generation: 1,
        })
    }

    async fn await_job(&self, ticket: &Ticket, deadline: Instant) -> Result<JobResult, ManagerError> {
        let Some(job) = &ticket.job else {
            self.record(&ticket.unit, FakeOp::Await, Some(ticket.action));
            return Ok(JobResult::done());
        };

        let delay = self.lock().job_delay;
        let waited = sleep_within(delay, deadline).await;

        // The job finishes on the manager side whether or not we waited long enough
        let finished = {
            let mut inner = self.lock();
            let entry = inner.jobs.remove(job);
            let mut result = JobResult::done();
            if let Some((unit, action)) = &entry {
                if let Some(n) = inner.jobs_in_flight.get_mut(unit) {
                    *n = n.saturating_sub(1);
                }
                let scripted = inner.job_results.get(unit).cloned();
                if let Some(r) = scripted {
                    result = JobResult(r);
                } else if !inner.sticky.contains(unit) {
                    if let Some(state) = inner.units.get_mut(unit) {
                        let active = match action {
                            Action::Stop => ActiveState::Inactive,
                            _ => ActiveState::Active,
                        };
                        state.active = active;
                        state.sub = default_sub(active).to_string();
                        state.since = Utc::now();
                    }
                }
            }
            entry.map(|_| result)
        };
        self.record(&ticket.unit, FakeOp::Await, Some(ticket.action));

        waited?;
        let Some(result) = finished else {
            return Err(ManagerError::Unavailable(format!("unknown job {}", job)));
        };
        if let Some(err) = self.scripted_error(&ticket.unit, FakeOp::Await) {
            return Err(err);
        }
        Ok(result)
    }
}
