//! Supervisor facade
//!
//! Ties configuration, the throttled manager client, the reconciler and the
//! status aggregator together behind logical target names.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::{AggregateReport, StatusAggregator, SubscribeError, Subscription, UnitReport};
use crate::client::{deadline_after, ManagerError, ServiceManager, Throttled};
use crate::config::Config;
use crate::reconciler::Reconciler;
use crate::resolver::{resolve_all, ResolveError, UnitSpec};
use crate::state::{ActionHint, DesiredState, ObservedState, SessionStatus, TargetState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// The units a request touched and the request number each one got
#[derive(Debug)]
pub struct SessionHandle {
    units: BTreeMap<String, u64>,
    aggregator: StatusAggregator,
}

impl SessionHandle {
    pub fn units(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    /// Current report for this handle's units
    pub fn report(&self) -> AggregateReport {
        self.aggregator.snapshot().restrict(self.units())
    }

    /// Whether every unit has taken up its request, reached a terminal state
    /// and has no job left outstanding. An acknowledged (removed) unit counts
    /// as done.
    pub fn is_done(&self, report: &AggregateReport) -> bool {
        self.all_units(report, |r| r.status.is_terminal() && !r.outstanding)
    }

    /// Whether every unit has taken up its request and got past `Pending`:
    /// an action is in flight, a retry is scheduled, or the session ended.
    pub fn is_dispatched(&self, report: &AggregateReport) -> bool {
        self.all_units(report, |r| r.status != SessionStatus::Pending)
    }

    fn all_units(&self, report: &AggregateReport, done: impl Fn(&UnitReport) -> bool) -> bool {
        self.units.iter().all(|(unit, seq)| match report.get(unit) {
            Some(r) => r.request_seq >= *seq && done(r),
            None => true,
        })
    }

    /// Wait until all units are done or `timeout` elapses
    pub async fn wait(&self, timeout: Duration) -> AggregateReport {
        self.wait_until(timeout, Self::is_done).await
    }

    /// Wait until all units are dispatched or `timeout` elapses
    pub async fn wait_dispatched(&self, timeout: Duration) -> AggregateReport {
        self.wait_until(timeout, Self::is_dispatched).await
    }

    async fn wait_until(&self, timeout: Duration, done: fn(&Self, &AggregateReport) -> bool) -> AggregateReport {
        let deadline = deadline_after(timeout);
        let mut events = self.aggregator.subscribe();

        loop {
            let report = self.report();
            if done(self, &report) {
                return report;
            }

            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => return self.report(),
                Ok(Ok(Some(_))) => {}
                Ok(Ok(None)) => return self.report(),
                Ok(Err(SubscribeError::SlowConsumer { missed })) => {
                    log::debug!("Missed {} status event(s) while waiting, resubscribing", missed);
                    events = self.aggregator.subscribe();
                }
            }
        }
    }
}

pub struct Supervisor<M: ServiceManager> {
    config: Arc<Config>,
    manager: Arc<Throttled<M>>,
    reconciler: Reconciler<Throttled<M>>,
}

impl<M: ServiceManager> Supervisor<M> {
    pub fn new(config: Config, manager: M) -> Self {
        let settings = Arc::new(config.settings.clone());
        let manager = Arc::new(Throttled::new(manager, settings.max_concurrent_calls));
        let aggregator = StatusAggregator::new(settings.subscriber_buffer);
        let reconciler = Reconciler::new(Arc::clone(&manager), settings, aggregator);

        Self {
            config: Arc::new(config),
            manager,
            reconciler,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Throttled<M> {
        &self.manager
    }

    /// Configured logical names
    pub fn targets(&self) -> Vec<&str> {
        self.config.logical_names()
    }

    pub fn resolve<S: AsRef<str>>(&self, logicals: &[S]) -> Result<Vec<UnitSpec>, SupervisorError> {
        Ok(resolve_all(logicals, &self.config)?)
    }

    /// Drive every unit of `logical` towards `target`
    pub fn request_desired_state(
        &self,
        logical: &str,
        target: TargetState,
        hint: ActionHint,
    ) -> Result<SessionHandle, SupervisorError> {
        self.request_all(&[logical], target, hint)
    }

    /// Same as [`Self::request_desired_state`] for several names.
    /// Nothing is requested unless every name resolves.
    pub fn request_all<S: AsRef<str>>(
        &self,
        logicals: &[S],
        target: TargetState,
        hint: ActionHint,
    ) -> Result<SessionHandle, SupervisorError> {
        let specs = self.resolve(logicals)?;
        let desired = DesiredState::new(target, hint);
        Ok(self.submit(specs, |_| desired))
    }

    /// Drive every unit towards its configured `Expect=` state
    pub fn request_expected<S: AsRef<str>>(&self, logicals: &[S]) -> Result<SessionHandle, SupervisorError> {
        let specs = self.resolve(logicals)?;
        Ok(self.submit(specs, |spec| DesiredState::new(spec.expect, ActionHint::None)))
    }

    fn submit(&self, specs: Vec<UnitSpec>, desired: impl Fn(&UnitSpec) -> DesiredState) -> SessionHandle {
        let mut units = BTreeMap::new();
        for spec in specs {
            let unit = spec.unit.clone();
            let want = desired(&spec);
            let seq = self.reconciler.request(spec, want);
            units.insert(unit, seq);
        }
        SessionHandle {
            units,
            aggregator: self.reconciler.aggregator().clone(),
        }
    }

    pub fn report(&self) -> AggregateReport {
        self.reconciler.aggregator().snapshot()
    }

    pub fn subscribe(&self) -> Subscription {
        self.reconciler.aggregator().subscribe()
    }

    /// Cancel the sessions of `logical`'s units; returns how many had one
    pub fn cancel(&self, logical: &str) -> Result<usize, SupervisorError> {
        let specs = self.resolve(&[logical])?;
        Ok(specs.iter().filter(|s| self.reconciler.cancel(&s.unit)).count())
    }

    /// Remove terminal sessions of `logical`'s units; returns how many were removed
    pub async fn acknowledge(&self, logical: &str) -> Result<usize, SupervisorError> {
        let specs = self.resolve(&[logical])?;
        let mut removed = 0;
        for spec in &specs {
            if self.reconciler.acknowledge(&spec.unit).await {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Query the current state of `logical`'s units without starting sessions
    pub async fn observe<S: AsRef<str>>(
        &self,
        logicals: &[S],
    ) -> Result<Vec<(UnitSpec, Result<ObservedState, ManagerError>)>, SupervisorError> {
        let specs = self.resolve(logicals)?;
        let timeout = self.config.settings.call_timeout;

        let mut tasks = Vec::with_capacity(specs.len());
        for spec in specs {
            let manager = Arc::clone(&self.manager);
            tasks.push(tokio::spawn(async move {
                let result = manager.query(&spec.unit, deadline_after(timeout)).await;
                (spec, result)
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(entry) => results.push(entry),
                Err(e) => log::error!("Status query task failed: {}", e),
            }
        }
        Ok(results)
    }
}
