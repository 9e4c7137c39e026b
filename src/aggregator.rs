//! Status aggregation
//!
//! Workers publish a [`UnitReport`] after every session transition. The
//! aggregator keeps the latest report per unit for snapshots and fans each
//! one out to live subscribers as a [`StatusEvent`].
//!
//! Subscribers get a bounded buffer. Publishing never waits on them: one
//! that falls behind is told how many events it missed and is detached.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use futures_lite::Stream;
use tokio::sync::broadcast;

use crate::state::{DesiredState, ObservedState, SessionStatus};

/// Reportable state of one unit's session
#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub unit: String,
    pub logical: String,
    pub desired: DesiredState,
    pub status: SessionStatus,
    /// None until the unit has been queried once
    pub observed: Option<ObservedState>,
    pub retries: u32,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Bumps each time a new session takes over the unit
    pub generation: u64,
    /// Latest request this session answers
    pub request_seq: u64,
    /// A job is still pending on the manager, even if the session is terminal
    pub outstanding: bool,
}

/// One published transition
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub unit: String,
    pub observed: Option<ObservedState>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("subscriber fell behind and missed {missed} event(s)")]
    SlowConsumer { missed: u64 },
}

/// Overall verdict for a set of units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Converged,
    InProgress,
    Failed,
}

/// Point-in-time copy of the session table
#[derive(Debug, Clone)]
pub struct AggregateReport {
    pub units: BTreeMap<String, UnitReport>,
    pub taken_at: DateTime<Utc>,
}

impl AggregateReport {
    pub fn get(&self, unit: &str) -> Option<&UnitReport> {
        self.units.get(unit)
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn all_converged(&self) -> bool {
        self.units
            .values()
            .all(|r| r.status == SessionStatus::Converged)
    }

    pub fn any_failed(&self) -> bool {
        self.units
            .values()
            .any(|r| matches!(r.status, SessionStatus::Failed(_)))
    }

    /// Failed wins over in-progress; an empty report counts as converged
    pub fn outcome(&self) -> Outcome {
        if self.any_failed() {
            Outcome::Failed
        } else if self.all_converged() {
            Outcome::Converged
        } else {
            Outcome::InProgress
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.outcome() {
            Outcome::Converged => 0,
            Outcome::Failed => 1,
            Outcome::InProgress => 2,
        }
    }

    /// Keep only the given units
    pub fn restrict<'a>(mut self, units: impl IntoIterator<Item = &'a str>) -> Self {
        let keep: Vec<&str> = units.into_iter().collect();
        self.units.retain(|unit, _| keep.contains(&unit.as_str()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct StatusAggregator {
    table: Arc<RwLock<BTreeMap<String, UnitReport>>>,
    events: broadcast::Sender<StatusEvent>,
}

impl StatusAggregator {
    pub fn new(buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self {
            table: Arc::new(RwLock::new(BTreeMap::new())),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, UnitReport>> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, UnitReport>> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> AggregateReport {
        let units = self.read().clone();
        AggregateReport {
            units,
            taken_at: Utc::now(),
        }
    }

    pub fn get(&self, unit: &str) -> Option<UnitReport> {
        self.read().get(unit).cloned()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: Some(self.events.subscribe()),
        }
    }

    /// Store the report, then notify subscribers
    pub fn publish(&self, report: UnitReport) {
        let event = StatusEvent {
            unit: report.unit.clone(),
            observed: report.observed.clone(),
            status: report.status,
        };
        self.write().insert(report.unit.clone(), report);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn remove(&self, unit: &str) -> Option<UnitReport> {
        self.write().remove(unit)
    }
}

/// A live feed of status events
pub struct Subscription {
    rx: Option<broadcast::Receiver<StatusEvent>>,
}

impl Subscription {
    /// Next event; `Ok(None)` once the feed is closed or after a slow-consumer error
    pub async fn recv(&mut self) -> Result<Option<StatusEvent>, SubscribeError> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };
        match rx.recv().await {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Status subscriber lagged by {} event(s), detaching", missed);
                self.rx = None;
                Err(SubscribeError::SlowConsumer { missed })
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.rx = None;
                Ok(None)
            }
        }
    }

    pub fn is_detached(&self) -> bool {
        self.rx.is_none()
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<StatusEvent, SubscribeError>> {
        futures_lite::stream::unfold(self, |mut sub| async move {
            match sub.recv().await {
                Ok(Some(event)) => Some((Ok(event), sub)),
                Ok(None) => None,
                Err(e) => Some((Err(e), sub)),
            }
        })
    }
}
