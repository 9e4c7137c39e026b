//! One unit's reconciliation session and the action decision

use tokio::time::Instant;

use crate::aggregator::UnitReport;
use crate::resolver::UnitSpec;
use crate::state::{Action, ActionHint, ActiveState, DesiredState, ObservedState, SessionStatus, TargetState};

/// What to do next given desired and observed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Converged,
    /// Unit is between states; check again later
    Wait,
    Act(Action),
}

/// Pick the minimal action. `hint_pending` is true until the hint's action
/// has been accepted by the manager.
pub fn decide(desired: &DesiredState, observed: &ObservedState, hint_pending: bool) -> Decision {
    if hint_pending {
        match desired.hint {
            ActionHint::None => {}
            ActionHint::Start => return Decision::Act(Action::Start),
            ActionHint::Stop => return Decision::Act(Action::Stop),
            ActionHint::Restart => return Decision::Act(Action::Restart),
            ActionHint::Reload if observed.active == ActiveState::Active => {
                return Decision::Act(Action::Reload)
            }
            ActionHint::Reload => {}
            ActionHint::Enable => return Decision::Act(Action::Enable),
            ActionHint::Disable => return Decision::Act(Action::Disable),
        }
    }

    if desired.satisfied_by(observed) {
        return Decision::Converged;
    }
    if observed.active.is_transitional() {
        return Decision::Wait;
    }

    match (desired.target, observed.active) {
        (TargetState::Active, ActiveState::Failed) => Decision::Act(Action::Restart),
        (TargetState::Active, _) => Decision::Act(Action::Start),
        (TargetState::Inactive, _) => Decision::Act(Action::Stop),
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationSession {
    pub spec: UnitSpec,
    pub desired: DesiredState,
    pub observed: Option<ObservedState>,
    pub retries: u32,
    pub attempts: u32,
    pub next_retry: Option<Instant>,
    pub status: SessionStatus,
    pub last_error: Option<String>,
    pub started: Instant,
    pub generation: u64,
    pub request_seq: u64,
    pub hint_pending: bool,
    /// A job accepted by the manager has not resolved yet
    pub outstanding: bool,
}

impl ReconciliationSession {
    pub fn new(
        spec: UnitSpec,
        desired: DesiredState,
        observed: Option<ObservedState>,
        generation: u64,
        request_seq: u64,
    ) -> Self {
        Self {
            spec,
            desired,
            observed,
            retries: 0,
            attempts: 0,
            next_retry: None,
            status: SessionStatus::Pending,
            last_error: None,
            started: Instant::now(),
            generation,
            request_seq,
            hint_pending: desired.hint != ActionHint::None,
            outstanding: false,
        }
    }

    pub fn unit(&self) -> &str {
        &self.spec.unit
    }

    /// Whether a new request for `desired` can be folded into this session
    pub fn absorbs(&self, desired: &DesiredState) -> bool {
        if self.desired != *desired {
            return false;
        }
        match self.status {
            SessionStatus::Failed(_) => false,
            // An explicit action asked for again is a new request
            SessionStatus::Converged => desired.hint == ActionHint::None,
            _ => true,
        }
    }

    pub fn view(&self) -> UnitReport {
        UnitReport {
            unit: self.spec.unit.clone(),
            logical: self.spec.logical.clone(),
            desired: self.desired,
            status: self.status,
            observed: self.observed.clone(),
            retries: self.retries,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            generation: self.generation,
            request_seq: self.request_seq,
            outstanding: self.outstanding,
        }
    }
}
