//! Service manager client
//!
//! [`ServiceManager`] is the capability the reconciler drives. It is
//! implemented by [`SystemdClient`] (D-Bus), wrapped by [`Throttled`] to
//! bound load on the manager, and faked by [`FakeManager`] in tests.
//!
//! Every call takes a deadline; when it passes the call fails with
//! [`ManagerError::Timeout`].

pub mod fake;
mod link;
mod systemd;
mod throttle;

pub use fake::{FakeCall, FakeManager, FakeOp};
pub use link::{Connector, Link};
pub use systemd::{BusKind, SystemdClient};
pub use throttle::Throttled;

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::state::{Action, ObservedState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error("service manager unavailable: {0}")]
    Unavailable(String),

    #[error("service manager did not answer in time")]
    Timeout,

    #[error("unit unknown to the service manager: {0}")]
    UnitUnknown(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("manager rejected the action: {0}")]
    InvalidTransition(String),
}

impl ManagerError {
    /// Transient errors are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout | Self::UnitUnknown(_))
    }
}

/// Handle for an action the manager has accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub unit: String,
    pub action: Action,
    /// Job object path; `None` for actions that complete synchronously
    pub job: Option<String>,
    /// Connection generation the job was issued on
    pub generation: u64,
}

/// Longest deadline handed out; larger timeouts are clamped to it
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Deadline `timeout` from now. Huge timeouts are clamped instead of
/// overflowing the clock.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now)
}

/// How a job ended, as the manager reports it ("done", "failed", "canceled", ...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult(pub String);

impl JobResult {
    pub fn done() -> Self {
        Self("done".to_string())
    }

    pub fn is_done(&self) -> bool {
        self.0 == "done"
    }
}

/// Query and mutate units through the service manager
pub trait ServiceManager: Send + Sync + 'static {
    /// Current state of a unit
    fn query(
        &self,
        unit: &str,
        deadline: Instant,
    ) -> impl Future<Output = Result<ObservedState, ManagerError>> + Send;

    /// Ask the manager to perform an action; returns once it is accepted
    fn apply(
        &self,
        unit: &str,
        action: Action,
        deadline: Instant,
    ) -> impl Future<Output = Result<Ticket, ManagerError>> + Send;

    /// Wait for the ticket's job to finish and report how it ended. Tickets
    /// without a job are done at once.
    fn await_job(
        &self,
        ticket: &Ticket,
        deadline: Instant,
    ) -> impl Future<Output = Result<JobResult, ManagerError>> + Send;

    /// Wait for the ticket's job, then report the unit's state. A job that
    /// did not finish cleanly is attached as the state's error.
    fn await_ticket(
        &self,
        ticket: &Ticket,
        deadline: Instant,
    ) -> impl Future<Output = Result<ObservedState, ManagerError>> + Send {
        async move {
            let job = self.await_job(ticket, deadline).await?;
            let observed = self.query(&ticket.unit, deadline).await?;
            if job.is_done() {
                Ok(observed)
            } else {
                Ok(observed.with_error(format!("{} job finished with result '{}'", ticket.action, job.0)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(ManagerError::Unavailable("gone".into()).is_retryable());
        assert!(ManagerError::Timeout.is_retryable());
        assert!(ManagerError::UnitUnknown("x.service".into()).is_retryable());
        assert!(!ManagerError::PermissionDenied("polkit".into()).is_retryable());
        assert!(!ManagerError::InvalidTransition("masked".into()).is_retryable());
    }

    #[test]
    fn test_huge_timeout_is_clamped() {
        let deadline = deadline_after(Duration::from_secs(u64::MAX));
        assert!(deadline > Instant::now() + Duration::from_secs(86400 * 365));
        assert!(deadline_after(Duration::from_secs(5)) <= Instant::now() + Duration::from_secs(5));
    }

    #[test]
    fn test_job_result() {
        assert!(JobResult::done().is_done());
        assert!(!JobResult("dependency".into()).is_done());
    }
}
