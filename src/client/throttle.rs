//! Concurrency limiter for manager calls
//!
//! The manager bus is the contended resource: at most `limit` queries or
//! actions are outstanding at once. Waiting for a permit counts against
//! the call's deadline. Job waits hold no permit; the query that follows a
//! job goes through the limit like any other.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::state::{Action, ObservedState};

use super::{JobResult, ManagerError, ServiceManager, Ticket};

pub struct Throttled<M> {
    inner: M,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl<M: ServiceManager> Throttled<M> {
    pub fn new(inner: M, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner,
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Calls currently holding a permit
    pub fn in_use(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    async fn acquire(&self, deadline: Instant) -> Result<SemaphorePermit<'_>, ManagerError> {
        match tokio::time::timeout_at(deadline, self.permits.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(ManagerError::Unavailable("client is shutting down".into())),
            Err(_) => Err(ManagerError::Timeout),
        }
    }
}

impl<M: ServiceManager> ServiceManager for Throttled<M> {
    async fn query(&self, unit: &str, deadline: Instant) -> Result<ObservedState, ManagerError> {
        let _permit = self.acquire(deadline).await?;
        self.inner.query(unit, deadline).await
    }

    async fn apply(&self, unit: &str, action: Action, deadline: Instant) -> Result<Ticket, ManagerError> {
        let _permit = self.acquire(deadline).await?;
        self.inner.apply(unit, action, deadline).await
    }

    async fn await_job(&self, ticket: &Ticket, deadline: Instant) -> Result<JobResult, ManagerError> {
        self.inner.await_job(ticket, deadline).await
    }
}
