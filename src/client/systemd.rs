//! systemd over D-Bus
//!
//! One bus connection per [`Link`] generation. Each connection subscribes to
//! JobRemoved before any job is issued, and a listener task routes job
//! results to whoever is waiting for them. Results that arrive before the
//! job is registered are held in a small cache.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_lite::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use zbus::zvariant::OwnedValue;
use zbus::Connection;

use crate::backoff::Backoff;
use crate::dbus::{observed_from_properties, unit_object_path, SystemdManagerProxy, UnitPropertiesProxy, UNIT_INTERFACE};
use crate::state::{Action, LoadState, ObservedState};

use super::link::{Connector, Link};
use super::{JobResult, ManagerError, ServiceManager, Ticket};

/// Job mode for every job-creating call
const JOB_MODE: &str = "replace";

/// Results kept for jobs nobody has registered yet
const EARLY_RESULTS: usize = 256;

/// Which bus the manager lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    /// System manager (PID 1)
    System,
    /// Per-user manager
    Session,
}

enum JobSlot {
    Issued,
    Waiting(oneshot::Sender<String>),
}

enum JobWait {
    Ready(String),
    Pending(oneshot::Receiver<String>),
}

/// Outstanding jobs on one connection
#[derive(Default)]
struct JobTable {
    inner: Mutex<JobTableInner>,
}

#[derive(Default)]
struct JobTableInner {
    slots: HashMap<String, JobSlot>,
    early: VecDeque<(String, String)>,
}

impl JobTable {
    fn lock(&self) -> MutexGuard<'_, JobTableInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a job returned by the manager
    fn issued(&self, job: &str) {
        let mut inner = self.lock();
        if inner.early.iter().any(|(j, _)| j == job) {
            return;
        }
        inner.slots.insert(job.to_string(), JobSlot::Issued);
    }

    /// Record the result of a finished job
    fn complete(&self, job: &str, result: &str) {
        let mut inner = self.lock();
        match inner.slots.remove(job) {
            Some(JobSlot::Waiting(tx)) => {
                let _ = tx.send(result.to_string());
            }
            Some(JobSlot::Issued) | None => {
                if inner.early.len() >= EARLY_RESULTS {
                    inner.early.pop_front();
                }
                inner.early.push_back((job.to_string(), result.to_string()));
            }
        }
    }

    fn wait(&self, job: &str) -> Result<JobWait, ManagerError> {
        let mut inner = self.lock();
        if let Some(pos) = inner.early.iter().position(|(j, _)| j == job) {
            if let Some((_, result)) = inner.early.remove(pos) {
                return Ok(JobWait::Ready(result));
            }
        }
        match inner.slots.get(job) {
            Some(JobSlot::Issued) => {
                let (tx, rx) = oneshot::channel();
                inner.slots.insert(job.to_string(), JobSlot::Waiting(tx));
                Ok(JobWait::Pending(rx))
            }
            Some(JobSlot::Waiting(_)) => Err(ManagerError::Unavailable(format!(
                "job {} already has a waiter",
                job
            ))),
            None => Err(ManagerError::Unavailable(format!("job {} is not known", job))),
        }
    }

    fn forget(&self, job: &str) {
        self.lock().slots.remove(job);
    }

    /// Drop every waiter; their receivers see the channel close
    fn abandon_all(&self) {
        let mut inner = self.lock();
        inner.slots.clear();
        inner.early.clear();
    }
}

/// A live bus connection with its JobRemoved listener
pub struct BusSession {
    conn: Connection,
    manager: SystemdManagerProxy<'static>,
    jobs: Arc<JobTable>,
    alive: Arc<AtomicBool>,
    listener: JoinHandle<()>,
}

impl Drop for BusSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl BusSession {
    async fn open(kind: BusKind) -> zbus::Result<Arc<Self>> {
        let conn = match kind {
            BusKind::System => Connection::system().await?,
            BusKind::Session => Connection::session().await?,
        };
        let manager = SystemdManagerProxy::new(&conn).await?;

        // Listen before subscribing so no JobRemoved for our jobs is missed
        let mut removed = manager.receive_job_removed().await?;
        if let Err(e) = manager.subscribe().await {
            log::warn!("Subscribe to systemd signals failed: {}", e);
        }

        let jobs = Arc::new(JobTable::default());
        let alive = Arc::new(AtomicBool::new(true));

        let listener = {
            let jobs = Arc::clone(&jobs);
            let alive = Arc::clone(&alive);
            tokio::spawn(async move {
                while let Some(signal) = removed.next().await {
                    match signal.args() {
                        Ok(args) => {
                            log::trace!("JobRemoved {} {} {}", args.job.as_str(), args.unit, args.result);
                            jobs.complete(args.job.as_str(), args.result);
                        }
                        Err(e) => log::debug!("Malformed JobRemoved signal: {}", e),
                    }
                }
                log::debug!("JobRemoved stream ended");
                alive.store(false, Ordering::SeqCst);
                jobs.abandon_all();
            })
        };

        Ok(Arc::new(Self {
            conn,
            manager,
            jobs,
            alive,
            listener,
        }))
    }

    async fn properties(&self, unit: &str) -> zbus::Result<HashMap<String, OwnedValue>> {
        let proxy = UnitPropertiesProxy::builder(&self.conn)
            .path(unit_object_path(unit))?
            .cache_properties(zbus::proxy::CacheProperties::No)
            .build()
            .await?;
        proxy.get_all(UNIT_INTERFACE).await
    }

    /// Issue an action; returns the job path for job-creating actions
    async fn issue(&self, unit: &str, action: Action) -> zbus::Result<Option<String>> {
        let job = match action {
            Action::Start => self.manager.start_unit(unit, JOB_MODE).await?,
            Action::Stop => self.manager.stop_unit(unit, JOB_MODE).await?,
            Action::Restart => self.manager.restart_unit(unit, JOB_MODE).await?,
            Action::Reload => self.manager.reload_unit(unit, JOB_MODE).await?,
            Action::Enable => {
                let (_, changes) = self.manager.enable_unit_files(&[unit], false, false).await?;
                log::debug!("Enabled {} ({} change(s))", unit, changes.len());
                self.manager.reload().await?;
                return Ok(None);
            }
            Action::Disable => {
                let changes = self.manager.disable_unit_files(&[unit], false).await?;
                log::debug!("Disabled {} ({} change(s))", unit, changes.len());
                self.manager.reload().await?;
                return Ok(None);
            }
        };
        let job = job.as_str().to_string();
        self.jobs.issued(&job);
        Ok(Some(job))
    }
}

pub struct BusConnector {
    kind: BusKind,
}

impl Connector for BusConnector {
    type Conn = Arc<BusSession>;

    async fn connect(&self) -> Result<Arc<BusSession>, ManagerError> {
        BusSession::open(self.kind)
            .await
            .map_err(|e| ManagerError::Unavailable(e.to_string()))
    }

    fn is_alive(&self, conn: &Arc<BusSession>) -> bool {
        conn.alive.load(Ordering::SeqCst)
    }
}

/// [`ServiceManager`] backed by the systemd D-Bus API
#[derive(Clone)]
pub struct SystemdClient {
    link: Link<BusConnector>,
}

impl SystemdClient {
    /// Connect now; fails if the bus is unreachable
    pub async fn connect(kind: BusKind, backoff: Backoff) -> Result<Self, ManagerError> {
        let link = Link::connect(BusConnector { kind }, backoff).await?;
        Ok(Self { link })
    }

    /// Connect in the background; calls fail with `Unavailable` until connected
    pub fn lazy(kind: BusKind, backoff: Backoff) -> Self {
        Self {
            link: Link::lazy(BusConnector { kind }, backoff),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn fail(&self, err: zbus::Error, generation: u64, unit: &str) -> ManagerError {
        if is_transport_error(&err) {
            self.link.mark_lost(generation);
        }
        classify_error(&err, unit)
    }
}

impl ServiceManager for SystemdClient {
    async fn query(&self, unit: &str, deadline: Instant) -> Result<ObservedState, ManagerError> {
        let (session, generation) = self.link.get()?;
        let props = tokio::time::timeout_at(deadline, session.properties(unit))
            .await
            .map_err(|_| ManagerError::Timeout)?
            .map_err(|e| self.fail(e, generation, unit))?;

        let observed = observed_from_properties(unit, &props).map_err(ManagerError::Unavailable)?;
        if observed.load == LoadState::NotFound {
            return Err(ManagerError::UnitUnknown(unit.to_string()));
        }
        Ok(observed)
    }

    async fn apply(&self, unit: &str, action: Action, deadline: Instant) -> Result<Ticket, ManagerError> {
        let (session, generation) = self.link.get()?;
        log::debug!("{} {}", action, unit);
        let job = tokio::time::timeout_at(deadline, session.issue(unit, action))
            .await
            .map_err(|_| ManagerError::Timeout)?
            .map_err(|e| self.fail(e, generation, unit))?;

        Ok(Ticket {
            unit: unit.to_string(),
            action,
            job,
            generation,
        })
    }

    async fn await_job(&self, ticket: &Ticket, deadline: Instant) -> Result<JobResult, ManagerError> {
        let Some(job) = &ticket.job else {
            return Ok(JobResult::done());
        };

        let (session, generation) = self.link.get()?;
        if generation != ticket.generation {
            return Err(ManagerError::Unavailable(format!(
                "connection replaced while {} was pending",
                job
            )));
        }

        let result = match session.jobs.wait(job)? {
            JobWait::Ready(result) => result,
            JobWait::Pending(rx) => match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => {
                    return Err(ManagerError::Unavailable(format!(
                        "connection lost while {} was pending",
                        job
                    )))
                }
                Err(_) => {
                    session.jobs.forget(job);
                    return Err(ManagerError::Timeout);
                }
            },
        };
        log::debug!("{} {}: job {} {}", ticket.action, ticket.unit, job, result);
        Ok(JobResult(result))
    }
}

fn is_transport_error(err: &zbus::Error) -> bool {
    matches!(err, zbus::Error::InputOutput(_))
}

/// Map a D-Bus error name to a manager error
fn classify_name(name: &str, detail: String, unit: &str) -> ManagerError {
    match name {
        "org.freedesktop.systemd1.NoSuchUnit" | "org.freedesktop.systemd1.LoadFailed" => {
            ManagerError::UnitUnknown(unit.to_string())
        }
        "org.freedesktop.DBus.Error.AccessDenied"
        | "org.freedesktop.DBus.Error.InteractiveAuthorizationRequired" => {
            ManagerError::PermissionDenied(detail)
        }
        "org.freedesktop.systemd1.JobTypeNotApplicable"
        | "org.freedesktop.systemd1.TransactionIsDestructive"
        | "org.freedesktop.systemd1.OnlyByDependency"
        | "org.freedesktop.systemd1.UnitMasked"
        | "org.freedesktop.systemd1.NoSuchUnitFile" => ManagerError::InvalidTransition(detail),
        "org.freedesktop.DBus.Error.NoReply" | "org.freedesktop.DBus.Error.Timeout" => ManagerError::Timeout,
        _ => ManagerError::Unavailable(format!("{}: {}", name, detail)),
    }
}

fn classify_error(err: &zbus::Error, unit: &str) -> ManagerError {
    match err {
        zbus::Error::MethodError(name, detail, _) => {
            classify_name(name.as_str(), detail.clone().unwrap_or_default(), unit)
        }
        zbus::Error::FDO(fdo) => match fdo.as_ref() {
            zbus::fdo::Error::AccessDenied(msg) | zbus::fdo::Error::InteractiveAuthorizationRequired(msg) => {
                ManagerError::PermissionDenied(msg.clone())
            }
            zbus::fdo::Error::NoReply(_) | zbus::fdo::Error::Timeout(_) => ManagerError::Timeout,
            other => ManagerError::Unavailable(other.to_string()),
        },
        other => ManagerError::Unavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_names() {
        assert_eq!(
            classify_name("org.freedesktop.systemd1.NoSuchUnit", String::new(), "x.service"),
            ManagerError::UnitUnknown("x.service".into())
        );
        assert_eq!(
            classify_name("org.freedesktop.DBus.Error.AccessDenied", "polkit".into(), "x.service"),
            ManagerError::PermissionDenied("polkit".into())
        );
        assert_eq!(
            classify_name("org.freedesktop.systemd1.UnitMasked", "masked".into(), "x.service"),
            ManagerError::InvalidTransition("masked".into())
        );
        assert_eq!(
            classify_name("org.freedesktop.DBus.Error.NoReply", String::new(), "x.service"),
            ManagerError::Timeout
        );
        assert!(matches!(
            classify_name("org.example.Weird", "?".into(), "x.service"),
            ManagerError::Unavailable(_)
        ));
    }

    #[test]
    fn test_classify_fdo_errors() {
        let err = zbus::Error::FDO(Box::new(zbus::fdo::Error::AccessDenied("no".into())));
        assert_eq!(classify_error(&err, "x.service"), ManagerError::PermissionDenied("no".into()));

        let err = zbus::Error::FDO(Box::new(zbus::fdo::Error::NoReply("slow".into())));
        assert_eq!(classify_error(&err, "x.service"), ManagerError::Timeout);
    }

    #[test]
    fn test_io_error_is_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err = zbus::Error::InputOutput(Arc::new(io));
        assert!(is_transport_error(&err));
        assert!(matches!(classify_error(&err, "x.service"), ManagerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_job_result_after_registration() {
        let jobs = JobTable::default();
        jobs.issued("/job/1");
        let JobWait::Pending(rx) = jobs.wait("/job/1").unwrap() else {
            panic!("expected pending wait");
        };
        jobs.complete("/job/1", "done");
        assert_eq!(rx.await.unwrap(), "done");
    }

    #[test]
    fn test_job_result_before_registration() {
        let jobs = JobTable::default();
        jobs.complete("/job/2", "failed");
        jobs.issued("/job/2");
        match jobs.wait("/job/2").unwrap() {
            JobWait::Ready(result) => assert_eq!(result, "failed"),
            JobWait::Pending(_) => panic!("result should be ready"),
        }
    }

    #[test]
    fn test_unknown_job() {
        let jobs = JobTable::default();
        assert!(matches!(jobs.wait("/job/9"), Err(ManagerError::Unavailable(_))));
    }

    #[test]
    fn test_early_cache_is_bounded() {
        let jobs = JobTable::default();
        for i in 0..(EARLY_RESULTS + 10) {
            jobs.complete(&format!("/job/{}", i), "done");
        }
        assert_eq!(jobs.lock().early.len(), EARLY_RESULTS);
        assert!(jobs.wait("/job/0").is_err());
    }

    #[tokio::test]
    async fn test_abandon_closes_waiters() {
        let jobs = JobTable::default();
        jobs.issued("/job/3");
        let JobWait::Pending(rx) = jobs.wait("/job/3").unwrap() else {
            panic!("expected pending wait");
        };
        jobs.abandon_all();
        assert!(rx.await.is_err());
    }
}
