//! org.freedesktop.systemd1.Manager proxy
//!
//! The subset of the manager interface needed to drive units:
//! - Job-creating calls (StartUnit, StopUnit, RestartUnit, ReloadUnit)
//! - Unit file calls (EnableUnitFiles, DisableUnitFiles) and Reload
//! - Subscribe + JobRemoved for job completion

use zbus::proxy;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1",
    gen_blocking = false
)]
pub trait SystemdManager {
    /// Start a unit by name. Returns the job object path.
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn restart_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn reload_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    /// Returns (carries_install_info, [(type, symlink, destination)])
    fn enable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
        force: bool,
    ) -> zbus::Result<(bool, Vec<(String, String, String)>)>;

    fn disable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
    ) -> zbus::Result<Vec<(String, String, String)>>;

    /// Reload daemon configuration (needed after unit file changes)
    fn reload(&self) -> zbus::Result<()>;

    /// Ask the manager to emit signals to this client
    fn subscribe(&self) -> zbus::Result<()>;

    /// Emitted when a job completes: result is "done", "canceled",
    /// "timeout", "failed", "dependency" or "skipped"
    #[zbus(signal)]
    fn job_removed(&self, id: u32, job: ObjectPath<'_>, unit: &str, result: &str) -> zbus::Result<()>;
}
