//! D-Bus proxies for the systemd manager
//!
//! Client side of the org.freedesktop.systemd1 interfaces:
//! - Manager: StartUnit, StopUnit, RestartUnit, ReloadUnit,
//!   EnableUnitFiles, DisableUnitFiles, Reload, Subscribe, JobRemoved
//! - Unit properties: LoadState, ActiveState, SubState, StateChangeTimestamp

mod manager;
mod unit;

pub use manager::SystemdManagerProxy;
pub use unit::{observed_from_properties, UnitPropertiesProxy, UNIT_INTERFACE};

/// Convert a unit name to its D-Bus object path
/// e.g., "docker.service" -> "/org/freedesktop/systemd1/unit/docker_2eservice"
///
/// Every byte that is not an ASCII letter or digit is escaped as `_xx`,
/// as is a leading digit.
pub fn unit_object_path(unit_id: &str) -> String {
    let mut escaped = String::with_capacity(unit_id.len() * 3);
    for (i, b) in unit_id.bytes().enumerate() {
        if b.is_ascii_alphabetic() || (b.is_ascii_digit() && i > 0) {
            escaped.push(b as char);
        } else {
            escaped.push_str(&format!("_{:02x}", b));
        }
    }

    format!("/org/freedesktop/systemd1/unit/{}", escaped)
}
