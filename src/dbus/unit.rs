//! Unit property access
//!
//! Properties are read with a single Properties.GetAll on the unit's
//! object path. systemd loads the unit on demand when the path is touched,
//! so this works for units that are not currently loaded.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use zbus::proxy;
use zbus::zvariant::{OwnedValue, Value};

use crate::state::{ActiveState, LoadState, ObservedState};

pub const UNIT_INTERFACE: &str = "org.freedesktop.systemd1.Unit";

#[proxy(
    interface = "org.freedesktop.DBus.Properties",
    default_service = "org.freedesktop.systemd1",
    gen_blocking = false
)]
pub trait UnitProperties {
    fn get_all(&self, interface_name: &str) -> zbus::Result<HashMap<String, OwnedValue>>;
}

fn string_prop<'a>(props: &'a HashMap<String, OwnedValue>, key: &str) -> Option<&'a str> {
    match props.get(key).map(|v| &**v) {
        Some(Value::Str(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn u64_prop(props: &HashMap<String, OwnedValue>, key: &str) -> Option<u64> {
    match props.get(key).map(|v| &**v) {
        Some(Value::U64(n)) => Some(*n),
        _ => None,
    }
}

/// Build an observed state from the Unit interface properties.
/// Missing or unparseable properties are reported as an error string.
pub fn observed_from_properties(
    unit: &str,
    props: &HashMap<String, OwnedValue>,
) -> Result<ObservedState, String> {
    let load = LoadState::parse(string_prop(props, "LoadState").unwrap_or("error"));

    let active_raw = string_prop(props, "ActiveState").ok_or("missing ActiveState property")?;
    let active = ActiveState::parse(active_raw)
        .ok_or_else(|| format!("unknown ActiveState {:?}", active_raw))?;

    let sub = string_prop(props, "SubState").unwrap_or("unknown").to_string();

    // StateChangeTimestamp is CLOCK_REALTIME in microseconds, 0 if never changed
    let since = u64_prop(props, "StateChangeTimestamp")
        .filter(|us| *us > 0)
        .and_then(|us| i64::try_from(us).ok())
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .unwrap_or_else(Utc::now);

    Ok(ObservedState {
        unit: unit.to_string(),
        load,
        active,
        sub,
        since,
        error: None,
    })
}
