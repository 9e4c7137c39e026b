//! Unit naming and configuration file parsing
//!
//! Unit types the supervisor knows about, name normalization, and the
//! INI dialect shared with systemd unit files.

mod parser;

pub use parser::{parse_config_file, parse_file, section_values, ParseError, ParsedFile, ParsedSection};

use std::fmt;
use std::time::Duration;

/// Kind of unit, derived from the name suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum UnitType {
    #[default]
    Service,
    Socket,
    Timer,
    Device,
}

impl UnitType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "service" => Some(Self::Service),
            "socket" => Some(Self::Socket),
            "timer" => Some(Self::Timer),
            "device" => Some(Self::Device),
            _ => None,
        }
    }

    /// Detect the type from a unit name suffix ("docker.socket" -> Socket)
    pub fn from_unit_name(name: &str) -> Option<Self> {
        let (_, suffix) = name.rsplit_once('.')?;
        Self::parse(suffix)
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Service => ".service",
            Self::Socket => ".socket",
            Self::Timer => ".timer",
            Self::Device => ".device",
        }
    }

    pub fn as_str(&self) -> &'static str {
        &self.suffix()[1..]
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append the type suffix to a bare name ("nginx" -> "nginx.service").
/// Names that already carry a known suffix are returned unchanged.
pub fn normalize_name(name: &str, default_type: UnitType) -> String {
    let name = name.trim();
    if UnitType::from_unit_name(name).is_some() {
        name.to_string()
    } else {
        format!("{}{}", name, default_type.suffix())
    }
}

/// Unit types systemd has that the supervisor does not manage
const UNSUPPORTED_SUFFIXES: &[&str] = &["target", "mount", "automount", "path", "slice", "scope", "swap"];

/// True for names like "multi-user.target" that are out of scope
pub fn has_unsupported_suffix(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, suffix)| UNSUPPORTED_SUFFIXES.contains(&suffix))
}

/// Check that a unit name is something we are willing to hand to the manager
pub fn is_valid_unit_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.' | '\\' | '@'))
}

/// Parse a duration setting ("500ms", "10s", "5min", "1h", bare seconds)
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();

    if let Some(n) = s.strip_suffix("ms") {
        n.trim().parse().ok().map(Duration::from_millis)
    } else if let Some(n) = s.strip_suffix("min") {
        n.trim().parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else if let Some(n) = s.strip_suffix('s') {
        n.trim().parse().ok().map(Duration::from_secs)
    } else if let Some(n) = s.strip_suffix('h') {
        n.trim().parse::<u64>().ok()?.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse().ok().map(Duration::from_secs)
    }
}
