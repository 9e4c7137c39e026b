//! Observed and desired unit state
//!
//! ```text
//!   desired ──┐
//!             ├── reconcile ──► action ──► manager job ──► observed'
//!   observed ─┘
//! ```

use std::fmt;

use chrono::{DateTime, Utc};

/// High-level unit state (systemd's ActiveState)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActiveState {
    Inactive,
    Activating,
    Active,
    Deactivating,
    Failed,
}

impl ActiveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Failed => "failed",
        }
    }

    /// Parse the manager's ActiveState property.
    /// "reloading" and "refreshing" count as active, "maintenance" as deactivating.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(Self::Inactive),
            "activating" => Some(Self::Activating),
            "active" | "reloading" | "refreshing" => Some(Self::Active),
            "deactivating" | "maintenance" => Some(Self::Deactivating),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Activating | Self::Deactivating)
    }
}

impl fmt::Display for ActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the manager could load the unit definition (systemd's LoadState)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Loaded,
    NotFound,
    BadSetting,
    Error,
    Masked,
    Other(String),
}

impl LoadState {
    pub fn parse(s: &str) -> Self {
        match s {
            "loaded" => Self::Loaded,
            "not-found" => Self::NotFound,
            "bad-setting" => Self::BadSetting,
            "error" => Self::Error,
            "masked" => Self::Masked,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Loaded => "loaded",
            Self::NotFound => "not-found",
            Self::BadSetting => "bad-setting",
            Self::Error => "error",
            Self::Masked => "masked",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time snapshot of one unit as reported by the manager
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedState {
    pub unit: String,
    pub load: LoadState,
    pub active: ActiveState,
    /// Type-specific state ("running", "dead", "listening", ...)
    pub sub: String,
    /// When the unit last changed state
    pub since: DateTime<Utc>,
    /// Failure reported alongside this snapshot (e.g. a job result)
    pub error: Option<String>,
}

impl ObservedState {
    pub fn new(unit: impl Into<String>, active: ActiveState, sub: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            load: LoadState::Loaded,
            active,
            sub: sub.into(),
            since: Utc::now(),
            error: None,
        }
    }

    /// What a unit the manager has never heard of looks like
    pub fn not_found(unit: impl Into<String>) -> Self {
        Self {
            load: LoadState::NotFound,
            ..Self::new(unit, ActiveState::Inactive, "dead")
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Replace `prev` with this snapshot, keeping timestamps non-decreasing
    pub fn supersede(mut self, prev: Option<&ObservedState>) -> Self {
        if let Some(prev) = prev {
            if self.since < prev.since {
                self.since = prev.since;
            }
        }
        self
    }
}

/// An operation the manager can perform on a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Start,
    Stop,
    Restart,
    Reload,
    Enable,
    Disable,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reload => "reload",
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }

    /// Enable/disable touch unit files only and never create a job
    pub fn creates_job(&self) -> bool {
        !matches!(self, Self::Enable | Self::Disable)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The active state an operator wants a unit in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetState {
    Active,
    Inactive,
}

impl TargetState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "active" | "running" | "started" => Some(Self::Active),
            "inactive" | "stopped" | "dead" => Some(Self::Inactive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the operator wants the target state reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ActionHint {
    #[default]
    None,
    Start,
    Stop,
    Restart,
    Reload,
    Enable,
    Disable,
}

impl ActionHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reload => "reload",
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }
}

/// Target state plus an action hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DesiredState {
    pub target: TargetState,
    pub hint: ActionHint,
}

impl DesiredState {
    pub fn new(target: TargetState, hint: ActionHint) -> Self {
        Self { target, hint }
    }

    pub fn active() -> Self {
        Self::new(TargetState::Active, ActionHint::None)
    }

    pub fn inactive() -> Self {
        Self::new(TargetState::Inactive, ActionHint::None)
    }

    /// A stopped unit counts as inactive whether it exited cleanly or failed
    pub fn satisfied_by(&self, observed: &ObservedState) -> bool {
        match self.target {
            TargetState::Active => observed.active == ActiveState::Active,
            TargetState::Inactive => {
                matches!(observed.active, ActiveState::Inactive | ActiveState::Failed)
            }
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hint {
            ActionHint::None => write!(f, "{}", self.target),
            hint => write!(f, "{} (via {})", self.target, hint.as_str()),
        }
    }
}

/// Why a session stopped without converging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailReason {
    RetriesExhausted,
    WindowExceeded,
    PermissionDenied,
    InvalidTransition,
    Cancelled,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries exhausted",
            Self::WindowExceeded => "supervision window exceeded",
            Self::PermissionDenied => "permission denied",
            Self::InvalidTransition => "invalid transition",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Where a reconciliation session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// No action issued yet
    Pending,
    /// A manager job is outstanding
    InFlight,
    /// Last attempt failed, another is scheduled
    Retrying,
    Converged,
    Failed(FailReason),
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::Failed(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Retrying => "retrying",
            Self::Converged => "converged",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({})", reason.as_str()),
            other => f.write_str(other.as_str()),
        }
    }
}
