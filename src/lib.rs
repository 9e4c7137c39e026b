//! sysward - systemd unit supervisor
//!
//! Keeps groups of systemd units in the state an operator asked for:
//! - Resolves logical target names from an INI configuration to concrete units
//! - Reconciles each unit towards its desired state through the systemd D-Bus API,
//!   with bounded, jittered retries
//! - Aggregates per-unit progress into snapshots and a live event feed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   Supervisor                     │
//! ├───────────────┬──────────────┬──────────────────┤
//! │   Resolver    │  Reconciler  │  Aggregator      │
//! ├───────────────┴──────────────┴──────────────────┤
//! │     Throttled<SystemdClient>  (D-Bus, zbus)      │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod aggregator;
pub mod backoff;
pub mod client;
pub mod config;
pub mod dbus;
pub mod reconciler;
pub mod resolver;
pub mod state;
pub mod supervisor;
pub mod units;

pub use aggregator::{AggregateReport, Outcome, StatusEvent, SubscribeError, Subscription, UnitReport};
pub use client::{ManagerError, ServiceManager};
pub use config::{Config, ConfigError, SupervisorSettings};
pub use resolver::{resolve, ResolveError, UnitSpec};
pub use state::{
    Action, ActionHint, ActiveState, DesiredState, FailReason, LoadState, ObservedState, SessionStatus,
    TargetState,
};
pub use supervisor::{SessionHandle, Supervisor, SupervisorError};
