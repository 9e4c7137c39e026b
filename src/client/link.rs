//! Reconnecting connection holder
//!
//! Holds exactly one live connection. When it is lost, a background task
//! reconnects with jittered exponential backoff; calls made in the gap
//! fail at once with [`ManagerError::Unavailable`] instead of queueing.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backoff::Backoff;

use super::ManagerError;

/// Opens connections to the manager
pub trait Connector: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Conn, ManagerError>> + Send;

    /// Whether a connection is still usable (e.g. its signal stream is open)
    fn is_alive(&self, _conn: &Self::Conn) -> bool {
        true
    }
}

enum LinkState<T> {
    Up { conn: T, generation: u64 },
    Reconnecting { generation: u64 },
}

struct Shared<C: Connector> {
    connector: C,
    backoff: Backoff,
    state: Mutex<LinkState<C::Conn>>,
}

impl<C: Connector> Shared<C> {
    fn state(&self) -> MutexGuard<'_, LinkState<C::Conn>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Link<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for Link<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> Link<C> {
    /// Connect once; fails if the manager cannot be reached right now
    pub async fn connect(connector: C, backoff: Backoff) -> Result<Self, ManagerError> {
        let conn = connector.connect().await?;
        Ok(Self {
            shared: Arc::new(Shared {
                connector,
                backoff,
                state: Mutex::new(LinkState::Up { conn, generation: 1 }),
            }),
        })
    }

    /// Start disconnected and reconnect in the background
    pub fn lazy(connector: C, backoff: Backoff) -> Self {
        let link = Self {
            shared: Arc::new(Shared {
                connector,
                backoff,
                state: Mutex::new(LinkState::Reconnecting { generation: 0 }),
            }),
        };
        link.spawn_reconnect(0);
        link
    }

    /// Current connection and its generation, or `Unavailable` while reconnecting
    pub fn get(&self) -> Result<(C::Conn, u64), ManagerError> {
        let (conn, generation) = match &*self.shared.state() {
            LinkState::Up { conn, generation } => (conn.clone(), *generation),
            LinkState::Reconnecting { .. } => {
                return Err(ManagerError::Unavailable("reconnecting to service manager".into()))
            }
        };

        if self.shared.connector.is_alive(&conn) {
            Ok((conn, generation))
        } else {
            self.mark_lost(generation);
            Err(ManagerError::Unavailable("connection to service manager lost".into()))
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.shared.state(), LinkState::Up { .. })
    }

    /// Report that the connection of `generation` failed.
    /// Stale reports (an older generation, or already reconnecting) are ignored.
    pub fn mark_lost(&self, generation: u64) {
        {
            let mut state = self.shared.state();
            match &*state {
                LinkState::Up { generation: current, .. } if *current == generation => {
                    log::warn!("Lost connection to service manager, reconnecting");
                    *state = LinkState::Reconnecting { generation };
                }
                _ => return,
            }
        }
        self.spawn_reconnect(generation);
    }

    fn spawn_reconnect(&self, generation: u64) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                let delay = shared.backoff.delay(attempt);
                tokio::time::sleep(delay).await;

                match shared.connector.connect().await {
                    Ok(conn) => {
                        let next = generation + 1;
                        *shared.state() = LinkState::Up { conn, generation: next };
                        log::info!(
                            "Reconnected to service manager after {} attempt(s)",
                            attempt + 1
                        );
                        break;
                    }
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        log::debug!(
                            "Service manager not reachable (attempt {}): {}",
                            attempt,
                            e
                        );
                    }
                }
            }
        });
    }
}
