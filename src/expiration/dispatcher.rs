//! Primary-owner routing for expiration commands.
//!
//! Timers live on the session's primary owner. When a request on another
//! node touches a session, the resulting schedule or cancel is shipped to
//! the owner as a command; the transport behind [`CommandDispatcher`] is the
//! grid's concern.

use crate::error::Result;
use crate::expiration::scheduler::ExpirationScheduler;
use crate::grid::SessionGrid;
use crate::session::store::{epoch_ms, from_epoch_ms, ExpirationMetadata};
use crate::types::{NodeId, SessionId, SessionKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Expiration command addressed to a session's primary owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleCommand {
    Schedule {
        id: SessionId,
        last_accessed_ms: u64,
        max_inactive_ms: Option<u64>,
    },
    Cancel {
        id: SessionId,
    },
}

impl ScheduleCommand {
    pub fn schedule(id: SessionId, metadata: ExpirationMetadata) -> Self {
        ScheduleCommand::Schedule {
            id,
            last_accessed_ms: epoch_ms(metadata.last_accessed),
            max_inactive_ms: metadata.max_inactive.map(|d| d.as_millis() as u64),
        }
    }

    pub fn cancel(id: SessionId) -> Self {
        ScheduleCommand::Cancel { id }
    }

    pub fn id(&self) -> &SessionId {
        match self {
            ScheduleCommand::Schedule { id, .. } | ScheduleCommand::Cancel { id } => id,
        }
    }
}

/// Ships a command to another cluster member.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(&self, target: NodeId, command: ScheduleCommand) -> Result<()>;
}

/// Expiration scheduling that always lands on the primary owner: applied
/// locally when this node owns the session, dispatched otherwise.
pub struct PrimaryOwnerScheduler {
    grid: Arc<dyn SessionGrid>,
    scheduler: ExpirationScheduler,
    dispatcher: Arc<dyn CommandDispatcher>,
}

impl PrimaryOwnerScheduler {
    pub fn new(
        grid: Arc<dyn SessionGrid>,
        scheduler: ExpirationScheduler,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Self {
        Self {
            grid,
            scheduler,
            dispatcher,
        }
    }

    pub async fn schedule(&self, id: SessionId, metadata: ExpirationMetadata) -> Result<()> {
        self.route(ScheduleCommand::schedule(id, metadata)).await
    }

    pub async fn cancel(&self, id: SessionId) -> Result<()> {
        self.route(ScheduleCommand::cancel(id)).await
    }

    /// Apply a command on the receiving side.
    pub fn handle(&self, command: ScheduleCommand) {
        match command {
            ScheduleCommand::Schedule {
                id,
                last_accessed_ms,
                max_inactive_ms,
            } => self.scheduler.schedule(
                id,
                ExpirationMetadata {
                    last_accessed: from_epoch_ms(last_accessed_ms),
                    max_inactive: max_inactive_ms.map(Duration::from_millis),
                },
            ),
            ScheduleCommand::Cancel { id } => self.scheduler.cancel_session(&id),
        }
    }

    pub fn scheduler(&self) -> &ExpirationScheduler {
        &self.scheduler
    }

    async fn route(&self, command: ScheduleCommand) -> Result<()> {
        let key = SessionKey::new(command.id().clone());
        let owner = self
            .grid
            .distribution()
            .and_then(|hash| hash.primary_owner(&key));
        match owner {
            Some(owner) if owner != self.grid.local_node() => {
                trace!(session = %command.id(), owner, "dispatching expiration command");
                self.dispatcher.dispatch(owner, command).await
            }
            _ => {
                self.handle(command);
                Ok(())
            }
        }
    }
}
