//! Server events: per-connection out-of-band work injected between
//! commands.
//!
//! The FIFO is drained at the top of `ParseCmd`, before the next command is
//! read; an event may change the connection's state (e.g. force a
//! disconnect) and execution follows the new state immediately.

use super::connection::Connection;
use super::state_machine::ConnState;

/// One out-of-band action against a connection.
pub trait ServerEvent: Send {
    /// Human-readable name for logging.
    fn description(&self) -> &'static str;

    /// Execute against the connection. Return `false` to stay at the front
    /// of the queue and run again on the next pass.
    fn execute(&mut self, conn: &mut Connection) -> bool;
}

/// Tears the connection down through the closing chain.
#[derive(Debug, Default)]
pub struct ForceDisconnectEvent;

impl ServerEvent for ForceDisconnectEvent {
    fn description(&self) -> &'static str {
        "force disconnect"
    }

    fn execute(&mut self, conn: &mut Connection) -> bool {
        conn.set_state(ConnState::Closing);
        true
    }
}

/// Marks the connection's cluster map revision stale so the next response
/// carries a config notification. Carried as a representative payload
/// event; the revision is recorded on the connection.
#[derive(Debug)]
pub struct ClusterMapBumpEvent {
    pub revision: i64,
}

impl ServerEvent for ClusterMapBumpEvent {
    fn description(&self) -> &'static str {
        "cluster map bump"
    }

    fn execute(&mut self, conn: &mut Connection) -> bool {
        conn.set_clustermap_revno(self.revision);
        true
    }
}
