//! The connection state machine's state vocabulary.
//!
//! Suspension is an explicit state-machine revisit, not a language
//! coroutine: every would-block point yields back to the worker reactor,
//! which re-enters the machine on the next readiness event or engine
//! completion.

use std::fmt;

/// States a connection moves through.
///
/// The happy path is `New → Read → ParseCmd → Execute → Write → ParseCmd`,
/// with `SslInit` ahead of `Read` on TLS listeners and `Nack` as the
/// protocol-error branch. Teardown runs `Closing → PendingClose |
/// ImmediateClose → Destroyed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    New,
    SslInit,
    Read,
    ParseCmd,
    Execute,
    Write,
    Nack,
    Closing,
    PendingClose,
    ImmediateClose,
    Destroyed,
}

impl ConnState {
    /// Whether a connection in this state is waiting for traffic and can
    /// be prodded by an external signal.
    #[must_use]
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            ConnState::Read | ConnState::ParseCmd | ConnState::Write
        )
    }

    /// Whether the connection has entered the teardown chain.
    #[must_use]
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            ConnState::Closing
                | ConnState::PendingClose
                | ConnState::ImmediateClose
                | ConnState::Destroyed
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::New => "new",
            ConnState::SslInit => "ssl_init",
            ConnState::Read => "read",
            ConnState::ParseCmd => "parse_cmd",
            ConnState::Execute => "execute",
            ConnState::Write => "write",
            ConnState::Nack => "nack",
            ConnState::Closing => "closing",
            ConnState::PendingClose => "pending_close",
            ConnState::ImmediateClose => "immediate_close",
            ConnState::Destroyed => "destroyed",
        };
        write!(f, "{s}")
    }
}

/// Outcome of executing one state handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateOutcome {
    /// Run the (possibly new) current state immediately.
    Continue,
    /// Suspend: return to the reactor and re-enter on the next readiness
    /// event or completion signal.
    Yield,
}
