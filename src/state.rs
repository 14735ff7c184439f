use std::fmt;

/// Lifecycle of the single physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No socket and no reconnect loop running
    #[default]
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Socket open, frames flow directly
    Connected,
    /// Socket lost unexpectedly, a reconnect is scheduled or in flight
    Recovering,
}

/// Events that drive the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    /// `connect()` was called (explicitly, lazily or by the reconnect timer)
    Connect,
    /// Transport reported the socket as open
    Opened,
    /// Transport closed or errored
    Lost,
    /// `disconnect()` was called
    Disconnect,
}

impl ConnectionState {
    /// Apply a transition. Pairs that have no effect return the current state.
    pub(crate) fn next(self, transition: Transition) -> ConnectionState {
        use ConnectionState::*;
        use Transition::*;

        match (self, transition) {
            (Disconnected, Connect) | (Recovering, Connect) => Connecting,
            (Connecting, Connect) | (Connected, Connect) => self,

            (Connecting, Opened) => Connected,
            (Disconnected, Opened) | (Connected, Opened) | (Recovering, Opened) => self,

            (Connecting, Lost) | (Connected, Lost) | (Recovering, Lost) => Recovering,
            (Disconnected, Lost) => Disconnected,

            (_, Disconnect) => Disconnected,
        }
    }

    /// Whether frames can be written straight to the socket
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Recovering => "recovering",
        };
        f.write_str(name)
    }
}
