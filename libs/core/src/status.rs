use std::fmt;

use serde::{Deserialize, Serialize};

/// Status values reported by a transport on its status stream (`0..=5`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionStatus {
    Uninitialized = 0,
    Connecting = 1,
    Online = 2,
    ExpiredToken = 3,
    FailedToConnect = 4,
    Ended = 5,
}

impl TryFrom<u8> for ConnectionStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectionStatus::Uninitialized),
            1 => Ok(ConnectionStatus::Connecting),
            2 => Ok(ConnectionStatus::Online),
            3 => Ok(ConnectionStatus::ExpiredToken),
            4 => Ok(ConnectionStatus::FailedToConnect),
            5 => Ok(ConnectionStatus::Ended),
            other => Err(other),
        }
    }
}

/// Lifecycle status of the session owned by the connection controller.
///
/// Mirrors [`ConnectionStatus`] and adds the terminal `Disconnected` state which
/// only the controller itself can enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Uninitialized,
    Connecting,
    Online,
    ExpiredToken,
    FailedToConnect,
    Ended,
    Disconnected,
}

impl SessionStatus {
    /// Numeric code carried on `connectionStatus` events. `Disconnected` has no
    /// transport equivalent and uses 6.
    pub fn code(&self) -> u8 {
        match self {
            SessionStatus::Uninitialized => 0,
            SessionStatus::Connecting => 1,
            SessionStatus::Online => 2,
            SessionStatus::ExpiredToken => 3,
            SessionStatus::FailedToConnect => 4,
            SessionStatus::Ended => 5,
            SessionStatus::Disconnected => 6,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            SessionStatus::Uninitialized => "not connected",
            SessionStatus::Connecting => "connecting to agent",
            SessionStatus::Online => "connected",
            SessionStatus::ExpiredToken => "session token expired",
            SessionStatus::FailedToConnect => "failed to connect",
            SessionStatus::Ended => "conversation ended",
            SessionStatus::Disconnected => "disconnected",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uninitialized => "uninitialized",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Online => "online",
            SessionStatus::ExpiredToken => "expired_token",
            SessionStatus::FailedToConnect => "failed_to_connect",
            SessionStatus::Ended => "ended",
            SessionStatus::Disconnected => "disconnected",
        }
    }
}

impl From<ConnectionStatus> for SessionStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Uninitialized => SessionStatus::Uninitialized,
            ConnectionStatus::Connecting => SessionStatus::Connecting,
            ConnectionStatus::Online => SessionStatus::Online,
            ConnectionStatus::ExpiredToken => SessionStatus::ExpiredToken,
            ConnectionStatus::FailedToConnect => SessionStatus::FailedToConnect,
            ConnectionStatus::Ended => SessionStatus::Ended,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_codes_map_in_order() {
        let statuses: Vec<_> = (0u8..=5)
            .map(|code| ConnectionStatus::try_from(code).unwrap())
            .collect();
        assert_eq!(
            statuses,
            vec![
                ConnectionStatus::Uninitialized,
                ConnectionStatus::Connecting,
                ConnectionStatus::Online,
                ConnectionStatus::ExpiredToken,
                ConnectionStatus::FailedToConnect,
                ConnectionStatus::Ended,
            ]
        );
        assert_eq!(ConnectionStatus::try_from(9), Err(9));
    }

    #[test]
    fn session_codes_follow_transport_codes() {
        for code in 0u8..=5 {
            let status = SessionStatus::from(ConnectionStatus::try_from(code).unwrap());
            assert_eq!(status.code(), code);
        }
        assert_eq!(SessionStatus::Disconnected.code(), 6);
    }
}
