//! Close codes and connection deny reasons

use std::fmt;

use axum::http::StatusCode;

/// Header telling a rejected runner why it was turned away
pub const DENY_REASON_HEADER: &str = "Runner-Deny-Reason";

/// WebSocket close codes used towards runners.
///
/// Normal closure (1000) is answered by the WebSocket layer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    InternalError,
    /// The runner sent a well-formed message it was not allowed to send
    IllegalBehaviour,
    /// The runner sent a message that could not be parsed or validated
    IllegalPacket,
    /// The runner sent a binary frame
    IllegalBinaryPacket,
    PingTimeout,
    /// The runner did not answer a command in time
    CommandTimeout,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::InternalError => 4000,
            Self::IllegalBehaviour => 4001,
            Self::IllegalPacket => 4002,
            Self::IllegalBinaryPacket => 4003,
            Self::PingTimeout => 4004,
            Self::CommandTimeout => 4005,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::InternalError => "internal error",
            Self::IllegalBehaviour => "illegal behaviour",
            Self::IllegalPacket => "illegal packet",
            Self::IllegalBinaryPacket => "illegal binary packet",
            Self::PingTimeout => "ping timeout",
            Self::CommandTimeout => "command timeout",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_u16(), self.reason())
    }
}

/// Why a connection attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    TokenInvalid,
    NameAlreadyUsed,
}

impl DenyReason {
    pub fn header_value(self) -> &'static str {
        match self {
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::NameAlreadyUsed => "NAME_ALREADY_USED",
        }
    }

    pub fn status_code(self) -> StatusCode {
        match self {
            Self::TokenInvalid => StatusCode::UNAUTHORIZED,
            Self::NameAlreadyUsed => StatusCode::FORBIDDEN,
        }
    }
}
