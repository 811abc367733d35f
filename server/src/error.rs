//! Why a session was closed, and what the peer is told about it.

use crate::session::ClientStatus;
use shared::{ErrorCode, FrameError};

/// Every way a session can end.
///
/// Handlers return `Err(CloseReason)`; the server performs the close, so a
/// failing session never leaves shared state half-updated.
#[derive(Debug, thiserror::Error)]
pub enum CloseReason {
    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),

    #[error("unexpected {0:?} packet in this state")]
    ProtocolViolation(shared::PacketType),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("liveness check failed: {0}")]
    LivenessTimeout(&'static str),

    #[error("map transfer aborted")]
    TransferAborted,

    #[error("rejected: {}", .0.description())]
    Rejected(ErrorCode),

    #[error("extension content mismatch")]
    NewGrfMismatch,

    #[error("timed out in {0:?}")]
    Timeout(ClientStatus),

    #[error("client quit")]
    ClientQuit,

    #[error("client reported error: {}", .0.description())]
    ClientError(ErrorCode),

    #[error("connection lost")]
    ConnectionLost,

    #[error("kicked")]
    Kicked,

    #[error("banned")]
    Banned,

    #[error("snapshot failed: {0}")]
    SavegameFailed(String),

    #[error("server shutting down")]
    ServerShutdown,

    #[error("server starting a new game")]
    NewGame,
}

impl CloseReason {
    /// Code sent to the peer in `ERROR`, or `None` when the peer is already
    /// gone or has been told by other means.
    pub fn peer_code(&self) -> Option<ErrorCode> {
        match self {
            CloseReason::Malformed(_) => Some(ErrorCode::IllegalPacket),
            CloseReason::ProtocolViolation(_) => Some(ErrorCode::NotExpected),
            CloseReason::AuthRejected(_) => Some(ErrorCode::NotAuthorized),
            CloseReason::ResourceExhausted(_) => Some(ErrorCode::General),
            CloseReason::LivenessTimeout(_) => Some(ErrorCode::TimeoutComputer),
            CloseReason::Rejected(code) => Some(*code),
            CloseReason::Timeout(status) => Some(status.timeout_code()),
            CloseReason::Kicked => Some(ErrorCode::Kicked),
            CloseReason::Banned => Some(ErrorCode::NotAuthorized),
            CloseReason::SavegameFailed(_) => Some(ErrorCode::SavegameFailed),
            CloseReason::TransferAborted
            | CloseReason::NewGrfMismatch
            | CloseReason::ClientQuit
            | CloseReason::ClientError(_)
            | CloseReason::ConnectionLost
            | CloseReason::ServerShutdown
            | CloseReason::NewGame => None,
        }
    }

    /// Code announced to other clients in `ERROR_QUIT`. `None` means a plain
    /// `QUIT` is sent instead.
    pub fn broadcast_code(&self) -> Option<ErrorCode> {
        match self {
            CloseReason::ClientQuit | CloseReason::ServerShutdown | CloseReason::NewGame => None,
            CloseReason::ClientError(code) => Some(*code),
            CloseReason::NewGrfMismatch => Some(ErrorCode::NewGrfMismatch),
            CloseReason::ConnectionLost | CloseReason::TransferAborted => {
                Some(ErrorCode::ConnectionLost)
            }
            other => other.peer_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failures_share_one_peer_code() {
        assert_eq!(
            CloseReason::AuthRejected("bad password".into()).peer_code(),
            Some(ErrorCode::NotAuthorized)
        );
        assert_eq!(CloseReason::Banned.peer_code(), Some(ErrorCode::NotAuthorized));
    }

    #[test]
    fn test_liveness_is_not_a_protocol_error() {
        let liveness = CloseReason::LivenessTimeout("token");
        let protocol = CloseReason::ProtocolViolation(shared::PacketType::ClientAck);
        assert_ne!(liveness.peer_code(), protocol.peer_code());
        assert_eq!(liveness.peer_code(), Some(ErrorCode::TimeoutComputer));
    }

    #[test]
    fn test_timeout_code_follows_status() {
        assert_eq!(
            CloseReason::Timeout(ClientStatus::AuthGame).peer_code(),
            Some(ErrorCode::TimeoutPassword)
        );
        assert_eq!(
            CloseReason::Timeout(ClientStatus::Map).peer_code(),
            Some(ErrorCode::TimeoutMap)
        );
        assert_eq!(
            CloseReason::Timeout(ClientStatus::PreActive).peer_code(),
            Some(ErrorCode::TimeoutJoin)
        );
    }

    #[test]
    fn test_departures_are_not_answered() {
        assert_eq!(CloseReason::ClientQuit.peer_code(), None);
        assert_eq!(CloseReason::ConnectionLost.peer_code(), None);
        assert_eq!(
            CloseReason::ConnectionLost.broadcast_code(),
            Some(ErrorCode::ConnectionLost)
        );
        assert_eq!(CloseReason::ClientQuit.broadcast_code(), None);
    }
}
