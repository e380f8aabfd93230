//! Error types for the match engine.

use thiserror::Error;

use crate::directory::DirectoryError;
use crate::queue::QueueError;
use crate::season::SeasonError;
use crate::session::SessionError;
use crate::settlement::SettleError;

pub type Result<T> = std::result::Result<T, ArenaError>;

#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("session: {0}")]
    Session(#[from] SessionError),

    #[error("settlement: {0}")]
    Settle(#[from] SettleError),

    #[error("season: {0}")]
    Season(#[from] SeasonError),

    #[error("directory: {0}")]
    Directory(#[from] DirectoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ArenaError {
    /// Errors a client can trigger by reporting against a room that does
    /// not exist (any more). Callers answer these without logging at error.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Settle(SettleError::RoomNotFound(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_not_found_is_benign() {
        let err: ArenaError = SettleError::RoomNotFound("r1".into()).into();
        assert!(err.is_benign());
        assert_eq!(err.to_string(), "settlement: room not found: r1");

        let err: ArenaError = DirectoryError::Backend("down".into()).into();
        assert!(!err.is_benign());
    }
}
