use super::types::LogIndex;
use crate::util::errors::Result;

/// The application state driven by the replicated log.
///
/// `apply` is called exactly once per committed data entry, in index order.
/// After a crash the log is replayed from the last snapshot, so commands may
/// be seen again by a fresh instance restored from that snapshot.
pub trait StateMachine: Send {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Vec<u8>>;

    /// Serialize the full current state
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the current state with a snapshot image. Must leave the
    /// previous state untouched when it fails.
    fn restore(&mut self, image: &[u8]) -> Result<()>;
}
