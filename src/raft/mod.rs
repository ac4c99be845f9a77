pub mod actor;
pub mod election;
pub mod handle;
pub mod log;
pub mod log_store;
pub mod replicator;
pub mod rpc;
pub mod snapshot;
pub mod state;
pub mod state_machine;
pub mod timer;
pub mod types;

pub use actor::{Applied, RaftNode, RaftNodeBuilder, RaftStateInfo};
pub use handle::RaftHandle;
pub use state::NodeState;
pub use state_machine::StateMachine;
pub use timer::{Clock, ManualClock, RandomSource, SeededRandom, SystemClock, ThreadRandom};
pub use types::{Command, LogEntry, LogIndex, NodeId, PeerInfo, Term};
