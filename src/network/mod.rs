pub mod codec;
pub mod memory;
pub mod tcp;
pub mod transport;

pub use codec::{WireRequest, WireResponse, MAX_MESSAGE_SIZE};
pub use memory::{LocalNetwork, LocalTransport};
pub use tcp::{send_request, serve, TcpTransport};
pub use transport::{Transport, TransportError};
