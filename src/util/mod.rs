pub mod errors;

pub use errors::{RaftError, Result};
