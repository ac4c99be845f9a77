pub mod kv;

pub use kv::{decode_result, KvCommand, KvStore};
