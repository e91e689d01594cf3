pub mod kv;
pub mod mapper;

pub use kv::{KvStore, SledStore};
pub use mapper::{MapperEntry, UsernameMapper};
