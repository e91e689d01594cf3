pub mod cache;
pub mod config;
pub mod error;
pub mod session;

pub use cache::TimedCache;
pub use config::UiaConfig;
pub use error::UiaError;
pub use session::{Endpoint, Session, SessionData, SessionStore};
