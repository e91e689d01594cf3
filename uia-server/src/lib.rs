pub mod api;
pub mod homeserver;
pub mod middleware;
pub mod repair;
pub mod server;
pub mod token;

pub use server::{AppState, build_router, build_state, serve};
pub use token::TokenMinter;
