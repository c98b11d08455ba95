pub mod auth;
pub mod routes;
pub mod server;
pub mod ws;

pub use routes::{create_router, ApiState};
