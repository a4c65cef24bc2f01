//! Health, readiness and metrics HTTP endpoint

mod dto;
mod handlers;
mod server;

pub use server::{run_server, ServerState, DEFAULT_PORT};
