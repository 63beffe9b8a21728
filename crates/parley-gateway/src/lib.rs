//! WebSocket chat hub and management API for conversation agents.

pub mod hub;
pub mod server;

pub use hub::{ChatHub, HubFactory};
pub use server::{run, AppState};
