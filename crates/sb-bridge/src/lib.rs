//! Admin surface: the CSRF-gated command bus and its HTTP transport.

pub mod command_bus;
pub mod http_api;

pub use command_bus::{Action, CommandBus, CommandError, Envelope};
pub use http_api::{api_router, ApiState};
