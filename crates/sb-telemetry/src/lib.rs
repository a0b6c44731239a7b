//! Operator-facing observability: subscriber setup, trace ids and the
//! request-id middleware.

pub mod logging;
pub mod tracing_setup;
