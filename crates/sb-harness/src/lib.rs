//! Provider call plumbing: the client capability, per-provider request
//! budgets, and the security primitives guarding the command surface.

pub mod provider;
pub mod rate_limiter;
pub mod security;
