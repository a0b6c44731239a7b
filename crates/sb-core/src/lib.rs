//! Core data model, settings, configuration and the persistence seam shared
//! by every switchboard crate.

pub mod config;
pub mod settings;
pub mod sqlite;
pub mod store;
pub mod types;
