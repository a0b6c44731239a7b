//! Task orchestration: provider selection, bounded fallback, usage
//! aggregation and health evaluation.

pub mod health;
pub mod orchestrator;
pub mod registry;
pub mod usage;

pub use orchestrator::{ErrorKind, TaskError, TaskOrchestrator};
pub use registry::ProviderRegistry;
pub use usage::UsageRecorder;
