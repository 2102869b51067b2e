//! In-memory registries owned by a [`Gateway`](crate::gateway::commands::Gateway).
//!
//! Both are explicit objects passed to their collaborators rather than
//! process-wide statics, so tests can run isolated instances side by side.

mod registry;
mod terminals;

pub use registry::ConnectionRegistry;
pub use terminals::{DashMapTerminalStorage, TerminalStorage};
