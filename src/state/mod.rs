//! Observability persistence: event journal and intent outcomes

pub mod store;

pub use store::{spawn_journal, OutcomeStats, StateStore};
