//! Resilient batch pipeline that turns video transcripts into notes.
//!
//! Jobs flow through a bounded [`worker_pool::WorkerPool`]. Each attempt
//! leases one egress identity from the [`resources::ResourcePool`], runs the
//! fetch, generate, persist and export stages, gives the identity back and
//! leaves one entry in the [`audit::AuditLog`]. The
//! [`retry::RetryCoordinator`] resubmits retryable failures once the
//! identities they need have cooled down.

pub mod adapters;
pub mod audit;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod persist;
pub mod pipeline;
pub mod resources;
pub mod retry;
pub mod state_machine;
pub mod ui;
pub mod worker_pool;
