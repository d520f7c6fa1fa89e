mod collaborators;
mod orchestrator;
pub mod stages;

pub use collaborators::{Collaborators, Exporter, Fetched, Fetcher, Generator, Services, Writer};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
