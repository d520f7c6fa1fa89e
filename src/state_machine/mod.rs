mod job;
mod stage;

pub use job::{AuditEntry, JobError, JobRecord, WorkDescriptor};
pub use stage::Stage;
