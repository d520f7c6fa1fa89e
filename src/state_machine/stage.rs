use std::fmt;

use serde::{Deserialize, Serialize};

/// Stages a job moves through, in pipeline order.
///
/// Each job flows through: Created → ResourceLeased → ContentFetched →
/// ContentGenerated → Persisted → Exported → Completed, or ends in `Failed`
/// from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Created,
    ResourceLeased,
    ContentFetched,
    ContentGenerated,
    Persisted,
    Exported,
    Completed,
    Failed,
}

impl Stage {
    /// Forward stages in execution order.
    pub const ORDER: [Stage; 7] = [
        Stage::Created,
        Stage::ResourceLeased,
        Stage::ContentFetched,
        Stage::ContentGenerated,
        Stage::Persisted,
        Stage::Exported,
        Stage::Completed,
    ];

    /// Position in the forward order; `None` for `Failed`.
    pub fn rank(self) -> Option<usize> {
        Self::ORDER.iter().position(|s| *s == self)
    }

    /// `Completed` and `Failed` end an attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// Whether a record in this stage must name its leased resource.
    pub fn holds_resource(self) -> bool {
        matches!(self.rank(), Some(rank) if rank >= 1)
    }

    /// Whether moving from `self` to `next` respects the forward-only rule.
    ///
    /// Any non-terminal stage may fail; otherwise the rank must strictly grow.
    pub fn can_advance_to(self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to > from,
            (None, Some(_)) => false,
        }
    }

    /// Name used for timings and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Created => "Created",
            Stage::ResourceLeased => "ResourceLeased",
            Stage::ContentFetched => "ContentFetched",
            Stage::ContentGenerated => "ContentGenerated",
            Stage::Persisted => "Persisted",
            Stage::Exported => "Exported",
            Stage::Completed => "Completed",
            Stage::Failed => "Failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        assert!(Stage::Created.can_advance_to(Stage::ResourceLeased));
        assert!(Stage::ResourceLeased.can_advance_to(Stage::ContentFetched));
        assert!(Stage::Created.can_advance_to(Stage::Persisted));
        assert!(!Stage::Persisted.can_advance_to(Stage::ContentFetched));
        assert!(!Stage::Exported.can_advance_to(Stage::Exported));
    }

    #[test]
    fn any_live_stage_can_fail() {
        for stage in &Stage::ORDER[..6] {
            assert!(stage.can_advance_to(Stage::Failed), "{stage} should be able to fail");
        }
    }

    #[test]
    fn terminal_stages_are_final() {
        assert!(!Stage::Completed.can_advance_to(Stage::Failed));
        assert!(!Stage::Failed.can_advance_to(Stage::Created));
        assert!(!Stage::Failed.can_advance_to(Stage::Completed));
    }

    #[test]
    fn resource_holding_stages() {
        assert!(!Stage::Created.holds_resource());
        assert!(Stage::ResourceLeased.holds_resource());
        assert!(Stage::Completed.holds_resource());
        assert!(!Stage::Failed.holds_resource());
    }

    #[test]
    fn stage_display() {
        assert_eq!(Stage::Created.to_string(), "Created");
        assert_eq!(Stage::ContentGenerated.to_string(), "ContentGenerated");
        assert_eq!(Stage::Failed.to_string(), "Failed");
    }
}
