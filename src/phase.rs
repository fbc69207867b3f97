//! Migration phases, in execution order.

use std::fmt;

/// Ordered migration phases. The discriminant is the CLI step number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MigrationPhase {
    Preflight = 0,
    Prepare = 1,
    Roll = 2,
    PriorityFlip = 3,
    Migrate = 4,
    Cleanup = 5,
}

impl MigrationPhase {
    /// All phases in the order they must complete.
    pub const ALL: [MigrationPhase; 6] = [
        MigrationPhase::Preflight,
        MigrationPhase::Prepare,
        MigrationPhase::Roll,
        MigrationPhase::PriorityFlip,
        MigrationPhase::Migrate,
        MigrationPhase::Cleanup,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            MigrationPhase::Preflight => "preflight",
            MigrationPhase::Prepare => "prepare",
            MigrationPhase::Roll => "roll",
            MigrationPhase::PriorityFlip => "priority",
            MigrationPhase::Migrate => "migrate",
            MigrationPhase::Cleanup => "cleanup",
        }
    }

    /// Log tag in "N-name" form, e.g. `2-roll`.
    pub fn tag(self) -> String {
        format!("{}-{}", self.index(), self.name())
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
