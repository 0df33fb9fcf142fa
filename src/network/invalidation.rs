/// Why, and how thoroughly, a processor has to run again.
///
/// Levels are totally ordered; raising a processor's level takes the maximum
/// of the current and the requested level, so invalidation never lowers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum InvalidationLevel {
    #[default]
    Valid,
    /// The output is stale; running `process` again is enough.
    InvalidResult,
    /// A parameter changed that `process` reads.
    InvalidParameters,
    /// Program text changed; programs are rebuilt before `process`.
    InvalidProgram,
    /// Connections changed; the rendering order is recomputed.
    InvalidPorts,
}

impl InvalidationLevel {
    /// Whether nothing needs to run.
    pub fn is_valid(self) -> bool {
        self == InvalidationLevel::Valid
    }

    /// Whether `rebuild_programs` runs before the next `process`.
    pub fn needs_program_rebuild(self) -> bool {
        self >= InvalidationLevel::InvalidProgram
    }

    pub(crate) const ALL: [InvalidationLevel; 5] = [
        InvalidationLevel::Valid,
        InvalidationLevel::InvalidResult,
        InvalidationLevel::InvalidParameters,
        InvalidationLevel::InvalidProgram,
        InvalidationLevel::InvalidPorts,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        for pair in InvalidationLevel::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(InvalidationLevel::default(), InvalidationLevel::Valid);
        assert!(InvalidationLevel::InvalidPorts.needs_program_rebuild());
        assert!(!InvalidationLevel::InvalidParameters.needs_program_rebuild());
    }
}
