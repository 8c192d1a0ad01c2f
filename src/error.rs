use thiserror::Error;

/// Errors that abort an evaluation at the Rust level.
///
/// Ordinary Lisp mistakes (undefined symbols, applying a non-function,
/// type mismatches inside primitives) are *not* errors: they print a
/// diagnostic and evaluate to nil. What remains here is resource
/// exhaustion, broken heap invariants and configuration problems.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LispError {
    /// Every slot in the arena is live and nothing could be reclaimed.
    #[error("arena exhausted: {live} of {capacity} slots live")]
    ArenaExhausted { live: usize, capacity: usize },

    /// The explicit frame stack hit its bound.
    #[error("recursion depth exceeded ({0} frames)")]
    RecursionDepth(usize),

    /// The collector found a reference it cannot account for.
    #[error("heap corruption: {0}")]
    HeapCorruption(String),

    /// A record id whose slot has since been released or reused.
    #[error("stale reference to slot {index} (generation {generation})")]
    StaleReference { index: u32, generation: u32 },

    /// Argument count mismatch, only raised with `strict_arity`.
    #[error("{name}: expected {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    /// Invalid interpreter configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LispError {
    /// True when the heap can no longer be trusted or grown, so a hosted
    /// driver should stop instead of reading the next expression.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LispError::ArenaExhausted { .. }
                | LispError::HeapCorruption(_)
                | LispError::StaleReference { .. }
        )
    }
}

pub type LispResult<T> = Result<T, LispError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(LispError::ArenaExhausted { live: 4, capacity: 4 }.is_fatal());
        assert!(LispError::HeapCorruption("x".into()).is_fatal());
        assert!(!LispError::RecursionDepth(10).is_fatal());
        assert!(!LispError::Config("bad".into()).is_fatal());
    }

    #[test]
    fn display_mentions_counts() {
        let e = LispError::ArenaExhausted { live: 7, capacity: 8 };
        assert_eq!(e.to_string(), "arena exhausted: 7 of 8 slots live");
    }
}
