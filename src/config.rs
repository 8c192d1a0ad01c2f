use crate::error::{LispError, LispResult};

/// Largest accepted `max_frames`. Every frame nests a few native calls, and
/// this many fit comfortably in an 8 MiB main-thread stack.
pub const MAX_FRAMES_LIMIT: usize = 2048;

/// Interpreter limits. One `Config` is fixed per `Machine`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of live heap records (slots in the arena table).
    pub arena_capacity: usize,
    /// Collect at a safe point once occupancy reaches this percentage.
    pub gc_threshold_percent: usize,
    /// Bound on the explicit evaluation frame stack, at most
    /// `MAX_FRAMES_LIMIT`.
    pub max_frames: usize,
    /// Reject closure and primitive calls with the wrong argument count
    /// instead of binding missing arguments to nil and dropping extras.
    pub strict_arity: bool,
    /// Recycled record shells kept per size class.
    pub free_list_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            arena_capacity: 8192,
            gc_threshold_percent: 80,
            max_frames: 512,
            strict_arity: false,
            free_list_limit: 32,
        }
    }
}

impl Config {
    /// Limits sized for a microcontroller with a few tens of KB of heap.
    pub fn embedded() -> Self {
        Config {
            arena_capacity: 1024,
            max_frames: 128,
            free_list_limit: 8,
            ..Config::default()
        }
    }

    pub fn validate(&self) -> LispResult<()> {
        if self.arena_capacity == 0 || self.arena_capacity > u32::MAX as usize {
            return Err(LispError::Config(format!(
                "arena capacity {} out of range",
                self.arena_capacity
            )));
        }
        if !(1..=100).contains(&self.gc_threshold_percent) {
            return Err(LispError::Config(format!(
                "gc threshold {}% must be between 1 and 100",
                self.gc_threshold_percent
            )));
        }
        if !(1..=MAX_FRAMES_LIMIT).contains(&self.max_frames) {
            return Err(LispError::Config(format!(
                "max frames {} must be between 1 and {}",
                self.max_frames, MAX_FRAMES_LIMIT
            )));
        }
        Ok(())
    }
}
