//! A small Lisp for constrained targets.
//!
//! Every heap object lives in one bounded arena of generation-checked
//! slots, reclaimed by a mark-and-sweep collector that runs at evaluator
//! safe points and whenever the arena fills up. Short symbol names pack into a single word;
//! longer ones are interned as heap records. Evaluation runs on an
//! explicit frame stack with a trampoline, so calls in tail position use
//! no extra frames.
//!
//! ```no_run
//! use tinylisp::{Config, Machine};
//!
//! let mut m = Machine::new(Config::default())?;
//! let val = m.eval_str("(de sq (x) (* x x)) (sq 12)")?;
//! assert_eq!(m.print_str(val), "144");
//! # Ok::<(), tinylisp::LispError>(())
//! ```

pub mod config;
pub mod error;
pub mod eval;
pub mod globals;
pub mod heap;
pub mod primitives;
pub mod printer;
pub mod reader;
pub mod symbol;
pub mod value;

pub use config::{Config, MAX_FRAMES_LIMIT};
pub use error::{LispError, LispResult};
pub use eval::{Binding, Machine, Step};
pub use heap::{AllocReport, GcStats, Native};
pub use value::{RecordId, Sym, Tag, Value};
