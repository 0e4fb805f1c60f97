//! Built-in execution engine for Quill kernels.
//!
//! The engine is a separate process that reads directives from stdin and
//! writes kernel messages to stdout, one JSON record per line. Submissions
//! pass through the directive preprocessor (`%magic`, `%%cell magic`,
//! `!shell`) before the remaining lines run as ordinary code.

pub mod directive;
pub mod engine;
pub mod error;
pub mod eval;
pub mod interrupt;
mod magics;
pub mod shell;

pub use directive::{Line, Submission};
pub use engine::{Engine, MessageSink, Outcome, WireSink, serve};
pub use error::{DirectiveError, EvalError, ExecError};
pub use interrupt::InterruptFlag;
