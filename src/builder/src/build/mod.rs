//! Multi-stage build engine.
//!
//! [`Builder`] is the entry point. The submodules hold one concern each:
//! stage state and scoping, instruction execution, ADD/COPY, and commit.

mod commit;
mod copy;
mod dispatch;
mod engine;
mod ignore;
mod scope;
mod signal;
mod stage;
mod user;

pub use engine::{BuildOptions, Builder};
pub use ignore::{IgnoreMatcher, IGNORE_FILE};
pub use scope::RESERVED_ARGS;
pub use signal::parse_signal;
pub use stage::StageState;
