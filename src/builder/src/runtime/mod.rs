//! OCI runtime integration for RUN instructions.

mod launcher;
mod spec;

pub use launcher::{OciLauncher, RuntimeLauncher};
pub use spec::{RunRequest, RuntimeSpec, OCI_RUNTIME_SPEC_VERSION};
