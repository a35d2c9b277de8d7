//! Kiln Builder - Dockerfile parsing and multi-stage image builds.
//!
//! - [`parser`]: Dockerfile text to a [`PlayBook`] of build stages
//! - [`build`]: the stage engine driving a build to a tagged image
//! - [`oci`]: image model, local image store and OCI layout export
//! - [`runtime`]: OCI runtime bundles and the RUN process launcher

pub mod build;
pub mod fsutil;
pub mod oci;
pub mod parser;
pub mod runtime;

pub use build::{BuildOptions, Builder};
pub use oci::{Exporter, ImageStore, LayoutExporter, LocalStore};
pub use parser::{parse_dockerfile, Keyword, Line, Page, PlayBook};
pub use runtime::{OciLauncher, RuntimeLauncher};
