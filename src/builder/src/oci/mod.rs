//! Image model and the storage/export collaborators of the builder.

pub mod export;
pub mod image;
pub mod layer;
pub mod reference;
pub mod store;

pub use export::{parse_export_spec, ExportTarget, Exporter, LayoutExporter};
pub use image::{ContainerConfig, EmptyObject, HealthConfig, History, ImageDocument};
pub use reference::{check_and_expand_tag, ImageReference};
pub use store::{CommitOptions, ContainerInfo, ImageStore, LocalStore, StoredImage};
