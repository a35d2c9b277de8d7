//! CLI command definitions and dispatch.

mod build;
mod images;
mod import;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kiln_builder::LocalStore;
use kiln_core::BuilderConfig;

/// Kiln - build OCI images from Dockerfiles.
#[derive(Parser)]
#[command(name = "kiln", version, about)]
pub struct Cli {
    /// Configuration file (default: ~/.kiln/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Root directory for images and working containers
    #[arg(long, global = true)]
    pub data_root: Option<PathBuf>,

    /// OCI runtime binary used for RUN (e.g. runc, crun)
    #[arg(long, global = true)]
    pub runtime: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a Dockerfile
    Build(build::BuildArgs),
    /// List images in the local store
    Images(images::ImagesArgs),
    /// Create a base image from a root filesystem tarball
    Import(import::ImportArgs),
}

impl Cli {
    /// Load the configuration named by `--config`, or the default file,
    /// then apply command-line overrides.
    pub fn load_config(&self) -> kiln_core::Result<BuilderConfig> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(BuilderConfig::default_path);
        let mut config = BuilderConfig::load(&path)?;
        if let Some(data_root) = &self.data_root {
            config.data_root = data_root.clone();
        }
        if let Some(runtime) = &self.runtime {
            config.runtime = runtime.clone();
        }
        Ok(config)
    }
}

/// Open the local image store under the configured data root.
pub(crate) fn open_store(config: &BuilderConfig) -> kiln_core::Result<Arc<LocalStore>> {
    Ok(Arc::new(LocalStore::new(
        &config.images_dir(),
        &config.containers_dir(),
    )?))
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: BuilderConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args, config).await,
        Command::Images(args) => images::execute(args, config).await,
        Command::Import(args) => import::execute(args, config).await,
    }
}
