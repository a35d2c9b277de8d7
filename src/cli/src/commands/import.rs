//! `kiln import` command - seed the local store with a base image.

use std::path::PathBuf;

use clap::Args;
use kiln_builder::oci::check_and_expand_tag;
use kiln_builder::ImageStore;
use kiln_core::BuilderConfig;

#[derive(Args)]
pub struct ImportArgs {
    /// Root filesystem tarball (.tar, .tar.gz, .tar.bz2, .tar.xz)
    pub archive: PathBuf,

    /// Name for the imported image (e.g., "alpine:3.19")
    pub name: String,
}

pub async fn execute(
    args: ImportArgs,
    config: BuilderConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if !args.archive.is_file() {
        return Err(format!("Archive not found: {}", args.archive.display()).into());
    }
    let name = check_and_expand_tag(&args.name)?
        .ok_or_else(|| "Image name must not be empty".to_string())?;

    let store = super::open_store(&config)?;
    let image_id = store.import_rootfs(&args.archive, &name).await?;
    println!("{image_id}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::commands::{Cli, Command};
    use clap::Parser;

    #[test]
    fn test_import_args() {
        let cli = Cli::try_parse_from(["kiln", "import", "rootfs.tar.gz", "alpine:3.19"]).unwrap();
        let Command::Import(args) = cli.command else {
            panic!("expected import");
        };
        assert_eq!(args.archive.to_str(), Some("rootfs.tar.gz"));
        assert_eq!(args.name, "alpine:3.19");
    }

    #[test]
    fn test_import_requires_name() {
        assert!(Cli::try_parse_from(["kiln", "import", "rootfs.tar"]).is_err());
    }
}
