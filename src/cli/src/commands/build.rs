//! `kiln build` command - Build an image from a Dockerfile.
//!
//! Runs the multi-stage build engine against the local image store,
//! printing progress lines as they arrive and the resulting image ID at
//! the end. Ctrl-C cancels the build; working containers are still
//! removed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use kiln_builder::{BuildOptions, Builder, LayoutExporter, OciLauncher};
use kiln_core::{status_channel, BuilderConfig};
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub path: String,

    /// Name and optionally tag for the image (e.g., "myimage:latest"), can be repeated
    #[arg(short = 't', long = "tag")]
    pub tags: Vec<String>,

    /// Path to Dockerfile (default: <PATH>/Dockerfile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Set build-time variables (KEY=VALUE), can be repeated
    #[arg(long = "build-arg")]
    pub build_arg: Vec<String>,

    /// Export the image to TRANSPORT:PATH (oci:<dir> or oci-archive:<file>)
    #[arg(short = 'o', long = "output")]
    pub output: Option<String>,

    /// Suppress build output and print only the image ID
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(
    args: BuildArgs,
    config: BuilderConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path)
        .canonicalize()
        .map_err(|e| format!("Invalid build context path '{}': {}", args.path, e))?;
    if !context_dir.is_dir() {
        return Err(format!(
            "Build context '{}' is not a directory",
            context_dir.display()
        )
        .into());
    }

    let mut options = BuildOptions::new(&context_dir);
    if let Some(file) = &args.file {
        options.dockerfile = PathBuf::from(file);
    }
    options.tags = args.tags.clone();
    options.build_args = parse_build_args(&args.build_arg)?;
    options.output = args.output.clone();
    options.quiet = args.quiet;

    tracing::debug!(
        context = %context_dir.display(),
        runtime = %config.runtime,
        data_root = %config.data_root.display(),
        "Starting build command"
    );

    let store = super::open_store(&config)?;
    let (status, mut receiver) = status_channel(config.status_capacity);
    let launcher = OciLauncher::new(
        config.runtime.clone(),
        &config.bundles_dir(),
        status.clone().quiet(args.quiet),
    );
    let exporter = LayoutExporter::new(store.clone());
    let mut builder = Builder::new(
        options,
        store,
        Arc::new(launcher),
        Arc::new(exporter),
        config,
        status,
    );

    // Progress goes to stdout; with --quiet only warnings arrive and
    // they go to stderr so stdout carries the image ID alone.
    let quiet = args.quiet;
    let printer = tokio::spawn(async move {
        while let Some(line) = receiver.recv().await {
            if quiet {
                eprintln!("{line}");
            } else {
                println!("{line}");
            }
        }
    });

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, cancelling build...");
                cancel.cancel();
            }
        }
    });

    let result = builder.build(&cancel).await;
    interrupt.abort();
    let _ = printer.await;

    let image_id = result?;
    println!("{image_id}");
    Ok(())
}

/// Parse KEY=VALUE pairs into a HashMap.
fn parse_build_args(args: &[String]) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("Invalid build arg (expected KEY=VALUE): {arg}"))?;
        if key.is_empty() {
            return Err(format!("Invalid build arg (empty key): {arg}"));
        }
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Command};
    use clap::Parser;

    fn parse(argv: &[&str]) -> BuildArgs {
        let mut full = vec!["kiln", "build"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Command::Build(args) => args,
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn test_build_defaults() {
        let args = parse(&[]);
        assert_eq!(args.path, ".");
        assert!(args.tags.is_empty());
        assert!(args.file.is_none());
        assert!(args.output.is_none());
        assert!(!args.quiet);
    }

    #[test]
    fn test_build_all_flags() {
        let args = parse(&[
            "-t",
            "app:1",
            "--tag",
            "app:latest",
            "-f",
            "Containerfile",
            "--build-arg",
            "A=1",
            "--build-arg",
            "B=2",
            "-o",
            "oci:/tmp/out",
            "-q",
            "ctx",
        ]);
        assert_eq!(args.path, "ctx");
        assert_eq!(args.tags, vec!["app:1", "app:latest"]);
        assert_eq!(args.file.as_deref(), Some("Containerfile"));
        assert_eq!(args.build_arg, vec!["A=1", "B=2"]);
        assert_eq!(args.output.as_deref(), Some("oci:/tmp/out"));
        assert!(args.quiet);
    }

    #[test]
    fn test_parse_build_args_valid() {
        let args = vec!["VERSION=1.0".to_string(), "URL=http://x?a=1".to_string()];
        let result = parse_build_args(&args).unwrap();
        assert_eq!(result.get("VERSION").map(String::as_str), Some("1.0"));
        assert_eq!(result.get("URL").map(String::as_str), Some("http://x?a=1"));
    }

    #[test]
    fn test_parse_build_args_empty_value() {
        let result = parse_build_args(&["EMPTY=".to_string()]).unwrap();
        assert_eq!(result.get("EMPTY").map(String::as_str), Some(""));
    }

    #[test]
    fn test_parse_build_args_invalid() {
        assert!(parse_build_args(&["NOEQUALS".to_string()]).is_err());
        assert!(parse_build_args(&["=value".to_string()]).is_err());
    }
}
