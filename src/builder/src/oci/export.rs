//! Image export.
//!
//! Destinations are `transport:path` strings. [`LayoutExporter`] writes
//! OCI image layouts, either as a directory (`oci:<dir>`) or as a tar
//! file (`oci-archive:<file>`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::error::{KilnError, Result};

use super::layer::{create_layer_from_dir, sha256_bytes};
use super::store::ImageStore;

/// Serializes a committed image to a destination.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(&self, image_id: &str, dest: &str) -> Result<()>;
}

/// Parsed export destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    /// OCI image layout directory
    OciDir(PathBuf),
    /// OCI image layout packed into a tar file
    OciArchive(PathBuf),
}

/// Parse a `transport:path` destination.
pub fn parse_export_spec(dest: &str) -> Result<ExportTarget> {
    let (transport, path) = dest
        .split_once(':')
        .ok_or_else(|| KilnError::Export(format!("destination {:?} has no transport", dest)))?;
    if path.is_empty() {
        return Err(KilnError::Export(format!(
            "destination {:?} has no path",
            dest
        )));
    }
    match transport {
        "oci" => Ok(ExportTarget::OciDir(PathBuf::from(path))),
        "oci-archive" => Ok(ExportTarget::OciArchive(PathBuf::from(path))),
        other => Err(KilnError::Export(format!(
            "unsupported transport {:?}",
            other
        ))),
    }
}

/// Exporter writing OCI image layouts from a store.
pub struct LayoutExporter {
    store: Arc<dyn ImageStore>,
}

impl LayoutExporter {
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Exporter for LayoutExporter {
    async fn export(&self, image_id: &str, dest: &str) -> Result<()> {
        let target = parse_export_spec(dest)?;
        let rootfs = self.store.image_rootfs(image_id).await?;
        let config = self.store.image_config(image_id).await?;

        tokio::task::spawn_blocking(move || match target {
            ExportTarget::OciDir(dir) => write_layout(&rootfs, &config, &dir),
            ExportTarget::OciArchive(file) => {
                let staging = tempfile::TempDir::new()?;
                write_layout(&rootfs, &config, staging.path())?;
                pack_directory(staging.path(), &file)
            }
        })
        .await
        .map_err(|e| KilnError::Export(format!("export task failed: {}", e)))??;

        tracing::info!(image = %image_id, dest, "Exported image");
        Ok(())
    }
}

/// Write an OCI image layout with one squashed layer to `output_dir`.
fn write_layout(rootfs: &Path, config: &[u8], output_dir: &Path) -> Result<()> {
    let blobs_dir = output_dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir)?;

    let staging_layer = blobs_dir.join(".layer.tmp");
    let layer = create_layer_from_dir(rootfs, &staging_layer)?;
    std::fs::rename(&staging_layer, blobs_dir.join(&layer.digest))?;

    let mut config_obj: serde_json::Value = serde_json::from_slice(config)?;
    let Some(config_map) = config_obj.as_object_mut() else {
        return Err(KilnError::Export("image config is not a JSON object".to_string()));
    };
    config_map.insert(
        "rootfs".to_string(),
        serde_json::json!({
            "type": "layers",
            "diff_ids": [format!("sha256:{}", layer.diff_id)]
        }),
    );

    let config_bytes = serde_json::to_vec(&config_obj)?;
    let config_digest = sha256_bytes(&config_bytes);
    std::fs::write(blobs_dir.join(&config_digest), &config_bytes)?;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": format!("sha256:{}", config_digest),
            "size": config_bytes.len()
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": layer.prefixed_digest(),
            "size": layer.size
        }]
    });
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let manifest_digest = sha256_bytes(&manifest_bytes);
    std::fs::write(blobs_dir.join(&manifest_digest), &manifest_bytes)?;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": format!("sha256:{}", manifest_digest),
            "size": manifest_bytes.len()
        }]
    });
    std::fs::write(output_dir.join("index.json"), serde_json::to_vec_pretty(&index)?)?;
    std::fs::write(
        output_dir.join("oci-layout"),
        r#"{"imageLayoutVersion":"1.0.0"}"#,
    )?;
    Ok(())
}

fn pack_directory(dir: &Path, file: &Path) -> Result<()> {
    if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut builder = tar::Builder::new(std::fs::File::create(file)?);
    builder.append_dir_all(".", dir)?;
    builder.finish()?;
    Ok(())
}
