//! Image and container store.
//!
//! The builder talks to storage through [`ImageStore`]. [`LocalStore`] is
//! a directory-backed implementation: every image is a directory holding
//! a flattened `rootfs/` and its `config.json`, indexed by a persistent
//! `index.json`; every working container is a directory whose `rootfs/`
//! is the mountpoint instructions operate on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::image::{History, ImageDocument};
use super::layer::{detect_archive, extract_archive, sha256_bytes, sha256_file};
use super::reference::ImageReference;
use crate::fsutil::{copy_tree, dir_size};

/// A working container created from an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Host path of the container's root filesystem
    pub mountpoint: PathBuf,
    /// Image the container was created from (empty for scratch)
    pub top_layer: String,
}

/// Metadata recorded when committing a container.
#[derive(Debug, Clone)]
pub struct CommitOptions {
    /// Temporary name, removed again once the build tags the image
    pub name: Option<String>,
    pub created_by: String,
    /// Serialized [`ImageDocument`]
    pub config: Vec<u8>,
    /// Synthetic container ID recorded in the image metadata
    pub container_id: String,
    pub created: DateTime<Utc>,
}

/// Metadata for a stored image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredImage {
    pub id: String,
    /// Normalized references (e.g. "docker.io/library/alpine:latest")
    pub names: Vec<String>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    /// Synthetic container ID the image was committed with
    #[serde(default)]
    pub container_id: String,
    pub size_bytes: u64,
}

/// Storage operations the builder needs.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Resolve an image name, reference or ID to an image ID.
    async fn resolve_image(&self, name: &str) -> Result<String>;

    /// Raw config document of an image.
    async fn image_config(&self, image_id: &str) -> Result<Vec<u8>>;

    /// Root filesystem of an image.
    async fn image_rootfs(&self, image_id: &str) -> Result<PathBuf>;

    /// Create a working container; `None` creates an empty (scratch) one.
    async fn create_container(&self, image_id: Option<&str>) -> Result<ContainerInfo>;

    /// Remove a working container and its filesystem.
    async fn cleanup_container(&self, container_id: &str) -> Result<()>;

    /// Snapshot a container into a new image and return its ID.
    async fn commit(&self, container_id: &str, options: CommitOptions) -> Result<String>;

    /// Replace the names of an image. Names move from any image that held
    /// them before.
    async fn set_names(&self, image_id: &str, names: &[String]) -> Result<()>;

    async fn list_images(&self) -> Result<Vec<StoredImage>>;

    /// Create an image from a root filesystem tarball.
    async fn import_rootfs(&self, archive: &Path, name: &str) -> Result<String>;
}

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Directory-backed image store.
pub struct LocalStore {
    images_dir: PathBuf,
    containers_dir: PathBuf,
    /// Image ID → metadata
    index: RwLock<HashMap<String, StoredImage>>,
    containers: RwLock<HashMap<String, ContainerInfo>>,
}

/// Canonical form of an image name used as index key.
fn normalize_name(name: &str) -> String {
    ImageReference::parse(name)
        .map(|r| r.full_reference())
        .unwrap_or_else(|_| name.to_string())
}

impl LocalStore {
    /// Open (or create) a store. Existing images are loaded from
    /// `index.json`; entries whose directory vanished are dropped.
    pub fn new(images_dir: &Path, containers_dir: &Path) -> Result<Self> {
        for dir in [images_dir, containers_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                KilnError::Store(format!(
                    "failed to create store directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let index = Self::load_index(images_dir)?;
        Ok(Self {
            images_dir: images_dir.to_path_buf(),
            containers_dir: containers_dir.to_path_buf(),
            index: RwLock::new(index),
            containers: RwLock::new(HashMap::new()),
        })
    }

    fn image_dir(&self, image_id: &str) -> PathBuf {
        self.images_dir.join(image_id)
    }

    fn load_index(images_dir: &Path) -> Result<HashMap<String, StoredImage>> {
        let index_path = images_dir.join("index.json");
        if !index_path.exists() {
            return Ok(HashMap::new());
        }

        let data = std::fs::read_to_string(&index_path).map_err(|e| {
            KilnError::Store(format!(
                "failed to read image index {}: {}",
                index_path.display(),
                e
            ))
        })?;
        let store_index: StoreIndex = serde_json::from_str(&data)
            .map_err(|e| KilnError::Store(format!("failed to parse image index: {}", e)))?;

        Ok(store_index
            .images
            .into_iter()
            .filter(|image| images_dir.join(&image.id).exists())
            .map(|image| (image.id.clone(), image))
            .collect())
    }

    async fn save_index(&self) -> Result<()> {
        let store_index = {
            let index = self.index.read().await;
            let mut images: Vec<StoredImage> = index.values().cloned().collect();
            images.sort_by(|a, b| a.id.cmp(&b.id));
            StoreIndex { images }
        };

        let data = serde_json::to_string_pretty(&store_index)?;
        let index_path = self.images_dir.join("index.json");
        tokio::fs::write(&index_path, data).await.map_err(|e| {
            KilnError::Store(format!(
                "failed to write image index {}: {}",
                index_path.display(),
                e
            ))
        })
    }

    async fn require_image(&self, image_id: &str) -> Result<StoredImage> {
        self.index
            .read()
            .await
            .get(image_id)
            .cloned()
            .ok_or_else(|| KilnError::ImageNotFound(image_id.to_string()))
    }

    /// Record a new image directory in the index.
    async fn register(&self, image: StoredImage) -> Result<()> {
        self.index.write().await.insert(image.id.clone(), image);
        self.save_index().await
    }
}

#[async_trait]
impl ImageStore for LocalStore {
    async fn resolve_image(&self, name: &str) -> Result<String> {
        let index = self.index.read().await;
        let id = name.strip_prefix("sha256:").unwrap_or(name);
        if index.contains_key(id) {
            return Ok(id.to_string());
        }

        // Unambiguous ID prefix
        if id.len() >= 12 && id.chars().all(|c| c.is_ascii_hexdigit()) {
            let mut matches = index.keys().filter(|k| k.starts_with(id));
            if let (Some(found), None) = (matches.next(), matches.next()) {
                return Ok(found.clone());
            }
        }

        let wanted = normalize_name(name);
        index
            .values()
            .find(|img| img.names.iter().any(|n| *n == wanted))
            .map(|img| img.id.clone())
            .ok_or_else(|| KilnError::ImageNotFound(name.to_string()))
    }

    async fn image_config(&self, image_id: &str) -> Result<Vec<u8>> {
        self.require_image(image_id).await?;
        let path = self.image_dir(image_id).join("config.json");
        tokio::fs::read(&path).await.map_err(|e| {
            KilnError::Store(format!("failed to read {}: {}", path.display(), e))
        })
    }

    async fn image_rootfs(&self, image_id: &str) -> Result<PathBuf> {
        self.require_image(image_id).await?;
        Ok(self.image_dir(image_id).join("rootfs"))
    }

    async fn create_container(&self, image_id: Option<&str>) -> Result<ContainerInfo> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mountpoint = self.containers_dir.join(&id).join("rootfs");

        match image_id {
            Some(image_id) => {
                self.require_image(image_id).await?;
                copy_tree(&self.image_dir(image_id).join("rootfs"), &mountpoint)?;
            }
            None => std::fs::create_dir_all(&mountpoint)?,
        }

        let info = ContainerInfo {
            name: format!("kiln-working-container-{}", &id[..12]),
            id: id.clone(),
            mountpoint,
            top_layer: image_id.unwrap_or_default().to_string(),
        };
        self.containers.write().await.insert(id, info.clone());

        tracing::debug!(container = %info.id, image = ?image_id, "Created working container");
        Ok(info)
    }

    async fn cleanup_container(&self, container_id: &str) -> Result<()> {
        self.containers.write().await.remove(container_id);
        let dir = self.containers_dir.join(container_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await.map_err(|e| {
                KilnError::Store(format!(
                    "failed to remove container {}: {}",
                    container_id, e
                ))
            })?;
        }
        tracing::debug!(container = %container_id, "Removed working container");
        Ok(())
    }

    async fn commit(&self, container_id: &str, options: CommitOptions) -> Result<String> {
        let container = self
            .containers
            .read()
            .await
            .get(container_id)
            .cloned()
            .ok_or_else(|| KilnError::Store(format!("unknown container {}", container_id)))?;

        let mut seed = options.config.clone();
        seed.extend_from_slice(options.container_id.as_bytes());
        seed.extend_from_slice(options.created.to_rfc3339().as_bytes());
        let id = sha256_bytes(&seed);

        let image_dir = self.image_dir(&id);
        copy_tree(&container.mountpoint, &image_dir.join("rootfs"))?;
        std::fs::write(image_dir.join("config.json"), &options.config)?;

        let names = options.name.iter().map(|n| normalize_name(n)).collect();
        self.register(StoredImage {
            id: id.clone(),
            names,
            created: options.created,
            created_by: options.created_by,
            container_id: options.container_id,
            size_bytes: dir_size(&image_dir),
        })
        .await?;

        tracing::info!(image = %id, container = %container_id, "Committed container");
        Ok(id)
    }

    async fn set_names(&self, image_id: &str, names: &[String]) -> Result<()> {
        let names: Vec<String> = names.iter().map(|n| normalize_name(n)).collect();
        {
            let mut index = self.index.write().await;
            if !index.contains_key(image_id) {
                return Err(KilnError::ImageNotFound(image_id.to_string()));
            }
            for image in index.values_mut() {
                if image.id == image_id {
                    image.names = names.clone();
                } else {
                    image.names.retain(|n| !names.contains(n));
                }
            }
        }
        self.save_index().await
    }

    async fn list_images(&self) -> Result<Vec<StoredImage>> {
        let mut images: Vec<StoredImage> = self.index.read().await.values().cloned().collect();
        images.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(images)
    }

    async fn import_rootfs(&self, archive: &Path, name: &str) -> Result<String> {
        let kind = detect_archive(archive)?.ok_or_else(|| {
            KilnError::Store(format!("{} is not a tar archive", archive.display()))
        })?;

        let created = Utc::now();
        let mut doc = ImageDocument::scratch();
        doc.created = Some(created);
        doc.config.set_env(
            "PATH",
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
        );
        doc.history.push(History {
            created: Some(created),
            created_by: format!("imported from {}", archive.display()),
            empty_layer: false,
        });
        let config = doc.to_bytes()?;

        let mut seed = config.clone();
        seed.extend_from_slice(sha256_file(archive)?.as_bytes());
        let id = sha256_bytes(&seed);

        let image_dir = self.image_dir(&id);
        extract_archive(archive, kind, &image_dir.join("rootfs"))?;
        std::fs::write(image_dir.join("config.json"), &config)?;

        self.register(StoredImage {
            id: id.clone(),
            names: Vec::new(),
            created,
            created_by: "import".to_string(),
            container_id: String::new(),
            size_bytes: dir_size(&image_dir),
        })
        .await?;
        self.set_names(&id, &[name.to_string()]).await?;

        tracing::info!(image = %id, name, "Imported root filesystem");
        Ok(id)
    }
}
