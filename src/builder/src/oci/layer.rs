//! Layer archives: detection and extraction of tar archives (ADD, image
//! import) and creation of tar.gz layers (export).

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use kiln_core::error::{KilnError, Result};
use sha2::{Digest, Sha256};

/// Compression of a tar archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    Gzip,
    Bzip2,
    Xz,
}

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const TAR_MAGIC_OFFSET: usize = 257;

fn open_decoder(path: &Path, kind: ArchiveKind) -> Result<Box<dyn Read>> {
    let file = BufReader::new(File::open(path)?);
    Ok(match kind {
        ArchiveKind::Tar => Box::new(file),
        ArchiveKind::Gzip => Box::new(GzDecoder::new(file)),
        ArchiveKind::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
        ArchiveKind::Xz => Box::new(xz2::read::XzDecoder::new(file)),
    })
}

fn has_tar_header(reader: &mut dyn Read) -> bool {
    let mut header = [0u8; 512];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    filled > TAR_MAGIC_OFFSET + 5 && &header[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar"
}

/// Detect whether `path` is a (possibly compressed) tar archive.
///
/// Returns `None` for anything else, including compressed non-tar files.
pub fn detect_archive(path: &Path) -> Result<Option<ArchiveKind>> {
    let mut magic = [0u8; 6];
    let n = File::open(path)?.read(&mut magic)?;
    let magic = &magic[..n];

    let kind = if magic.starts_with(GZIP_MAGIC) {
        ArchiveKind::Gzip
    } else if magic.starts_with(BZIP2_MAGIC) {
        ArchiveKind::Bzip2
    } else if magic.starts_with(XZ_MAGIC) {
        ArchiveKind::Xz
    } else {
        ArchiveKind::Tar
    };

    let mut reader = open_decoder(path, kind)?;
    Ok(has_tar_header(reader.as_mut()).then_some(kind))
}

/// Extract a tar archive of the given kind into `target_dir`.
pub fn extract_archive(path: &Path, kind: ArchiveKind, target_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(target_dir)?;
    let mut archive = tar::Archive::new(open_decoder(path, kind)?);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(target_dir).map_err(|e| {
        KilnError::Io(std::io::Error::new(
            e.kind(),
            format!(
                "failed to extract {} to {}: {}",
                path.display(),
                target_dir.display(),
                e
            ),
        ))
    })?;

    tracing::debug!(
        archive = %path.display(),
        target = %target_dir.display(),
        ?kind,
        "Extracted archive"
    );
    Ok(())
}

/// Information about a created layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    /// Path to the layer tar.gz file
    pub path: PathBuf,
    /// SHA256 digest (hex string, without "sha256:" prefix)
    pub digest: String,
    /// Uncompressed tar digest (hex string)
    pub diff_id: String,
    pub size: u64,
}

impl LayerInfo {
    /// Get the digest with "sha256:" prefix.
    pub fn prefixed_digest(&self) -> String {
        format!("sha256:{}", self.digest)
    }
}

/// Create a tar.gz layer holding the whole of `src_dir`.
pub fn create_layer_from_dir(src_dir: &Path, output_path: &Path) -> Result<LayerInfo> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let file = File::create(output_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    add_dir_to_tar(&mut builder, src_dir, src_dir)?;

    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| KilnError::Export(format!("failed to finalize layer: {}", e)))?;

    Ok(LayerInfo {
        path: output_path.to_path_buf(),
        digest: sha256_file(output_path)?,
        diff_id: compute_diff_id(output_path)?,
        size: std::fs::metadata(output_path)?.len(),
    })
}

/// Recursively add a directory's contents to a tar builder.
fn add_dir_to_tar<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    current: &Path,
) -> Result<()> {
    let mut entries = std::fs::read_dir(current)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| KilnError::Export(format!("failed to strip prefix: {}", e)))?;

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            builder.append_dir(relative, &path)?;
            add_dir_to_tar(builder, root, &path)?;
        } else {
            builder.append_path_with_name(&path, relative)?;
        }
    }
    Ok(())
}

/// Compute SHA256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the diff_id (SHA256 of the uncompressed layer tar).
pub fn compute_diff_id(layer_path: &Path) -> Result<String> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(layer_path)?));
    let mut hasher = Sha256::new();
    std::io::copy(&mut decoder, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// Write a tar with the given files, compressed per `kind`.
    pub(crate) fn write_test_archive(path: &Path, kind: ArchiveKind, files: &[(&str, &[u8])]) {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();

        let bytes = match kind {
            ArchiveKind::Tar => tar_bytes,
            ArchiveKind::Gzip => {
                let mut enc =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(&tar_bytes).unwrap();
                enc.finish().unwrap()
            }
            ArchiveKind::Bzip2 => {
                let mut enc =
                    bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
                enc.write_all(&tar_bytes).unwrap();
                enc.finish().unwrap()
            }
            ArchiveKind::Xz => {
                let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
                enc.write_all(&tar_bytes).unwrap();
                enc.finish().unwrap()
            }
        };
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_detect_and_extract_every_kind() {
        let tmp = TempDir::new().unwrap();
        for kind in [
            ArchiveKind::Tar,
            ArchiveKind::Gzip,
            ArchiveKind::Bzip2,
            ArchiveKind::Xz,
        ] {
            let archive = tmp.path().join(format!("{:?}.archive", kind));
            write_test_archive(&archive, kind, &[("dir/hello.txt", b"hello")]);
            assert_eq!(detect_archive(&archive).unwrap(), Some(kind));

            let target = tmp.path().join(format!("{:?}-out", kind));
            extract_archive(&archive, kind, &target).unwrap();
            assert_eq!(
                std::fs::read_to_string(target.join("dir/hello.txt")).unwrap(),
                "hello"
            );
        }
    }

    #[test]
    fn test_detect_plain_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, b"just text").unwrap();
        assert_eq!(detect_archive(&path).unwrap(), None);

        let gz = tmp.path().join("notes.gz");
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"compressed but not a tar").unwrap();
        std::fs::write(&gz, enc.finish().unwrap()).unwrap();
        assert_eq!(detect_archive(&gz).unwrap(), None);
    }

    #[test]
    fn test_create_layer_from_dir() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("rootfs");
        std::fs::create_dir_all(src.join("etc")).unwrap();
        std::fs::write(src.join("etc/hostname"), b"kiln").unwrap();
        std::os::unix::fs::symlink("etc/hostname", src.join("hostname")).unwrap();

        let layer = create_layer_from_dir(&src, &tmp.path().join("layer.tar.gz")).unwrap();
        assert_eq!(layer.digest.len(), 64);
        assert_eq!(layer.diff_id.len(), 64);
        assert_ne!(layer.digest, layer.diff_id);
        assert!(layer.prefixed_digest().starts_with("sha256:"));

        let out = tmp.path().join("out");
        extract_archive(&layer.path, ArchiveKind::Gzip, &out).unwrap();
        assert_eq!(std::fs::read_to_string(out.join("etc/hostname")).unwrap(), "kiln");
        assert!(std::fs::symlink_metadata(out.join("hostname"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(
            sha256_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
