//! ADD and COPY.

use std::path::{Path, PathBuf};

use glob::Pattern;
use kiln_core::error::{KilnError, Result};

use super::ignore::IgnoreMatcher;
use crate::fsutil::{chown_tree, clean_path, copy_tree, secure_join};
use crate::oci::layer::{detect_archive, extract_archive};

/// One ADD/COPY execution.
pub struct CopyRequest<'a> {
    /// Expanded source words
    pub sources: &'a [String],
    /// Expanded destination word
    pub dest: &'a str,
    /// Build context, or the mountpoint named by `--from`
    pub source_root: &'a Path,
    /// Ignore rules; only applied to the build context
    pub ignore: Option<&'a IgnoreMatcher>,
    pub mountpoint: &'a Path,
    pub workdir: &'a str,
    pub chown: Option<(u32, u32)>,
    /// ADD from the build context: unpack local archives
    pub extract_archives: bool,
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://") || source.starts_with("git@")
}

fn has_glob(source: &str) -> bool {
    source.contains(['*', '?', '['])
}

/// Copy the request's sources into the stage root filesystem.
pub fn copy_sources(req: &CopyRequest<'_>) -> Result<()> {
    if let Some(url) = req.sources.iter().find(|s| is_remote(s)) {
        return Err(KilnError::Semantic(format!(
            "remote source {} is not supported",
            url
        )));
    }

    let mut matched = Vec::new();
    for source in req.sources {
        matched.extend(expand_source(req, source)?);
    }

    let dest_is_dir = req.dest.ends_with('/') || req.dest.ends_with("/.") || req.dest == ".";
    if matched.len() > 1 && !dest_is_dir {
        return Err(KilnError::Semantic(format!(
            "when copying more than one source the destination must be a directory ending with '/', got {:?}",
            req.dest
        )));
    }

    let dest = if req.dest.starts_with('/') {
        clean_path(req.dest)
    } else {
        clean_path(&format!("{}/{}", req.workdir, req.dest))
    };
    let dest_path = secure_join(req.mountpoint, &dest)?;
    let dest_is_dir = dest_is_dir || dest_path.is_dir();

    for (source, rel) in matched {
        let targets = copy_one(req, &source, &rel, &dest_path, dest_is_dir)?;
        if let Some((uid, gid)) = req.chown {
            for target in targets {
                chown_tree(&target, uid, gid)?;
            }
        }
    }
    Ok(())
}

/// Source paths for one word, paired with their path relative to the root.
fn expand_source(req: &CopyRequest<'_>, source: &str) -> Result<Vec<(PathBuf, String)>> {
    let rel = clean_path(source).trim_start_matches('/').to_string();

    if !has_glob(&rel) {
        let path = secure_join(req.source_root, &rel)?;
        if std::fs::symlink_metadata(&path).is_err() {
            return Err(KilnError::Semantic(format!(
                "source {} not found in {}",
                source,
                req.source_root.display()
            )));
        }
        if is_ignored(req, &rel) {
            return Err(KilnError::Semantic(format!(
                "source {} is excluded by .dockerignore",
                source
            )));
        }
        return Ok(vec![(path, rel)]);
    }

    let root = req.source_root.to_string_lossy();
    let pattern = format!("{}/{}", Pattern::escape(&root), rel);
    let entries = glob::glob(&pattern)
        .map_err(|e| KilnError::Semantic(format!("invalid source pattern {:?}: {}", source, e)))?;

    let mut matched = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| KilnError::Io(std::io::Error::from(e)))?;
        let rel = path
            .strip_prefix(req.source_root)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !is_ignored(req, &rel) {
            matched.push((path, rel));
        }
    }
    if matched.is_empty() {
        return Err(KilnError::Semantic(format!(
            "no source files were specified by {:?}",
            source
        )));
    }
    Ok(matched)
}

fn is_ignored(req: &CopyRequest<'_>, rel: &str) -> bool {
    req.ignore
        .is_some_and(|ignore| ignore.is_excluded(Path::new(rel)))
}

/// Copy one matched source. Returns the top-level paths written.
fn copy_one(
    req: &CopyRequest<'_>,
    source: &Path,
    rel: &str,
    dest: &Path,
    dest_is_dir: bool,
) -> Result<Vec<PathBuf>> {
    let meta = std::fs::symlink_metadata(source)?;

    if meta.is_dir() {
        std::fs::create_dir_all(dest)?;
        let mut written = Vec::new();
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            let child_rel = format!("{}/{}", rel, entry.file_name().to_string_lossy());
            let target = dest.join(entry.file_name());
            if copy_filtered(req, &entry.path(), child_rel.trim_start_matches('/'), &target)? {
                written.push(target);
            }
        }
        return Ok(written);
    }

    if req.extract_archives && meta.is_file() {
        if let Some(kind) = detect_archive(source)? {
            extract_archive(source, kind, dest)?;
            tracing::debug!(archive = %source.display(), "Unpacked ADD archive");
            return Ok(vec![dest.to_path_buf()]);
        }
    }

    let target = match source.file_name() {
        Some(name) if dest_is_dir => dest.join(name),
        _ => dest.to_path_buf(),
    };
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    copy_tree(source, &target)?;
    Ok(vec![target])
}

/// Copy `source` to `target`, skipping ignored entries below directories.
/// Returns whether anything was written.
fn copy_filtered(req: &CopyRequest<'_>, source: &Path, rel: &str, target: &Path) -> Result<bool> {
    if is_ignored(req, rel) {
        return Ok(false);
    }
    let meta = std::fs::symlink_metadata(source)?;
    if !meta.is_dir() || req.ignore.map_or(true, IgnoreMatcher::is_empty) {
        copy_tree(source, target)?;
        return Ok(true);
    }

    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let child_rel = format!("{}/{}", rel, entry.file_name().to_string_lossy());
        copy_filtered(req, &entry.path(), &child_rel, &target.join(entry.file_name()))?;
    }
    Ok(true)
}
