//! Filesystem helpers shared by the store, COPY/ADD and the exporter.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use kiln_core::error::{KilnError, Result};

/// Symlinks followed by [`secure_join`] before giving up.
const MAX_SYMLINKS: usize = 255;

/// Join `unsafe_path` under `root`, resolving symlinks as if `root` were
/// the filesystem root. The result never escapes `root`.
pub fn secure_join(root: &Path, unsafe_path: &str) -> Result<PathBuf> {
    let mut pending: VecDeque<OsString> = components(Path::new(unsafe_path));
    let mut current = PathBuf::new();
    let mut followed = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            current.pop();
            continue;
        }

        let candidate = root.join(&current).join(&part);
        match std::fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                followed += 1;
                if followed > MAX_SYMLINKS {
                    return Err(KilnError::Semantic(format!(
                        "too many symlinks resolving {}",
                        unsafe_path
                    )));
                }
                let target = std::fs::read_link(&candidate)?;
                if target.is_absolute() {
                    current = PathBuf::new();
                }
                for part in components(&target).into_iter().rev() {
                    pending.push_front(part);
                }
            }
            _ => current.push(&part),
        }
    }

    Ok(root.join(current))
}

/// Normal and `..` components of a path; root and `.` are dropped.
fn components(path: &Path) -> VecDeque<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            _ => None,
        })
        .collect()
}

/// Lexically clean an absolute container path (`/a/./b/../c` → `/a/c`).
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Copy a file, directory tree or symlink, preserving symlinks and modes.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(src).map_err(|e| {
        KilnError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to stat {}: {}", src.display(), e),
        ))
    })?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        let target = std::fs::read_link(src)?;
        if std::fs::symlink_metadata(dst).is_ok() {
            remove_path(dst)?;
        }
        std::os::unix::fs::symlink(target, dst)?;
    } else if file_type.is_dir() {
        if std::fs::symlink_metadata(dst).is_ok_and(|m| !m.is_dir()) {
            remove_path(dst)?;
        }
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        std::fs::set_permissions(dst, std::fs::Permissions::from_mode(meta.permissions().mode()))?;
    } else {
        if std::fs::symlink_metadata(dst).is_ok_and(|m| m.file_type().is_symlink() || m.is_dir()) {
            remove_path(dst)?;
        }
        std::fs::copy(src, dst).map_err(|e| {
            KilnError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to copy {} to {}: {}", src.display(), dst.display(), e),
            ))
        })?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Change ownership of a path and everything below it, without following
/// symlinks.
pub fn chown_tree(path: &Path, uid: u32, gid: u32) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}

/// Total size of regular files below `path`.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let Ok(meta) = entry.path().symlink_metadata() else {
                continue;
            };
            if meta.is_dir() {
                total += dir_size(&entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_secure_join_plain() {
        let root = TempDir::new().unwrap();
        let joined = secure_join(root.path(), "/etc/passwd").unwrap();
        assert_eq!(joined, root.path().join("etc/passwd"));
    }

    #[test]
    fn test_secure_join_clamps_parent() {
        let root = TempDir::new().unwrap();
        let joined = secure_join(root.path(), "../../etc/./passwd").unwrap();
        assert_eq!(joined, root.path().join("etc/passwd"));
    }

    #[test]
    fn test_secure_join_absolute_symlink_stays_inside() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("real")).unwrap();
        std::os::unix::fs::symlink("/real", root.path().join("link")).unwrap();
        let joined = secure_join(root.path(), "/link/file").unwrap();
        assert_eq!(joined, root.path().join("real/file"));
    }

    #[test]
    fn test_secure_join_relative_escape_clamped() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("a")).unwrap();
        std::os::unix::fs::symlink("../../../../outside", root.path().join("a/link")).unwrap();
        let joined = secure_join(root.path(), "a/link").unwrap();
        assert_eq!(joined, root.path().join("outside"));
    }

    #[test]
    fn test_secure_join_symlink_loop() {
        let root = TempDir::new().unwrap();
        std::os::unix::fs::symlink("b", root.path().join("a")).unwrap();
        std::os::unix::fs::symlink("a", root.path().join("b")).unwrap();
        assert!(secure_join(root.path(), "a").is_err());
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/a/./b/../c/"), "/a/c");
        assert_eq!(clean_path("../x"), "/x");
        assert_eq!(clean_path(""), "/");
    }

    #[test]
    fn test_copy_tree_preserves_symlinks_and_modes() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("bin")).unwrap();
        std::fs::write(src.path().join("bin/tool"), b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(
            src.path().join("bin/tool"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        std::os::unix::fs::symlink("bin/tool", src.path().join("tool")).unwrap();

        let target = dst.path().join("out");
        copy_tree(src.path(), &target).unwrap();

        let mode = std::fs::metadata(target.join("bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            std::fs::read_link(target.join("tool")).unwrap(),
            PathBuf::from("bin/tool")
        );
    }

    #[test]
    fn test_dir_size() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), b"12345").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), b"123").unwrap();
        assert_eq!(dir_size(dir.path()), 8);
    }
}
