//! `USER name[:group]` resolution against a stage's root filesystem.

use std::path::Path;

use kiln_core::error::{KilnError, Result};

use crate::fsutil::secure_join;

/// Resolve a USER value to `(uid, gid)`.
///
/// Numeric IDs are taken as-is. Names are looked up in the rootfs
/// `/etc/passwd` and `/etc/group`. Without a group, the user's primary
/// group is used (or the uid when the user is numeric and unknown).
pub fn resolve_user(rootfs: &Path, spec: &str) -> Result<(u32, u32)> {
    if spec.is_empty() {
        return Ok((0, 0));
    }
    let (user, group) = match spec.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (spec, None),
    };

    let passwd = read_db(rootfs, "/etc/passwd")?;
    let entry = passwd.iter().find(|fields| {
        fields.first().map(String::as_str) == Some(user)
            || fields.get(2).map(String::as_str) == Some(user)
    });

    let uid = match user.parse::<u32>() {
        Ok(uid) => uid,
        Err(_) => entry
            .and_then(|f| f.get(2))
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| KilnError::Semantic(format!("unknown user {:?}", user)))?,
    };

    let gid = match group {
        Some(group) => match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => read_db(rootfs, "/etc/group")?
                .iter()
                .find(|fields| fields.first().map(String::as_str) == Some(group))
                .and_then(|f| f.get(2))
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| KilnError::Semantic(format!("unknown group {:?}", group)))?,
        },
        None => entry
            .and_then(|f| f.get(3))
            .and_then(|v| v.parse().ok())
            .unwrap_or(uid),
    };

    Ok((uid, gid))
}

/// Read a colon-separated database file; a missing file is empty.
fn read_db(rootfs: &Path, path: &str) -> Result<Vec<Vec<String>>> {
    let full = secure_join(rootfs, path)?;
    let content = match std::fs::read_to_string(&full) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .filter(|l| !l.trim_start().starts_with('#') && !l.trim().is_empty())
        .map(|l| l.split(':').map(str::to_string).collect())
        .collect())
}
