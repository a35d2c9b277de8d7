//! Image reference parsing and tag expansion.
//!
//! Parses references like `registry.example.com:5000/team/app:v1` into
//! structured components.

use kiln_core::error::{KilnError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

static REGISTRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?(:[0-9]+)?$").expect("valid registry regex")
});

static PATH_COMPONENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("valid path component regex")
});

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid tag regex"));

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/alpine")
    pub repository: String,
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `alpine` → docker.io/library/alpine:latest
    /// - `team/app:v1` → docker.io/team/app:v1
    /// - `localhost:5000/app` → localhost:5000/app:latest
    /// - `app@sha256:abc...` → docker.io/library/app@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(KilnError::InvalidTag("empty image reference".to_string()));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(KilnError::InvalidTag(format!(
                        "invalid digest in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag is a ':' after the last '/'; an earlier ':' is a registry port.
        let last_slash = name_tag.rfind('/');
        let (name, tag) = match name_tag.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            _ => (name_tag, None),
        };

        let (registry, repository) = split_registry_repository(name)?;
        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Check every component against the reference grammar.
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: &str| {
            Err(KilnError::InvalidTag(format!(
                "invalid {} in reference '{}'",
                what,
                self.full_reference()
            )))
        };
        if !REGISTRY_RE.is_match(&self.registry) {
            return invalid("registry");
        }
        if !self
            .repository
            .split('/')
            .all(|c| PATH_COMPONENT_RE.is_match(c))
        {
            return invalid("repository");
        }
        if let Some(tag) = &self.tag {
            if !TAG_RE.is_match(tag) {
                return invalid("tag");
            }
        }
        Ok(())
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(name: &str) -> Result<(String, String)> {
    if let Some((first, repo)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if repo.is_empty() {
                return Err(KilnError::InvalidTag(format!(
                    "empty repository in reference '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), repo.to_string()));
        }
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

/// Validate a `-t` tag and append `:latest` when it carries no tag.
///
/// An empty tag means "untagged" and yields `None`.
pub fn check_and_expand_tag(tag: &str) -> Result<Option<String>> {
    let tag = tag.trim();
    if tag.is_empty() {
        return Ok(None);
    }
    if tag.contains('@') {
        return Err(KilnError::InvalidTag(format!(
            "tag '{}' must not contain a digest",
            tag
        )));
    }
    if tag.split(':').count() > 3 {
        return Err(KilnError::InvalidTag(format!(
            "tag '{}' has too many ':' separated fields",
            tag
        )));
    }

    let has_tag = match (tag.rfind(':'), tag.rfind('/')) {
        (Some(colon), Some(slash)) => colon > slash,
        (Some(_), None) => true,
        (None, _) => false,
    };
    let expanded = if has_tag {
        tag.to_string()
    } else {
        format!("{}:{}", tag, DEFAULT_TAG)
    };

    ImageReference::parse(&expanded)?.validate()?;
    Ok(Some(expanded))
}
