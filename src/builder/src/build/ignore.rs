//! `.dockerignore` matching for the build context.

use std::path::{Component, Path};

use glob::{MatchOptions, Pattern};
use kiln_core::error::{KilnError, Result};

use crate::fsutil::clean_path;

pub const IGNORE_FILE: &str = ".dockerignore";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug)]
struct Rule {
    pattern: Pattern,
    /// `false` for `!pattern` exceptions
    exclude: bool,
}

/// Compiled ignore rules. The last matching rule wins, and a path is
/// matched when the path itself or any of its parent directories is.
#[derive(Debug, Default)]
pub struct IgnoreMatcher {
    rules: Vec<Rule>,
    keep: Vec<String>,
}

impl IgnoreMatcher {
    /// Load `<context>/.dockerignore`; a missing file ignores nothing.
    ///
    /// The ignore file and `dockerfile` (relative to the context) stay
    /// copyable whatever the patterns say.
    pub fn load(context_dir: &Path, dockerfile: Option<&Path>) -> Result<Self> {
        let path = context_dir.join(IGNORE_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(KilnError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to read {}: {}", path.display(), e),
                )))
            }
        };

        let mut matcher = Self::from_patterns(&content)?;
        matcher.keep.push(IGNORE_FILE.to_string());
        if let Some(rel) = dockerfile.and_then(|d| d.strip_prefix(context_dir).ok()) {
            matcher.keep.push(rel.to_string_lossy().into_owned());
        }
        tracing::debug!(rules = matcher.rules.len(), "Loaded ignore rules");
        Ok(matcher)
    }

    /// Compile patterns, one per line. Blank lines and `#` comments are skipped.
    pub fn from_patterns(content: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (exclude, text) = match line.strip_prefix('!') {
                Some(rest) => (false, rest.trim()),
                None => (true, line),
            };
            let cleaned = clean_path(text);
            let cleaned = cleaned.trim_start_matches('/');
            if cleaned.is_empty() {
                continue;
            }
            let pattern = Pattern::new(cleaned).map_err(|e| {
                KilnError::Semantic(format!("invalid {} pattern {:?}: {}", IGNORE_FILE, text, e))
            })?;
            rules.push(Rule { pattern, exclude });
        }
        Ok(Self {
            rules,
            keep: Vec::new(),
        })
    }

    /// Whether `rel` (relative to the context root) is excluded.
    pub fn is_excluded(&self, rel: &Path) -> bool {
        let rel = rel.to_string_lossy();
        let rel = clean_path(&rel);
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() || self.keep.iter().any(|k| k == rel) {
            return false;
        }

        let prefixes = ancestors_and_self(Path::new(rel));
        let mut excluded = false;
        for rule in &self.rules {
            if prefixes
                .iter()
                .any(|p| rule.pattern.matches_with(p, MATCH_OPTIONS))
            {
                excluded = rule.exclude;
            }
        }
        excluded
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// `a`, `a/b`, `a/b/c` for `a/b/c`.
fn ancestors_and_self(path: &Path) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for component in path.components() {
        if let Component::Normal(part) = component {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(&part.to_string_lossy());
            prefixes.push(current.clone());
        }
    }
    prefixes
}
