//! ARG and ENV scoping.
//!
//! [`ArgRegistry`] holds the build-wide view: `--build-arg` values, the
//! resolved heading ARGs and the set of build args nobody consumed yet.
//! [`Scope`] is the per-stage view that every instruction snapshots before
//! it runs, so later ARG/ENV lines never leak into earlier instructions.
//!
//! Lookup order inside a stage is ENV, then stage ARG, then the reserved
//! proxy args.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use kiln_core::error::Result;

use crate::parser::{resolve_param, Line};

/// Proxy-style args available to every stage without an ARG declaration.
pub const RESERVED_ARGS: &[&str] = &[
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "FTP_PROXY",
    "ftp_proxy",
    "NO_PROXY",
    "no_proxy",
    "ALL_PROXY",
    "all_proxy",
];

/// Build-wide argument state.
#[derive(Debug, Default)]
pub struct ArgRegistry {
    build_args: HashMap<String, String>,
    reserved: BTreeMap<String, String>,
    /// Heading ARG name → resolved value (`None` for a bare `ARG name`)
    heading: HashMap<String, Option<String>>,
    unused: BTreeSet<String>,
}

impl ArgRegistry {
    pub fn new(build_args: HashMap<String, String>) -> Self {
        let reserved: BTreeMap<String, String> = build_args
            .iter()
            .filter(|(k, _)| RESERVED_ARGS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let unused = build_args
            .keys()
            .filter(|k| !reserved.contains_key(*k))
            .cloned()
            .collect();
        Self {
            build_args,
            reserved,
            heading: HashMap::new(),
            unused,
        }
    }

    /// Resolve the ARG lines declared before the first FROM.
    ///
    /// A `--build-arg` overrides the declared default; defaults may refer
    /// to heading ARGs declared earlier.
    pub fn resolve_heading(&mut self, lines: &[Line]) -> Result<()> {
        for line in lines {
            let Some(key) = line.cells.first().map(|c| c.value.clone()) else {
                continue;
            };
            let value = match self.take_build_arg(&key) {
                Some(value) => Some(value),
                None => match line.cells.get(1) {
                    Some(default) => Some(resolve_param(&default.value, false, &|name: &str| {
                        self.heading_value(name)
                    })?),
                    None => None,
                },
            };
            tracing::debug!(arg = %key, ?value, "Heading ARG");
            self.heading.insert(key, value);
        }
        Ok(())
    }

    /// Value of a heading ARG, as seen by FROM lines.
    pub fn heading_value(&self, name: &str) -> Option<String> {
        self.heading.get(name).cloned().flatten()
    }

    /// Consume a `--build-arg`, marking it used.
    pub fn take_build_arg(&mut self, key: &str) -> Option<String> {
        let value = self.build_args.get(key).cloned();
        if value.is_some() {
            self.unused.remove(key);
        }
        value
    }

    pub fn reserved(&self) -> &BTreeMap<String, String> {
        &self.reserved
    }

    /// Build args nobody declared, sorted.
    pub fn unused(&self) -> Vec<String> {
        self.unused.iter().cloned().collect()
    }

    /// Warning line for unconsumed build args, if any.
    pub fn unused_warning(&self) -> Option<String> {
        if self.unused.is_empty() {
            return None;
        }
        Some(format!(
            "[Warning] One or more build-args [{}] were not consumed",
            self.unused().join(" ")
        ))
    }
}

/// Variables visible to one instruction of a stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    /// Declared stage ARGs; `None` for a bare declaration with no value
    args: BTreeMap<String, Option<String>>,
    env: BTreeMap<String, String>,
    reserved: BTreeMap<String, String>,
}

impl Scope {
    /// Scope for a new stage, seeded with the base image environment.
    pub fn new(env: Vec<(String, String)>, reserved: &BTreeMap<String, String>) -> Self {
        Self {
            args: BTreeMap::new(),
            env: env.into_iter().collect(),
            reserved: reserved.clone(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        self.env
            .get(name)
            .cloned()
            .or_else(|| self.args.get(name).cloned().flatten())
            .or_else(|| self.reserved.get(name).cloned())
    }

    /// Expand a word against this scope.
    pub fn expand(&self, word: &str, strict: bool) -> Result<String> {
        resolve_param(word, strict, &|name: &str| self.lookup(name))
    }

    /// Apply `ARG key[=default]`.
    ///
    /// Precedence: `--build-arg`, then the value given here (or by an
    /// earlier ARG of this stage), then the heading ARG default.
    pub fn declare_arg(&mut self, key: &str, default: Option<String>, registry: &mut ArgRegistry) {
        let value = registry
            .take_build_arg(key)
            .or(default)
            .or_else(|| self.args.get(key).cloned().flatten())
            .or_else(|| registry.heading_value(key));
        self.args.insert(key.to_string(), value);
    }

    /// Apply `ENV key=value`. The key stops being an ARG for later lines.
    pub fn set_env(&mut self, key: &str, value: &str) {
        self.args.remove(key);
        self.env.insert(key.to_string(), value.to_string());
    }

    pub fn arg(&self, key: &str) -> Option<String> {
        self.args.get(key).cloned().flatten()
    }

    pub fn has_arg(&self, key: &str) -> bool {
        self.args.contains_key(key)
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// `KEY=value` entries for a RUN process: stage ARGs and reserved args
    /// not shadowed by the image environment.
    pub fn run_args(&self, image_env: &[(String, String)]) -> Vec<String> {
        let shadowed = |key: &str| image_env.iter().any(|(k, _)| k == key);
        let mut entries: BTreeMap<&str, &str> = BTreeMap::new();
        for (key, value) in &self.reserved {
            entries.insert(key, value);
        }
        for (key, value) in &self.args {
            if let Some(value) = value {
                entries.insert(key, value);
            }
        }
        entries
            .into_iter()
            .filter(|(k, _)| !shadowed(k))
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_dockerfile;

    fn build_args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn heading(dockerfile: &str, args: &[(&str, &str)]) -> ArgRegistry {
        let book = parse_dockerfile(dockerfile).unwrap();
        let mut registry = ArgRegistry::new(build_args(args));
        registry.resolve_heading(&book.heading_args).unwrap();
        registry
    }

    #[test]
    fn test_heading_default_needs_redeclaration() {
        let mut registry = heading(
            "ARG testArg=0.1\nFROM alpine\n",
            &[("HTTPS_PROXY", "127.0.0.1")],
        );
        let mut scope = Scope::new(Vec::new(), registry.reserved());
        assert_eq!(scope.lookup("testArg"), None);

        scope.declare_arg("testArg", None, &mut registry);
        assert_eq!(scope.lookup("testArg").as_deref(), Some("0.1"));
        assert_eq!(scope.lookup("HTTPS_PROXY").as_deref(), Some("127.0.0.1"));
        assert!(registry.unused().is_empty());
    }

    #[test]
    fn test_build_arg_wins_and_is_consumed() {
        let mut registry = heading("FROM alpine\n", &[("testArg2", "arg2"), ("other", "x")]);
        let mut scope = Scope::new(Vec::new(), registry.reserved());

        scope.declare_arg("testArg2", Some("foo".to_string()), &mut registry);
        assert_eq!(scope.lookup("testArg2").as_deref(), Some("arg2"));
        assert_eq!(registry.unused(), vec!["other"]);
        assert_eq!(
            registry.unused_warning().unwrap(),
            "[Warning] One or more build-args [other] were not consumed"
        );
    }

    #[test]
    fn test_heading_build_arg_override_and_chaining() {
        let registry = heading(
            "ARG BASE=alpine\nARG TAG=3\nARG IMAGE=${BASE}:${TAG}\nFROM $IMAGE\n",
            &[("TAG", "3.19")],
        );
        assert_eq!(registry.heading_value("IMAGE").as_deref(), Some("alpine:3.19"));
        assert!(registry.unused().is_empty());
    }

    #[test]
    fn test_stage_override_kept_by_bare_redeclaration() {
        let mut registry = heading("ARG V=heading\nFROM alpine\n", &[]);
        let mut scope = Scope::new(Vec::new(), registry.reserved());
        scope.declare_arg("V", Some("stage".to_string()), &mut registry);
        scope.declare_arg("V", None, &mut registry);
        assert_eq!(scope.arg("V").as_deref(), Some("stage"));
    }

    #[test]
    fn test_bare_arg_without_value_is_undefined() {
        let mut registry = ArgRegistry::new(HashMap::new());
        let mut scope = Scope::new(Vec::new(), registry.reserved());
        scope.declare_arg("NOTHING", None, &mut registry);
        assert!(scope.has_arg("NOTHING"));
        assert_eq!(scope.lookup("NOTHING"), None);
    }

    #[test]
    fn test_env_shadows_arg() {
        let mut registry = ArgRegistry::new(build_args(&[("testArg", "0.5")]));
        let mut scope = Scope::new(Vec::new(), registry.reserved());
        scope.declare_arg("testArg", None, &mut registry);
        let before = scope.clone();

        scope.set_env("testArg", "1.0");
        assert!(!scope.has_arg("testArg"));
        assert_eq!(scope.env("testArg"), Some("1.0"));
        assert_eq!(scope.lookup("testArg").as_deref(), Some("1.0"));
        // snapshots taken earlier are unaffected
        assert_eq!(before.lookup("testArg").as_deref(), Some("0.5"));
    }

    #[test]
    fn test_base_env_seeds_scope() {
        let scope = Scope::new(
            vec![("PATH".to_string(), "/bin".to_string())],
            &BTreeMap::new(),
        );
        assert_eq!(scope.expand("$PATH:/opt", false).unwrap(), "/bin:/opt");
        assert!(scope.expand("${MISSING}", true).is_err());
    }

    #[test]
    fn test_run_args() {
        let mut registry = ArgRegistry::new(build_args(&[("http_proxy", "p"), ("A", "1")]));
        let mut scope = Scope::new(Vec::new(), registry.reserved());
        scope.declare_arg("A", None, &mut registry);
        scope.declare_arg("B", Some("2".to_string()), &mut registry);

        let env = vec![("B".to_string(), "env".to_string())];
        assert_eq!(scope.run_args(&env), vec!["A=1", "http_proxy=p"]);
    }
}
