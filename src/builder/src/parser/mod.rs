//! Dockerfile parser.
//!
//! Turns Dockerfile text into a [`PlayBook`]: one [`Page`] per build
//! stage, each holding the structured [`Line`]s of that stage.
//!
//! ```text
//! text ─► directive ─► preprocess ─► grammar ─► playbook
//!        (# escape=)  (logical lines) (Line/Cell)  (Pages)
//! ```

mod directive;
pub mod expand;
mod flags;
mod grammar;
mod playbook;
mod preprocess;

use std::collections::HashMap;
use std::fmt;

use kiln_core::error::{KilnError, Result};

pub use directive::{new_directive, DEFAULT_ESCAPE};
pub use expand::resolve_param;
pub use flags::parse_duration;
pub use playbook::{Page, PlayBook};
pub use preprocess::{preprocess, LogicalLine};

/// Flag attached to lines whose arguments were given in JSON-array form.
pub const ATTRIBUTE_FLAG: &str = "attribute";

/// Dockerfile instruction keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Add,
    Arg,
    Cmd,
    Copy,
    Entrypoint,
    Env,
    Expose,
    From,
    Healthcheck,
    Label,
    Maintainer,
    Onbuild,
    Run,
    Shell,
    Stopsignal,
    User,
    Volume,
    Workdir,
}

impl Keyword {
    /// Every instruction keyword, in alphabetical order.
    pub const ALL: [Keyword; 18] = [
        Keyword::Add,
        Keyword::Arg,
        Keyword::Cmd,
        Keyword::Copy,
        Keyword::Entrypoint,
        Keyword::Env,
        Keyword::Expose,
        Keyword::From,
        Keyword::Healthcheck,
        Keyword::Label,
        Keyword::Maintainer,
        Keyword::Onbuild,
        Keyword::Run,
        Keyword::Shell,
        Keyword::Stopsignal,
        Keyword::User,
        Keyword::Volume,
        Keyword::Workdir,
    ];

    /// Upper-case spelling used in Dockerfiles.
    pub fn as_str(&self) -> &'static str {
        match self {
            Keyword::Add => "ADD",
            Keyword::Arg => "ARG",
            Keyword::Cmd => "CMD",
            Keyword::Copy => "COPY",
            Keyword::Entrypoint => "ENTRYPOINT",
            Keyword::Env => "ENV",
            Keyword::Expose => "EXPOSE",
            Keyword::From => "FROM",
            Keyword::Healthcheck => "HEALTHCHECK",
            Keyword::Label => "LABEL",
            Keyword::Maintainer => "MAINTAINER",
            Keyword::Onbuild => "ONBUILD",
            Keyword::Run => "RUN",
            Keyword::Shell => "SHELL",
            Keyword::Stopsignal => "STOPSIGNAL",
            Keyword::User => "USER",
            Keyword::Volume => "VOLUME",
            Keyword::Workdir => "WORKDIR",
        }
    }

    /// Look up a keyword, ignoring case.
    pub fn lookup(word: &str) -> Option<Keyword> {
        Keyword::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(word))
    }

    /// Whether the instruction's cells go through word expansion before
    /// dispatch. CMD, ENTRYPOINT, RUN and SHELL take their arguments literally.
    pub fn expands_words(&self) -> bool {
        matches!(
            self,
            Keyword::Add
                | Keyword::Arg
                | Keyword::Copy
                | Keyword::Env
                | Keyword::Expose
                | Keyword::Label
                | Keyword::Stopsignal
                | Keyword::User
                | Keyword::Volume
                | Keyword::Workdir
        )
    }

    /// Whether the instruction may be wrapped by ONBUILD.
    pub fn allowed_in_onbuild(&self) -> bool {
        !matches!(
            self,
            Keyword::Onbuild | Keyword::From | Keyword::Maintainer
        )
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One token of an instruction's arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub value: String,
}

impl Cell {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// One logical Dockerfile instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    /// First physical line (1-based)
    pub begin: usize,
    /// Last physical line consumed by continuations
    pub end: usize,
    /// Instruction keyword
    pub command: Keyword,
    /// Argument text as written, flags included
    pub raw: String,
    /// Parsed arguments
    pub cells: Vec<Cell>,
    /// Recognized `--flag=value` options plus `attribute=json`
    pub flags: HashMap<String, String>,
    /// Embedded instruction: the trigger of an ONBUILD, or the command of
    /// `HEALTHCHECK CMD` (absent for `HEALTHCHECK NONE`)
    pub embedded: Option<Box<Line>>,
}

impl Line {
    pub(crate) fn new(command: Keyword, raw: &str, begin: usize, end: usize) -> Self {
        Self {
            begin,
            end,
            command,
            raw: raw.to_string(),
            cells: Vec::new(),
            flags: HashMap::new(),
            embedded: None,
        }
    }

    /// Whether the arguments were given as a JSON array.
    pub fn is_json(&self) -> bool {
        self.flags.get(ATTRIBUTE_FLAG).map(String::as_str) == Some("json")
    }

    /// Value of a `--name=value` flag.
    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(String::as_str)
    }

    /// Cell values in order.
    pub fn values(&self) -> Vec<String> {
        self.cells.iter().map(|c| c.value.clone()).collect()
    }

    /// `COMMAND raw` as it appears in the Dockerfile.
    pub fn text(&self) -> String {
        format!("{} {}", self.command, self.raw)
    }
}

/// Parse a complete Dockerfile into a [`PlayBook`].
pub fn parse_dockerfile(content: &str) -> Result<PlayBook> {
    let escape = new_directive(content)?;
    let logical = preprocess(content, escape)?;

    let mut lines = Vec::with_capacity(logical.len());
    let mut warnings = Vec::new();
    for logical_line in &logical {
        let line = grammar::parse_line(logical_line)?;
        if line.command == Keyword::Maintainer {
            warnings.push(format!(
                "line {}: MAINTAINER is deprecated, use LABEL maintainer=... instead",
                line.begin
            ));
        }
        lines.push(line);
    }

    tracing::debug!(lines = lines.len(), escape = %escape, "Parsed Dockerfile lines");
    playbook::assemble(lines, warnings)
}

/// Parse one ONBUILD trigger (e.g. `RUN make`) stored in an image config.
///
/// The returned line carries the given source position so errors point
/// at the FROM that pulled the trigger in.
pub fn parse_trigger(text: &str, begin: usize, end: usize) -> Result<Line> {
    let logical = preprocess(text, DEFAULT_ESCAPE)?;
    let [single] = logical.as_slice() else {
        return Err(KilnError::Semantic(format!(
            "ONBUILD trigger must be a single instruction: {:?}",
            text
        )));
    };

    let mut line = grammar::parse_line(single)?;
    if !line.command.allowed_in_onbuild() {
        return Err(KilnError::Semantic(format!(
            "{} is not allowed as an ONBUILD trigger",
            line.command
        )));
    }
    line.begin = begin;
    line.end = end;
    Ok(line)
}
