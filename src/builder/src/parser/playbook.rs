//! Grouping of parsed lines into build stages.

use std::collections::HashMap;

use kiln_core::error::{KilnError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use super::{Keyword, Line};

static STAGE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").expect("valid stage name regex")
});

/// One build stage: a FROM line and everything up to the next FROM.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// `AS` alias, or the stage index as a string
    pub name: String,
    pub lines: Vec<Line>,
    pub begin: usize,
    pub end: usize,
    /// Whether the stage's container must be committed to a new image
    pub need_commit: bool,
}

impl Page {
    fn open(name: String, from: Line) -> Self {
        Self {
            name,
            begin: from.begin,
            end: from.end,
            lines: vec![from],
            need_commit: false,
        }
    }

    fn push(&mut self, line: Line) {
        self.end = line.end;
        self.lines.push(line);
    }

    /// The stage's FROM line.
    pub fn from_line(&self) -> Option<&Line> {
        self.lines.first().filter(|l| l.command == Keyword::From)
    }

    fn has_instructions(&self) -> bool {
        self.lines.len() > 1
    }
}

/// A parsed Dockerfile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayBook {
    pub pages: Vec<Page>,
    /// ARG lines declared before the first FROM
    pub heading_args: Vec<Line>,
    /// Non-fatal parser findings
    pub warnings: Vec<String>,
    /// `AS` alias to stage index
    pub aliases: HashMap<String, usize>,
}

impl PlayBook {
    /// Stage index for an explicit `AS` alias.
    pub fn alias_index(&self, name: &str) -> Option<usize> {
        self.aliases.get(name).copied()
    }

    /// Stage index for an alias or a numeric stage index.
    pub fn stage_index(&self, reference: &str) -> Option<usize> {
        self.alias_index(reference).or_else(|| {
            reference
                .parse::<usize>()
                .ok()
                .filter(|idx| *idx < self.pages.len())
        })
    }
}

/// Build the [`PlayBook`] from parsed lines.
pub(crate) fn assemble(lines: Vec<Line>, warnings: Vec<String>) -> Result<PlayBook> {
    let mut book = PlayBook {
        warnings,
        ..PlayBook::default()
    };
    let mut current: Option<Page> = None;

    for line in lines {
        if line.command != Keyword::From {
            match current.as_mut() {
                Some(page) => page.push(line),
                None if line.command == Keyword::Arg => book.heading_args.push(line),
                None => {
                    return Err(KilnError::syntax(
                        line.begin,
                        format!("{} is not allowed before the first FROM", line.command),
                    ))
                }
            }
            continue;
        }

        if let Some(page) = current.take() {
            book.pages.push(page);
        }
        let index = book.pages.len();

        // `FROM <alias>` of an earlier stage makes that stage a dependency.
        if let Some(dep) = line.cells.first().and_then(|c| book.alias_index(&c.value)) {
            let page = &mut book.pages[dep];
            page.need_commit = page.has_instructions();
        }

        let name = match line.cells.get(2) {
            Some(alias) => {
                let alias = alias.value.clone();
                if !STAGE_NAME_RE.is_match(&alias) {
                    return Err(KilnError::Semantic(format!(
                        "line {}: invalid stage name {:?}",
                        line.begin, alias
                    )));
                }
                if book.aliases.contains_key(&alias) {
                    return Err(KilnError::Semantic(format!(
                        "line {}: duplicate stage name {:?}",
                        line.begin, alias
                    )));
                }
                book.aliases.insert(alias.clone(), index);
                alias
            }
            None => index.to_string(),
        };
        current = Some(Page::open(name, line));
    }

    let Some(mut last) = current else {
        return Err(KilnError::Semantic(
            "Dockerfile has no FROM instruction".to_string(),
        ));
    };
    last.need_commit = last.has_instructions();
    book.pages.push(last);

    mark_copy_dependencies(&mut book);
    Ok(book)
}

/// Stages named literally by a later `COPY --from` need a commit too.
fn mark_copy_dependencies(book: &mut PlayBook) {
    let mut deps = Vec::new();
    for (idx, page) in book.pages.iter().enumerate() {
        for line in &page.lines {
            if line.command != Keyword::Copy {
                continue;
            }
            if let Some(dep) = line.flag("from").and_then(|f| book.stage_index(f)) {
                if dep < idx {
                    deps.push(dep);
                }
            }
        }
    }
    for dep in deps {
        let page = &mut book.pages[dep];
        page.need_commit = page.has_instructions();
    }
}
